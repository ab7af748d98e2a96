// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

/// Hierarchical memory accounting.
///
/// A tracker tracks the memory consumption of one subsystem (a query, an
/// operator, the block manager). Consumption propagates up the parent chain,
/// and limits are enforced at every level that declares one.
///
/// Limits are soft bookkeeping: `try_consume` refuses to go over, while
/// `consume` records unconditionally (for memory that is already committed).
pub struct MemTracker {
    label: String,

    /// Byte limit, or unlimited if negative
    limit: i64,

    consumption: AtomicI64,

    parent: Option<Arc<MemTracker>>,
}

impl std::fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MemTracker({:?}, {}/{})",
            self.label,
            self.consumption(),
            self.limit,
        )
    }
}

impl MemTracker {
    /// Creates a root tracker without a parent.
    #[must_use]
    pub fn root(label: &str, limit: i64) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            consumption: AtomicI64::new(0),
            parent: None,
        })
    }

    /// Creates a tracker below `parent`.
    #[must_use]
    pub fn with_parent(label: &str, limit: i64, parent: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            consumption: AtomicI64::new(0),
            parent: Some(parent.clone()),
        })
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn limit(&self) -> i64 {
        self.limit
    }

    #[must_use]
    pub fn has_limit(&self) -> bool {
        self.limit >= 0
    }

    #[must_use]
    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }

    /// Records `bytes` on this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        let mut cur = Some(self);
        while let Some(t) = cur {
            t.consumption.fetch_add(bytes, Ordering::AcqRel);
            cur = t.parent.as_deref();
        }
    }

    /// Releases `bytes` from this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        self.consume(-bytes);
    }

    /// Tries to record `bytes` without exceeding any limit in the chain.
    ///
    /// Either all trackers are updated, or none are.
    #[must_use]
    pub fn try_consume(&self, bytes: i64) -> bool {
        debug_assert!(bytes >= 0);

        let mut consumed: Vec<&MemTracker> = vec![];
        let mut cur = Some(self);

        while let Some(t) = cur {
            let new_total = t.consumption.fetch_add(bytes, Ordering::AcqRel) + bytes;

            if t.has_limit() && new_total > t.limit {
                t.consumption.fetch_sub(bytes, Ordering::AcqRel);
                for done in consumed {
                    done.consumption.fetch_sub(bytes, Ordering::AcqRel);
                }
                return false;
            }

            consumed.push(t);
            cur = t.parent.as_deref();
        }

        true
    }

    /// Records `bytes` on this tracker and its ancestors up to, but not
    /// including, `end_ancestor`.
    ///
    /// Used when memory logically moves between two trackers that share an
    /// ancestor: the shared part of the chain must not be double counted.
    pub fn consume_local(&self, bytes: i64, end_ancestor: &MemTracker) {
        let mut cur = Some(self);
        while let Some(t) = cur {
            if std::ptr::eq(t, end_ancestor) {
                break;
            }
            t.consumption.fetch_add(bytes, Ordering::AcqRel);
            cur = t.parent.as_deref();
        }
    }

    /// Inverse of [`MemTracker::consume_local`].
    pub fn release_local(&self, bytes: i64, end_ancestor: &MemTracker) {
        self.consume_local(-bytes, end_ancestor);
    }

    /// Returns `true` if this tracker or any ancestor is over its limit.
    #[must_use]
    pub fn limit_exceeded(&self) -> bool {
        let mut cur = Some(self);
        while let Some(t) = cur {
            if t.has_limit() && t.consumption() > t.limit {
                return true;
            }
            cur = t.parent.as_deref();
        }
        false
    }

    /// Smallest remaining capacity along the ancestor chain.
    ///
    /// Unlimited chains report `i64::MAX`.
    #[must_use]
    pub fn spare_capacity(&self) -> i64 {
        let mut spare = i64::MAX;
        let mut cur = Some(self);
        while let Some(t) = cur {
            if t.has_limit() {
                spare = spare.min(t.limit - t.consumption());
            }
            cur = t.parent.as_deref();
        }
        spare
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn mem_tracker_consume_release() {
        let root = MemTracker::root("root", 100);
        let child = MemTracker::with_parent("child", -1, &root);

        child.consume(40);
        assert_eq!(40, child.consumption());
        assert_eq!(40, root.consumption());

        child.release(40);
        assert_eq!(0, child.consumption());
        assert_eq!(0, root.consumption());
    }

    #[test]
    fn mem_tracker_try_consume_respects_limit() {
        let root = MemTracker::root("root", 100);
        let child = MemTracker::with_parent("child", -1, &root);

        assert!(child.try_consume(60));
        assert!(!child.try_consume(60));

        // Failed attempt must not leak partial consumption
        assert_eq!(60, child.consumption());
        assert_eq!(60, root.consumption());

        assert!(child.try_consume(40));
        assert_eq!(100, root.consumption());
        assert!(!root.limit_exceeded());
        assert_eq!(0, root.spare_capacity());
    }

    #[test]
    fn mem_tracker_consume_local_stops_at_ancestor() {
        let root = MemTracker::root("root", -1);
        let mgr = MemTracker::with_parent("mgr", -1, &root);
        let client = MemTracker::with_parent("client", -1, &root);

        // Block manager owns the buffer; client tracker only mirrors it
        mgr.consume(10);
        client.consume_local(10, &root);

        assert_eq!(10, mgr.consumption());
        assert_eq!(10, client.consumption());
        assert_eq!(10, root.consumption());

        client.release_local(10, &root);
        assert_eq!(0, client.consumption());
        assert_eq!(10, root.consumption());
    }
}
