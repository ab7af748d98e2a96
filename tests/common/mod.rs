use spill_engine::{BlockMgrRegistry, BufferedBlockMgr, IoManager, MemTracker, TmpFileMgr};
use std::sync::Arc;

/// Spins up a block manager over `num_devices` spill devices with room
/// for `limit_blocks` blocks of `block_size` bytes (negative = unlimited).
#[allow(dead_code)]
pub fn make_block_mgr(
    num_devices: usize,
    limit_blocks: i64,
    block_size: usize,
) -> spill_engine::Result<Arc<BufferedBlockMgr>> {
    let io = IoManager::new(num_devices);
    let tmp = Arc::new(TmpFileMgr::new(num_devices)?);
    let tracker = MemTracker::root("query", -1);
    let registry = BlockMgrRegistry::new();

    let limit = if limit_blocks < 0 {
        -1
    } else {
        limit_blocks * block_size as i64
    };

    let mgr = registry.create(rand::random::<u64>(), &tracker, limit, block_size, &io, &tmp);

    // The returned manager only stores paths into the temp directory, not
    // the `TmpFileMgr` itself, so the directory must outlive this helper.
    std::mem::forget(tmp);

    mgr
}
