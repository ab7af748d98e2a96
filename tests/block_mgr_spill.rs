mod common;

use common::make_block_mgr;
use test_log::test;

const BLOCK_SIZE: usize = 8 * 1024;

#[test]
fn block_mgr_budget_and_eviction() -> spill_engine::Result<()> {
    // Four buffers worth of memory; the client's reservation exceeds it
    // so every request stays "required"
    let mgr = make_block_mgr(1, 4, BLOCK_SIZE)?;
    let client = mgr.register_client(6, None);

    let mut blocks = vec![];
    for i in 0..4u8 {
        let block = mgr
            .get_new_block(client, None, None)?
            .expect("within budget");
        block.allocate(BLOCK_SIZE)?;
        block.write_at(0, &[i; 64])?;
        blocks.push(block);
    }
    assert_eq!(4, mgr.num_pinned_buffers(client));

    // Nothing left and nothing to evict
    assert!(matches!(
        mgr.get_new_block(client, None, None),
        Err(spill_engine::Error::MemLimitExceeded(_))
    ));

    // With one block unpinned, the next request succeeds by evicting it
    blocks.first().expect("four blocks").unpin()?;

    let fifth = mgr
        .get_new_block(client, None, None)?
        .expect("eviction frees a buffer");
    assert!(fifth.is_pinned());
    assert_eq!(4, mgr.num_pinned_buffers(client));

    // The evicted block was persisted on its way out
    assert!(mgr.writes_issued() >= 1);

    // Bring the evicted block back and check its payload survived the
    // disk round trip
    fifth.delete()?;
    let first = blocks.first().expect("four blocks");
    assert!(first.pin()?);
    let head = first.with_data(|data| data.get(..64).map(<[u8]>::to_vec))?;
    assert_eq!(Some(vec![0u8; 64]), head);

    Ok(())
}

#[test]
fn block_mgr_optional_requests_degrade_gracefully() -> spill_engine::Result<()> {
    let mgr = make_block_mgr(1, 4, BLOCK_SIZE)?;
    let client = mgr.register_client(2, None);

    // Two required plus two optional pins fill the pool
    let mut blocks = vec![];
    for _ in 0..4 {
        blocks.push(
            mgr.get_new_block(client, None, None)?
                .expect("within budget"),
        );
    }

    // A fifth optional request is a soft failure, not an error
    assert!(mgr.get_new_block(client, None, None)?.is_none());

    Ok(())
}

#[test]
fn block_mgr_buffer_transfer_persists_old_block() -> spill_engine::Result<()> {
    // One buffer total: a new block can only be had by handing over the
    // old block's buffer after its contents hit disk
    let mgr = make_block_mgr(1, 1, BLOCK_SIZE)?;
    let client = mgr.register_client(1, None);

    let old = mgr.get_new_block(client, None, None)?.expect("first block");
    old.allocate(BLOCK_SIZE)?;
    old.write_at(0, b"spilled payload")?;

    let new = mgr
        .get_new_block(client, Some(&old), None)?
        .expect("buffer is transferred");
    assert!(new.is_pinned());
    assert!(!old.is_pinned());
    assert_eq!(0, old.buffer_len());
    assert_eq!(1, mgr.writes_issued());

    // Swap back: the old block is read back from its spill range
    new.unpin()?;
    assert!(old.pin()?);

    let payload = old.with_data(|data| data.get(..15).map(<[u8]>::to_vec))?;
    assert_eq!(Some(b"spilled payload".to_vec()), payload);

    Ok(())
}
