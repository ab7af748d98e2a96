mod common;

use common::make_block_mgr;
use spill_engine::{
    row::{ColumnType, Row, RowDescriptor, SlotDescriptor, Tuple, TupleDescriptor, Value},
    BufferedTupleStream, RowBatch,
};
use test_log::test;

const BLOCK_SIZE: usize = 256 * 1024;

fn desc() -> RowDescriptor {
    RowDescriptor::new(vec![TupleDescriptor::new(vec![
        SlotDescriptor::new(ColumnType::BigInt, vec![0]),
        SlotDescriptor::new(ColumnType::String, vec![1]),
    ])])
}

fn row(i: i64) -> Row {
    Row::single(Tuple {
        values: vec![
            Value::BigInt(i),
            Value::String(format!("payload-{i}").repeat(64).into_bytes()),
        ],
    })
}

#[test]
fn tuple_stream_spills_and_reads_back() -> spill_engine::Result<()> {
    // Four buffers of budget, an unpinned stream: sealed blocks get
    // evicted to disk while the stream keeps appending
    let mgr = make_block_mgr(2, 4, BLOCK_SIZE)?;
    let client = mgr.register_client(2, None);

    let mut stream = BufferedTupleStream::new(desc(), mgr.clone(), client, false, false);
    stream.init(false)?;

    let num_rows: i64 = 4_000;
    for i in 0..num_rows {
        assert!(stream.add_row(&row(i))?, "unpinned streams spill instead of failing");
    }

    assert!(stream.num_blocks() > 4, "the stream outgrew the memory budget");
    assert!(mgr.writes_issued() > 0, "cold blocks went to disk");

    assert!(stream.prepare_for_read(false)?);

    let mut batch = RowBatch::new(256);
    let mut next_expected = 0i64;
    loop {
        batch.clear();
        let eos = stream.get_next(&mut batch, None)?;
        for got in batch.rows() {
            assert_eq!(&row(next_expected), got);
            next_expected += 1;
        }
        if eos {
            break;
        }
    }
    assert_eq!(num_rows, next_expected);

    stream.close();
    Ok(())
}

#[test]
fn tuple_stream_delete_on_read_releases_blocks() -> spill_engine::Result<()> {
    let mgr = make_block_mgr(1, -1, 64 * 1024)?;
    let client = mgr.register_client(2, None);

    let mut stream = BufferedTupleStream::new(desc(), mgr, client, false, false);
    stream.init(true)?;

    for i in 0..2_000 {
        assert!(stream.add_row(&row(i))?);
    }

    let initial_blocks = stream.num_blocks();
    assert!(initial_blocks > 2);

    assert!(stream.prepare_for_read(true)?);

    // Every crossed block boundary must hand exactly one block (and its
    // buffer) back before the next one is pinned
    let mut seen_block_counts = vec![stream.num_blocks()];
    let mut batch = RowBatch::new(64);

    loop {
        batch.clear();
        let eos = stream.get_next(&mut batch, None)?;

        let current = stream.num_blocks();
        let last = *seen_block_counts.last().expect("non-empty");
        assert!(last - current <= 1, "blocks are released one at a time");
        if current != last {
            seen_block_counts.push(current);
        }

        if eos {
            break;
        }
    }

    assert_eq!(
        initial_blocks,
        seen_block_counts.len(),
        "every block except the last was popped during the read",
    );
    assert_eq!(1, stream.num_blocks());

    stream.close();
    Ok(())
}
