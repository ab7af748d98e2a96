mod common;

use common::make_block_mgr;
use spill_engine::{
    row::{ColumnType, Row, RowDescriptor, SlotDescriptor, Tuple, TupleDescriptor, Value},
    BufferedTupleStream, RowBatch, RowIdx,
};
use test_log::test;

fn desc() -> RowDescriptor {
    RowDescriptor::new(vec![TupleDescriptor::new(vec![
        SlotDescriptor::new(ColumnType::Int, vec![0]),
        SlotDescriptor::new(ColumnType::String, vec![1]),
    ])])
}

fn row(i: i32) -> Row {
    Row::single(Tuple {
        values: vec![
            Value::Int(i),
            Value::String(format!("row-{i}").into_bytes()),
        ],
    })
}

#[test]
fn tuple_stream_pin_and_rescan() -> spill_engine::Result<()> {
    let mgr = make_block_mgr(1, 8, 64 * 1024)?;
    let client = mgr.register_client(4, None);

    let mut stream = BufferedTupleStream::new(desc(), mgr, client, false, false);
    stream.init(false)?;

    for i in 0..3_000 {
        assert!(stream.add_row(&row(i))?);
    }

    // Re-pin everything for a rescan; the reservation check may refuse,
    // in which case nothing changes
    let all_rows = stream.get_rows()?.expect("budget covers the stream");
    assert_eq!(3_000, all_rows.len());
    for (i, got) in all_rows.iter().enumerate() {
        assert_eq!(&row(i as i32), got);
    }

    // A pinned stream can be scanned again
    assert!(stream.prepare_for_read(false)?);
    let mut batch = RowBatch::new(512);
    let mut count = 0;
    loop {
        batch.clear();
        let eos = stream.get_next(&mut batch, None)?;
        count += batch.num_rows();
        if eos {
            break;
        }
    }
    assert_eq!(3_000, count);

    stream.close();
    Ok(())
}

#[test]
fn tuple_stream_row_indices_address_rows() -> spill_engine::Result<()> {
    let mgr = make_block_mgr(1, -1, 64 * 1024)?;
    let client = mgr.register_client(2, None);

    let mut stream = BufferedTupleStream::new(desc(), mgr, client, false, false);
    stream.init(true)?;

    for i in 0..2_000 {
        assert!(stream.add_row(&row(i))?);
    }

    assert!(stream.prepare_for_read(false)?);

    let mut batch = RowBatch::new(128);
    let mut indices: Vec<RowIdx> = vec![];
    let mut all_indices = vec![];
    let mut all_rows = vec![];

    loop {
        batch.clear();
        let eos = stream.get_next(&mut batch, Some(&mut indices))?;
        all_rows.extend(batch.rows().iter().cloned());
        all_indices.extend(indices.iter().copied());
        if eos {
            break;
        }
    }

    assert_eq!(all_rows.len(), all_indices.len());

    // Random access through the recorded indices reproduces every row
    for (idx, expected) in all_indices.iter().zip(&all_rows) {
        assert_eq!(*expected, stream.get_row(idx)?);
    }

    stream.close();
    Ok(())
}

#[test]
fn tuple_stream_unpin_all_then_repin() -> spill_engine::Result<()> {
    let mgr = make_block_mgr(1, 4, 64 * 1024)?;
    let client = mgr.register_client(2, None);

    let mut stream = BufferedTupleStream::new(desc(), mgr, client, false, false);
    stream.init(true)?;

    for i in 0..1_000 {
        assert!(stream.add_row(&row(i))?);
    }

    stream.unpin_stream(true)?;
    assert_eq!(0, stream.bytes_in_mem(false));

    assert!(stream.pin_stream(false)?);
    let rows = stream.get_rows()?.expect("stream is pinned");
    assert_eq!(1_000, rows.len());

    stream.close();
    Ok(())
}
