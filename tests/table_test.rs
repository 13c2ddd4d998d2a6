// Table flows end to end: import and export against flat files, integrity
// sweeps in both directions, boundary deletes at both tips with reinserts,
// a full drain, and the warm-start image.

use std::sync::Arc;

use shmdb::{DbError, SharedTable, SyncRuntime, TableConfig};

fn test_key(slot: i32) -> i32 {
    ((std::process::id() as i32) & 0x0007_FFFF) << 12 | (0x100 + slot * 64)
}

const ROW_SIZE: usize = 32;
const TABLE_DATA: usize = 1000;
const DELETE_TIPS: usize = 300;

fn record(n: u64) -> [u8; ROW_SIZE] {
    let mut row = [0u8; ROW_SIZE];
    row[..8].copy_from_slice(&n.to_le_bytes());
    row[8..16].copy_from_slice(&(n * 7 + 13).to_le_bytes());
    row[16..24].copy_from_slice(&(!n).to_le_bytes());
    row
}

fn config(key: i32) -> TableConfig {
    TableConfig {
        key,
        tuple_size: ROW_SIZE as u32,
        initial_alloc: 100,
        growth_alloc: 150,
        queue_changes: true,
        delete_lists: 3,
        add_lists: 3,
        kilroy: 1,
    }
}

/// Count how many times each original record appears in the table right
/// now, sweeping in the given direction from a reset cursor.
fn sweep_counts(table: &SharedTable, forward: bool) -> Vec<usize> {
    let mut counts = vec![0usize; TABLE_DATA];
    let mut buf = [0u8; ROW_SIZE];
    if forward {
        table.reset_cursor();
    }
    loop {
        let tuple = if forward {
            table.next_tuple()
        } else {
            table.prev_tuple()
        };
        let tuple = match tuple {
            Some(t) => t,
            None => break,
        };
        tuple.read(&mut buf).unwrap();
        let n = u64::from_le_bytes(buf[..8].try_into().unwrap()) as usize;
        assert!(n < TABLE_DATA, "bogus tuple in table");
        assert_eq!(buf, record(n as u64), "corrupt tuple {n}");
        counts[n] += 1;
    }
    counts
}

#[test]
fn test_import_export_sweeps_and_tip_deletes() {
    let rt = Arc::new(SyncRuntime::new());
    let dir = tempfile::tempdir().unwrap();

    // Build the flat test file the way any fixed-record producer would.
    let source = dir.path().join("testdata.dat");
    let mut raw = Vec::with_capacity(TABLE_DATA * ROW_SIZE);
    for n in 0..TABLE_DATA {
        raw.extend_from_slice(&record(n as u64));
    }
    std::fs::write(&source, &raw).unwrap();

    let table = SharedTable::create(config(test_key(0)), rt).unwrap();
    assert_eq!(table.import_table(&source).unwrap(), TABLE_DATA as u64);

    // Export must reproduce the same multiset of records.
    let exported = dir.path().join("testdata2.dat");
    assert_eq!(table.export_table(&exported).unwrap(), TABLE_DATA as u64);
    let mut out = std::fs::read(&exported).unwrap();
    assert_eq!(out.len(), raw.len());
    let mut expect = raw.clone();
    let chunk_sort = |data: &mut Vec<u8>| {
        let mut chunks: Vec<Vec<u8>> = data.chunks(ROW_SIZE).map(|c| c.to_vec()).collect();
        chunks.sort();
        *data = chunks.concat();
    };
    chunk_sort(&mut out);
    chunk_sort(&mut expect);
    assert_eq!(out, expect);

    // Forward integrity: every record exactly once.
    assert!(sweep_counts(&table, true).iter().all(|&c| c == 1));
    // The cursor now sits past the end; the backward sweep mirrors it.
    assert!(sweep_counts(&table, false).iter().all(|&c| c == 1));

    // Delete the first DELETE_TIPS records, stash copies, verify, reinsert.
    let mut stash = Vec::new();
    table.reset_cursor();
    for i in 0..DELETE_TIPS {
        let tuple = table.next_tuple().unwrap_or_else(|| panic!("ran out at {i}"));
        stash.push(tuple.to_vec().unwrap());
        table.delete_tuple().unwrap();
    }
    assert_eq!(
        sweep_counts(&table, true).iter().sum::<usize>(),
        TABLE_DATA - DELETE_TIPS
    );
    for row in &stash {
        table.add_tuple(row).unwrap().unlock().unwrap();
    }
    assert!(sweep_counts(&table, true).iter().all(|&c| c == 1));

    // Same dance off the back tip.
    stash.clear();
    table.reset_cursor();
    while table.next_tuple().is_some() {}
    for i in 0..DELETE_TIPS {
        let tuple = table.prev_tuple().unwrap_or_else(|| panic!("ran out at {i}"));
        stash.push(tuple.to_vec().unwrap());
        table.delete_tuple().unwrap();
    }
    assert_eq!(
        sweep_counts(&table, true).iter().sum::<usize>(),
        TABLE_DATA - DELETE_TIPS
    );
    for row in &stash {
        table.add_tuple(row).unwrap().unlock().unwrap();
    }
    assert!(sweep_counts(&table, true).iter().all(|&c| c == 1));

    // Drain the whole table, then refill it.
    table.reset_cursor();
    while table.next_tuple().is_some() {
        table.delete_tuple().unwrap();
    }
    table.reset_cursor();
    assert!(table.next_tuple().is_none());
    for n in 0..TABLE_DATA {
        table.add_tuple(&record(n as u64)).unwrap().unlock().unwrap();
    }
    assert!(sweep_counts(&table, true).iter().all(|&c| c == 1));

    table.close().unwrap();
}

#[test]
fn test_misc_tuple_operations() {
    let rt = Arc::new(SyncRuntime::new());
    let table = SharedTable::create(config(test_key(8)), rt).unwrap();
    for n in 0..50u64 {
        table.add_tuple(&record(n)).unwrap().unlock().unwrap();
    }

    table.reset_cursor();
    while let Some(tuple) = table.next_tuple() {
        let expected = tuple.to_vec().unwrap();

        let locked = table.lock_tuple().unwrap();
        assert_eq!(&locked[..], &expected[..]);
        let loc = locked.location();
        locked.unlock().unwrap();

        let locked = table.locked_get_tuple().unwrap();
        locked.unlock().unwrap();

        let bounced = table.try_lock_tuple().unwrap();
        bounced.unlock().unwrap();

        assert_eq!(table.tuple_location().unwrap(), loc);
        table.reset_cursor();
        let back = table.set_tuple(loc).unwrap();
        assert_eq!(back.to_vec().unwrap(), expected);
    }

    // A held tuple bounces other handles, not its own holder.
    table.reset_cursor();
    table.next_tuple().unwrap();
    let guard = table.lock_tuple().unwrap();
    let loc = guard.location();
    let other = SharedTable::open(table.key(), 2, table.runtime().clone()).unwrap();
    other.set_tuple(loc).unwrap();
    assert_eq!(
        other.try_lock_tuple().unwrap_err().kind(),
        "object_in_use"
    );
    guard.unlock().unwrap();
    other.try_lock_tuple().unwrap().unlock().unwrap();

    other.close().unwrap();
    table.close().unwrap();
}

#[test]
fn test_mutation_under_guard_round_trips() {
    let rt = Arc::new(SyncRuntime::new());
    let table = SharedTable::create(config(test_key(16)), rt).unwrap();

    let mut guard = table.add_tuple(&record(1)).unwrap();
    guard[24..32].copy_from_slice(&0xFEED_FACEu64.to_le_bytes());
    guard.unlock().unwrap();

    table.reset_cursor();
    let tuple = table.next_tuple().unwrap();
    let bytes = tuple.to_vec().unwrap();
    assert_eq!(&bytes[24..32], &0xFEED_FACEu64.to_le_bytes());

    table.close().unwrap();
}

#[test]
fn test_write_load_preserves_everything() {
    let rt = Arc::new(SyncRuntime::new());
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("table.tab");

    let table = SharedTable::create(config(test_key(24)), rt.clone()).unwrap();
    for n in 0..400u64 {
        table.add_tuple(&record(n)).unwrap().unlock().unwrap();
    }
    // Leave free chains behind in both pools.
    table.reset_cursor();
    let mut step = 0;
    while table.next_tuple().is_some() {
        if step % 3 == 0 {
            table.delete_tuple().unwrap();
        }
        step += 1;
    }
    let before = sweep_counts(&table, true);
    table.write_table(&image).unwrap();
    table.close().unwrap();

    let restored = SharedTable::create(config(test_key(32)), rt).unwrap();
    restored.load_table(&image).unwrap();
    assert_eq!(sweep_counts(&restored, true), before);

    // The restored pools must serve inserts without corruption.
    for n in 0..100u64 {
        restored.add_tuple(&record(n)).unwrap().unlock().unwrap();
    }
    let after = sweep_counts(&restored, true);
    assert_eq!(
        after.iter().sum::<usize>(),
        before.iter().sum::<usize>() + 100
    );

    restored.close().unwrap();
}

#[test]
fn test_error_kinds_surface() {
    let rt = Arc::new(SyncRuntime::new());
    // Illegal construction fields.
    let mut bad = config(test_key(40));
    bad.tuple_size = 0;
    assert!(matches!(
        SharedTable::create(bad, rt.clone()),
        Err(DbError::BadParameters(_))
    ));
    // Opening a key nobody created.
    assert!(matches!(
        SharedTable::open(test_key(41), 1, rt.clone()),
        Err(DbError::NotFound(_))
    ));
    // Cursor operations with no cursor tuple.
    let table = SharedTable::create(config(test_key(42)), rt).unwrap();
    assert!(matches!(
        table.delete_tuple(),
        Err(DbError::BadParameters(_))
    ));
    assert!(matches!(table.lock_tuple(), Err(DbError::BadParameters(_))));
    table.close().unwrap();
}
