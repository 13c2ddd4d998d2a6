// B-tree scenarios: a primary index of longs scanned both ways, a customer
// table with a unique id index and a duplicate-friendly email index,
// deletes visible through both, and save/restore of whole trees.

use std::cmp::Ordering;
use std::sync::Arc;

use shmdb::{
    BTree, BTreeConfig, IndexKind, KeyOps, MatchMode, ReadMode, SharedTable, SyncRuntime,
    TableConfig,
};

fn test_key(slot: i32) -> i32 {
    ((std::process::id() as i32) & 0x0007_FFFF) << 12 | (0x100 + slot * 64)
}

const DEMO_SIZE: usize = 40;
const EMAIL_OFFSET: usize = 8;
const EMAIL_LEN: usize = 24;

fn demo_record(id: u64) -> [u8; DEMO_SIZE] {
    let mut row = [0u8; DEMO_SIZE];
    row[..8].copy_from_slice(&id.to_le_bytes());
    let email = format!(
        "{}{}{}{}@example.com",
        (b'a' + (id % 26) as u8) as char,
        (b'a' + ((id / 26) % 26) as u8) as char,
        (b'a' + ((id / 677) % 26) as u8) as char,
        id
    );
    let bytes = email.as_bytes();
    let n = bytes.len().min(EMAIL_LEN);
    row[EMAIL_OFFSET..EMAIL_OFFSET + n].copy_from_slice(&bytes[..n]);
    row
}

fn record_id(row: &[u8]) -> u64 {
    u64::from_le_bytes(row[..8].try_into().unwrap())
}

fn record_email(row: &[u8]) -> &[u8] {
    &row[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_LEN]
}

struct LongKey;

impl KeyOps for LongKey {
    fn extract<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
        &tuple[..8]
    }

    fn compare(&self, a: &[u8], b: &[u8], len: usize) -> Ordering {
        if len >= 8 {
            u64::from_le_bytes(a[..8].try_into().unwrap())
                .cmp(&u64::from_le_bytes(b[..8].try_into().unwrap()))
        } else {
            a[..len].cmp(&b[..len])
        }
    }
}

struct EmailKey;

impl KeyOps for EmailKey {
    fn extract<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
        record_email(tuple)
    }

    fn compare(&self, a: &[u8], b: &[u8], len: usize) -> Ordering {
        let n = len.min(a.len()).min(b.len());
        for i in 0..n {
            let (x, y) = (a[i].to_ascii_lowercase(), b[i].to_ascii_lowercase());
            if x != y {
                return x.cmp(&y);
            }
        }
        a.len().min(len).cmp(&b.len().min(len))
    }
}

fn long_table(key: i32, rows: u32) -> TableConfig {
    TableConfig {
        key,
        tuple_size: 8,
        initial_alloc: rows / 3,
        growth_alloc: rows / 3,
        queue_changes: true,
        delete_lists: 8,
        add_lists: 5,
        kilroy: 1,
    }
}

fn customer_table(key: i32, rows: u32) -> TableConfig {
    TableConfig {
        key,
        tuple_size: DEMO_SIZE as u32,
        initial_alloc: rows / 3,
        growth_alloc: rows / 3,
        queue_changes: true,
        delete_lists: 3,
        add_lists: 3,
        kilroy: 1,
    }
}

#[test]
fn test_primary_longs_find_and_scan() {
    const SIZE: u64 = 1400;
    let rt = Arc::new(SyncRuntime::new());
    let table = SharedTable::create(long_table(test_key(0), SIZE as u32), rt).unwrap();
    let tree = BTree::create(
        BTreeConfig {
            key: test_key(1),
            key_len: 8,
            keys_per_page: 100,
            pages_per_block: 4,
            kind: IndexKind::Primary,
            kilroy: 1,
        },
        &table,
        Arc::new(LongKey),
    )
    .unwrap();

    for i in 0..SIZE {
        table.add_tuple(&i.to_le_bytes()).unwrap().unlock().unwrap();
    }

    // Every key resolves in both locking modes.
    let mut buf = [0u8; 8];
    for i in 0..SIZE {
        for mode in [ReadMode::Optimistic, ReadMode::CrabLock] {
            let hit = tree
                .find_tuple(&i.to_le_bytes(), mode, MatchMode::Direct, 8)
                .unwrap()
                .unwrap_or_else(|| panic!("key {i} not found"));
            hit.read(&mut buf).unwrap();
            assert_eq!(u64::from_le_bytes(buf), i);
        }
    }

    // Scroll forwards across the whole index.
    let first = tree
        .set_cursor(&0u64.to_le_bytes(), MatchMode::Direct, 8)
        .unwrap()
        .unwrap();
    first.read(&mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 0);
    for i in 1..SIZE {
        let hit = tree.cursor_next().unwrap().unwrap_or_else(|| panic!("lost key {i}"));
        hit.read(&mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), i, "forward order broke at {i}");
    }
    assert!(tree.cursor_next().unwrap().is_none(), "found too many");

    // And backwards.
    let last = tree
        .set_cursor(&(SIZE - 1).to_le_bytes(), MatchMode::Direct, 8)
        .unwrap()
        .unwrap();
    last.read(&mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), SIZE - 1);
    for i in (0..SIZE - 1).rev() {
        let hit = tree.cursor_prev().unwrap().unwrap_or_else(|| panic!("lost key {i}"));
        hit.read(&mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), i, "reverse order broke at {i}");
    }
    assert!(tree.cursor_prev().unwrap().is_none(), "found too many");
    tree.free_cursor();

    let report = tree.check_btree().unwrap();
    assert_eq!(report.keys, SIZE);

    tree.close().unwrap();
    table.close().unwrap();
}

#[test]
fn test_secondary_email_scans() {
    const SIZE: u64 = 1500;
    let rt = Arc::new(SyncRuntime::new());
    let table = SharedTable::create(customer_table(test_key(4), SIZE as u32), rt).unwrap();
    let primary = BTree::create(
        BTreeConfig {
            key: test_key(5),
            key_len: 8,
            keys_per_page: 50,
            pages_per_block: 6,
            kind: IndexKind::Primary,
            kilroy: 1,
        },
        &table,
        Arc::new(LongKey),
    )
    .unwrap();
    let email = BTree::create(
        BTreeConfig {
            key: test_key(6),
            key_len: EMAIL_LEN as u32,
            keys_per_page: 50,
            pages_per_block: 6,
            kind: IndexKind::Secondary,
            kilroy: 1,
        },
        &table,
        Arc::new(EmailKey),
    )
    .unwrap();

    for id in 0..SIZE {
        table.add_tuple(&demo_record(id)).unwrap().unlock().unwrap();
    }
    primary.check_btree().unwrap();
    email.check_btree().unwrap();

    // Primary integrity: every record comes back byte-exact.
    let mut buf = [0u8; DEMO_SIZE];
    for id in 0..SIZE {
        let hit = primary
            .find_tuple(&id.to_le_bytes(), ReadMode::Optimistic, MatchMode::Direct, 8)
            .unwrap()
            .unwrap_or_else(|| panic!("id {id} not found"));
        hit.read(&mut buf).unwrap();
        assert_eq!(buf, demo_record(id));
    }

    // The primary constraint rejects every known duplicate.
    for id in 0..SIZE {
        assert!(
            table.add_tuple(&demo_record(id)).is_err(),
            "duplicate id {id} accepted"
        );
    }
    primary.check_btree().unwrap();

    // Partial find-first on "a" starts at the smallest email; scanning
    // forward covers every remaining record.
    let first = email.set_cursor(b"a", MatchMode::FindFirst, 1).unwrap().unwrap();
    first.read(&mut buf).unwrap();
    assert_eq!(buf[EMAIL_OFFSET], b'a');
    let mut visited = 0u64;
    while email.cursor_next().unwrap().is_some() {
        visited += 1;
    }
    assert_eq!(visited, SIZE - 1);

    // Start-to-end scan stays in case-insensitive order.
    let first = email.set_cursor_to_start().unwrap().unwrap();
    first.read(&mut buf).unwrap();
    let mut previous = record_email(&buf).to_vec();
    let mut visited = 1u64;
    while let Some(hit) = email.cursor_next().unwrap() {
        hit.read(&mut buf).unwrap();
        let current = record_email(&buf).to_vec();
        assert_ne!(
            EmailKey.compare(&previous, &current, EMAIL_LEN),
            Ordering::Greater,
            "emails out of order"
        );
        previous = current;
        visited += 1;
    }
    assert_eq!(visited, SIZE);

    // End-to-start mirrors it.
    email.set_cursor_to_end().unwrap().unwrap();
    let mut visited = 1u64;
    while email.cursor_prev().unwrap().is_some() {
        visited += 1;
    }
    assert_eq!(visited, SIZE);

    // Partial find-last on "z" lands on the largest email.
    email.set_cursor(b"z", MatchMode::FindLast, 1).unwrap().unwrap();
    let mut visited = 1u64;
    while email.cursor_prev().unwrap().is_some() {
        visited += 1;
    }
    assert_eq!(visited, SIZE);
    email.free_cursor();

    primary.close().unwrap();
    email.close().unwrap();
    table.close().unwrap();
}

#[test]
fn test_deletes_and_tree_save_restore() {
    const SIZE: u64 = 1000;
    let rt = Arc::new(SyncRuntime::new());
    let dir = tempfile::tempdir().unwrap();
    let table = SharedTable::create(customer_table(test_key(10), SIZE as u32), rt).unwrap();
    let primary = BTree::create(
        BTreeConfig {
            key: test_key(11),
            key_len: 8,
            keys_per_page: 25,
            pages_per_block: 10,
            kind: IndexKind::Primary,
            kilroy: 1,
        },
        &table,
        Arc::new(LongKey),
    )
    .unwrap();
    let email = BTree::create(
        BTreeConfig {
            key: test_key(12),
            key_len: EMAIL_LEN as u32,
            keys_per_page: 25,
            pages_per_block: 10,
            kind: IndexKind::Secondary,
            kilroy: 1,
        },
        &table,
        Arc::new(EmailKey),
    )
    .unwrap();

    for id in 0..SIZE {
        table.add_tuple(&demo_record(id)).unwrap().unlock().unwrap();
    }

    // Delete every fifth record through a primary lookup.
    for id in (0..SIZE).step_by(5) {
        primary
            .find_tuple(&id.to_le_bytes(), ReadMode::Optimistic, MatchMode::Direct, 8)
            .unwrap()
            .unwrap_or_else(|| panic!("id {id} missing before delete"));
        table.delete_tuple().unwrap();
    }
    primary.check_btree().unwrap();
    email.check_btree().unwrap();

    let mut buf = [0u8; DEMO_SIZE];
    for id in 0..SIZE {
        let expected = demo_record(id);
        let hit = primary
            .find_tuple(&id.to_le_bytes(), ReadMode::CrabLock, MatchMode::Direct, 8)
            .unwrap();
        if id % 5 == 0 {
            assert!(hit.is_none(), "deleted id {id} still indexed");

            // No email entry for the dead record either: scan the equal
            // range of its 3-byte prefix and make sure the id never shows.
            let mut probe = email
                .set_cursor(record_email(&expected), MatchMode::FindFirst, 3)
                .unwrap();
            while let Some(tuple) = probe {
                tuple.read(&mut buf).unwrap();
                if EmailKey.compare(record_email(&buf), record_email(&expected), 3)
                    != Ordering::Equal
                {
                    break;
                }
                assert_ne!(record_id(&buf), id, "deleted id {id} via secondary");
                probe = email.cursor_next().unwrap();
            }
            email.free_cursor();
        } else {
            assert!(hit.is_some(), "live id {id} lost");

            // The secondary still reaches it, scanning forward...
            let mut probe = email
                .set_cursor(record_email(&expected), MatchMode::FindFirst, 3)
                .unwrap();
            let mut reached = false;
            while let Some(tuple) = probe {
                tuple.read(&mut buf).unwrap();
                if EmailKey.compare(record_email(&buf), record_email(&expected), 3)
                    != Ordering::Equal
                {
                    break;
                }
                if record_id(&buf) == id {
                    reached = true;
                    break;
                }
                probe = email.cursor_next().unwrap();
            }
            email.free_cursor();
            assert!(reached, "live id {id} lost via secondary (forward)");

            // ... and backward.
            let mut probe = email
                .set_cursor(record_email(&expected), MatchMode::FindLast, 3)
                .unwrap();
            let mut reached = false;
            while let Some(tuple) = probe {
                tuple.read(&mut buf).unwrap();
                if EmailKey.compare(record_email(&buf), record_email(&expected), 3)
                    != Ordering::Equal
                {
                    break;
                }
                if record_id(&buf) == id {
                    reached = true;
                    break;
                }
                probe = email.cursor_prev().unwrap();
            }
            email.free_cursor();
            assert!(reached, "live id {id} lost via secondary (backward)");
        }
    }

    // Save both trees, restore them at fresh keys, and re-verify.
    let primary_file = dir.path().join("primary.btr");
    let email_file = dir.path().join("email.btr");
    primary.write_btree(&primary_file).unwrap();
    email.write_btree(&email_file).unwrap();
    primary.close().unwrap();
    email.close().unwrap();

    let primary = BTree::create_from_file(
        &primary_file,
        BTreeConfig {
            key: test_key(13),
            key_len: 8,
            keys_per_page: 25,
            pages_per_block: 10,
            kind: IndexKind::Primary,
            kilroy: 1,
        },
        &table,
        Arc::new(LongKey),
    )
    .unwrap();
    let email = BTree::create_from_file(
        &email_file,
        BTreeConfig {
            key: test_key(14),
            key_len: EMAIL_LEN as u32,
            keys_per_page: 25,
            pages_per_block: 10,
            kind: IndexKind::Secondary,
            kilroy: 1,
        },
        &table,
        Arc::new(EmailKey),
    )
    .unwrap();

    let primary_report = primary.check_btree().unwrap();
    let email_report = email.check_btree().unwrap();
    assert_eq!(primary_report.keys, SIZE - SIZE / 5);
    assert_eq!(email_report.keys, SIZE - SIZE / 5);

    for id in 0..SIZE {
        let hit = primary
            .find_tuple(&id.to_le_bytes(), ReadMode::Optimistic, MatchMode::Direct, 8)
            .unwrap();
        assert_eq!(hit.is_none(), id % 5 == 0, "restored tree wrong about {id}");
    }

    primary.close().unwrap();
    email.close().unwrap();
    table.close().unwrap();
}
