// Concurrent churn over one table and two indexes, modeled on running two
// cooperating processes against the same shared objects: every worker gets
// its own handles and kilroy, records carry their own coordination lock,
// and a shared shadow array is the ground truth to verify against.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use shmdb::{
    BTree, BTreeConfig, IndexKind, KeyOps, MatchMode, ReadMode, SharedTable, SpinLock,
    SyncRuntime, TableConfig,
};

fn test_key(slot: i32) -> i32 {
    ((std::process::id() as i32) & 0x0007_FFFF) << 12 | (0x100 + slot * 64)
}

const ROW_SIZE: usize = 48;
const EMAIL_OFFSET: usize = 16;
const EMAIL_LEN: usize = 24;
const WORKING_SET: usize = 100;
const WORKERS: u32 = 2;
const REPS: usize = 5_000;

/// id u64, version u64, email [u8; 24], padding.
fn record(id: u64, version: u64) -> [u8; ROW_SIZE] {
    let mut row = [0u8; ROW_SIZE];
    row[..8].copy_from_slice(&id.to_le_bytes());
    row[8..16].copy_from_slice(&version.to_le_bytes());
    let email = format!(
        "{}{}@example.com",
        (b'a' + (id % 26) as u8) as char,
        id
    );
    let bytes = email.as_bytes();
    let n = bytes.len().min(EMAIL_LEN);
    row[EMAIL_OFFSET..EMAIL_OFFSET + n].copy_from_slice(&bytes[..n]);
    row
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
        &tuple[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_LEN]
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

/// Per-record coordination: whoever holds the lock owns the record's fate.
struct Shadow {
    lock: SpinLock,
    present: AtomicU32,
    version: AtomicU32,
}

fn open_indexes(
    table: &SharedTable,
    kilroy: u32,
) -> (BTree<'_>, BTree<'_>) {
    let primary = BTree::open(test_key(1), table, Arc::new(LongKey), kilroy).unwrap();
    let email = BTree::open(test_key(2), table, Arc::new(EmailKey), kilroy).unwrap();
    (primary, email)
}

#[test]
fn test_two_worker_random_churn() {
    let rt = Arc::new(SyncRuntime::new());
    let table = SharedTable::create(
        TableConfig {
            key: test_key(0),
            tuple_size: ROW_SIZE as u32,
            initial_alloc: WORKING_SET as u32 / 10,
            growth_alloc: WORKING_SET as u32 / 10,
            queue_changes: true,
            delete_lists: 12,
            add_lists: 12,
            kilroy: 1,
        },
        rt.clone(),
    )
    .unwrap();
    let primary = BTree::create(
        BTreeConfig {
            key: test_key(1),
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
            key: test_key(2),
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

    let shadows: Arc<Vec<Shadow>> = Arc::new(
        (0..WORKING_SET)
            .map(|_| Shadow {
                lock: SpinLock::new(),
                present: AtomicU32::new(0),
                version: AtomicU32::new(0),
            })
            .collect(),
    );

    let mut workers = vec![];
    for worker in 0..WORKERS {
        let shadows = Arc::clone(&shadows);
        let table_key = table.key();
        workers.push(thread::spawn(move || {
            let rt = Arc::new(SyncRuntime::new());
            let kilroy = 100 + worker;
            let table = SharedTable::open(table_key, kilroy, rt.clone()).unwrap();
            let (primary, email) = open_indexes(&table, kilroy);
            let mut rng = rand::rng();

            for _ in 0..REPS {
                let pick = rng.random_range(0..WORKING_SET);
                let id = pick as u64;
                match rng.random_range(0..5) {
                    0 | 1 => {
                        let shadow = &shadows[pick];
                        if shadow.lock.try_acquire(kilroy).is_err() {
                            continue; // the other worker owns this record
                        }
                        if shadow.present.load(AtomicOrdering::SeqCst) != 0 {
                            primary
                                .find_tuple(
                                    &id.to_le_bytes(),
                                    ReadMode::CrabLock,
                                    MatchMode::Direct,
                                    8,
                                )
                                .unwrap()
                                .unwrap_or_else(|| panic!("lost record {id}"));
                            table.delete_tuple().unwrap();
                            shadow.present.store(0, AtomicOrdering::SeqCst);
                        } else {
                            let version = shadow.version.fetch_add(1, AtomicOrdering::SeqCst);
                            table
                                .add_tuple(&record(id, version as u64))
                                .unwrap()
                                .unlock()
                                .unwrap();
                            shadow.present.store(1, AtomicOrdering::SeqCst);
                        }
                        shadow.lock.release(kilroy).unwrap();
                    }
                    2 => {
                        let _ = primary
                            .find_tuple(
                                &id.to_le_bytes(),
                                ReadMode::Optimistic,
                                MatchMode::Direct,
                                8,
                            )
                            .unwrap();
                    }
                    3 => {
                        // Prefix scan a stretch of the secondary index.
                        if email
                            .set_cursor(b"a", MatchMode::FindFirst, 1)
                            .unwrap()
                            .is_some()
                        {
                            for _ in 0..25 {
                                if email.cursor_next().unwrap().is_none() {
                                    break;
                                }
                            }
                        }
                        email.free_cursor();
                    }
                    _ => {
                        // Walk the raw table a little way.
                        table.reset_cursor();
                        for _ in 0..25 {
                            if table.next_tuple().is_none() {
                                break;
                            }
                        }
                    }
                }
            }

            primary.close().unwrap();
            email.close().unwrap();
            table.close().unwrap();
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // Ground truth: table and both indexes agree with the shadow array.
    let mut buf = [0u8; ROW_SIZE];
    for (pick, shadow) in shadows.iter().enumerate() {
        let id = pick as u64;
        let expected = shadow.present.load(AtomicOrdering::SeqCst) != 0;
        let via_primary = primary
            .find_tuple(&id.to_le_bytes(), ReadMode::CrabLock, MatchMode::Direct, 8)
            .unwrap();
        assert_eq!(
            via_primary.is_some(),
            expected,
            "primary disagrees with shadow for {id}"
        );
        let probe = record(id, 0);
        let via_email = email
            .set_cursor(&probe[EMAIL_OFFSET..], MatchMode::FindFirst, EMAIL_LEN)
            .unwrap();
        let mut found = false;
        let mut hit = via_email;
        while let Some(tuple) = hit {
            tuple.read(&mut buf).unwrap();
            if EmailKey.compare(
                &buf[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_LEN],
                &probe[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_LEN],
                EMAIL_LEN,
            ) != Ordering::Equal
            {
                break;
            }
            if u64::from_le_bytes(buf[..8].try_into().unwrap()) == id {
                found = true;
                break;
            }
            hit = email.cursor_next().unwrap();
        }
        email.free_cursor();
        assert_eq!(found, expected, "secondary disagrees with shadow for {id}");
    }
    primary.check_btree().unwrap();
    email.check_btree().unwrap();

    primary.close().unwrap();
    email.close().unwrap();
    table.close().unwrap();
}
