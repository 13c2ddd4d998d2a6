// # ShmDB Test Harness
//
// Exercises one subsystem per invocation: `shmdb-test <section>`.
// Exit code 0 means the section passed. IPC keys derive from the pid, so
// concurrent invocations stay out of each other's way; the concurrency
// sections run multiple handles on their own threads instead.

use std::cmp::Ordering as CmpOrdering;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;
use tracing::{error, info};

use shmdb::{
    BTree, BTreeConfig, DbError, IndexKind, KernelSem, KeyOps, MatchMode, ReadMode, Result,
    ScratchMem, SharedMem, SharedTable, SpinLock, SyncRuntime, TableConfig,
};

/// IPC keys derive from the pid so two harness instances can coexist.
fn section_key(slot: i32) -> i32 {
    ((std::process::id() as i32) & 0x0007_FFFF) << 12 | (0x800 + slot * 64)
}

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("shmdb-test-{}-{}", std::process::id(), name))
}

// ---------------------------------------------------------------------
// Demo records
// ---------------------------------------------------------------------

const DEMO_SIZE: usize = 40;
const EMAIL_OFFSET: usize = 8;
const EMAIL_LEN: usize = 24;

/// A customer row: id u64, email [u8; 24], padding.
fn demo_record(id: u64) -> [u8; DEMO_SIZE] {
    let mut row = [0u8; DEMO_SIZE];
    row[..8].copy_from_slice(&id.to_le_bytes());
    let local = [
        (b'a' + (id % 26) as u8),
        (b'a' + ((id / 26) % 26) as u8),
        (b'a' + ((id / 677) % 26) as u8),
    ];
    let email = format!(
        "{}{}{}{}@example.com",
        local[0] as char, local[1] as char, local[2] as char, id
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

    fn compare(&self, a: &[u8], b: &[u8], len: usize) -> CmpOrdering {
        if len >= 8 {
            u64::from_le_bytes(a[..8].try_into().unwrap_or_default())
                .cmp(&u64::from_le_bytes(b[..8].try_into().unwrap_or_default()))
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

    fn compare(&self, a: &[u8], b: &[u8], len: usize) -> CmpOrdering {
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

// ---------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------

fn kernel_semaphores() -> Result<()> {
    info!("testing kernel semaphores");
    let key = section_key(0);
    let mut sem = KernelSem::new();
    match sem.create(key) {
        Ok(()) => info!("created semaphore {key}"),
        Err(_) => {
            info!("create failed, opening existing semaphore {key}");
            sem.open(key)?;
        }
    }
    for rep in 0..10 {
        sem.get_lock()?;
        sem.free_lock()?;
        sem.get_lock()?;
        // The second handle must bounce while we hold it.
        let mut other = KernelSem::new();
        other.open(key)?;
        if other.try_lock().is_ok() {
            return Err(DbError::OperationFailed(
                "try_lock succeeded on a held semaphore".into(),
            ));
        }
        other.close()?;
        sem.free_lock()?;
        info!("rep {rep} ok");
    }
    sem.close()
}

fn shared_memory() -> Result<()> {
    info!("testing shared memory");
    for rep in 0..15 {
        let key = section_key(1) + rep;
        let a = SharedMem::create(key, 64 * 1024)?;
        let b = SharedMem::attach(key)?;
        let cell_a = unsafe { &*(a.base().as_ptr() as *const AtomicU32) };
        let cell_b = unsafe { &*(b.base().as_ptr() as *const AtomicU32) };
        cell_a.store(rep as u32 + 1, Ordering::SeqCst);
        if cell_b.load(Ordering::SeqCst) != rep as u32 + 1 {
            return Err(DbError::OperationFailed(
                "second attachment missed a write".into(),
            ));
        }
        drop(b);
        drop(a);
        if SharedMem::attach(key).is_ok() {
            return Err(DbError::OperationFailed(
                "segment survived its last detach".into(),
            ));
        }
        info!("rep {rep} ok");
    }
    Ok(())
}

fn scratch_memory() -> Result<()> {
    info!("testing scratch memory");
    let pool = ScratchMem::new(1_024_000)?;
    for _ in 0..2_500 {
        for _ in 0..500 {
            let p = pool.alloc(1_000)?;
            // Touch both ends of the allocation.
            unsafe {
                p.as_ptr().write(0xAB);
                p.as_ptr().add(999).write(0xCD);
            }
        }
        pool.reset();
    }
    info!(high_water = pool.high_water(), "pool cycles complete");
    if pool.high_water() != 500 * 1_000 {
        return Err(DbError::OperationFailed("unexpected high-water mark".into()));
    }
    // Exhaustion must fail cleanly and keep the pool usable.
    if pool.alloc(2_000_000).is_ok() {
        return Err(DbError::OperationFailed("oversized alloc succeeded".into()));
    }
    pool.alloc(16)?;
    Ok(())
}

fn spin_locks() -> Result<()> {
    info!("testing spin locks");
    let rt = Arc::new(SyncRuntime::new());
    let lock = Arc::new(SpinLock::new());
    let counter = Arc::new(AtomicU32::new(0));

    let mut handles = vec![];
    for id in 1..=4u32 {
        let rt = Arc::clone(&rt);
        let lock = Arc::clone(&lock);
        let counter = Arc::clone(&counter);
        handles.push(thread::spawn(move || -> Result<()> {
            for _ in 0..10_000 {
                lock.acquire(&rt, id)?;
                let seen = counter.load(Ordering::Relaxed);
                counter.store(seen + 1, Ordering::Relaxed);
                lock.release(id)?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_| DbError::OperationFailed("worker panicked".into()))??;
    }
    if counter.load(Ordering::SeqCst) != 40_000 {
        return Err(DbError::OperationFailed("lost increments under lock".into()));
    }
    // Foreign release must be refused.
    lock.acquire(&rt, 7)?;
    if lock.release(8).is_ok() {
        return Err(DbError::OperationFailed("foreign release accepted".into()));
    }
    lock.release(7)?;
    info!("spin lock exclusion holds");
    Ok(())
}

fn atomics() -> Result<()> {
    info!("testing atomics");
    use shmdb::sync::{atomic_add, atomic_dec, atomic_inc, atomic_sub, cas32, read_cpu_ticks};

    let cell = Arc::new(AtomicU32::new(0));
    let mut handles = vec![];
    for _ in 0..4 {
        let cell = Arc::clone(&cell);
        handles.push(thread::spawn(move || {
            for _ in 0..2_000_000 {
                atomic_inc(&cell);
            }
            for _ in 0..1_000_000 {
                atomic_dec(&cell);
            }
            atomic_add(&cell, 10);
            atomic_sub(&cell, 10);
        }));
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_| DbError::OperationFailed("worker panicked".into()))?;
    }
    if cell.load(Ordering::SeqCst) != 4_000_000 {
        return Err(DbError::OperationFailed("atomic counts drifted".into()));
    }

    let word = AtomicU32::new(5);
    cas32(&word, 5, 6)?;
    if cas32(&word, 5, 7).is_ok() {
        return Err(DbError::OperationFailed("stale cas succeeded".into()));
    }
    let t0 = read_cpu_ticks();
    let t1 = read_cpu_ticks();
    info!(delta = t1.saturating_sub(t0), "tick counter read");
    Ok(())
}

fn share_locks() -> Result<()> {
    info!("testing share locks");
    let rt = Arc::new(SyncRuntime::new());
    let lock = Arc::new(shmdb::ShareLock::new());

    // Readers and writers contend; the writer must see a quiet word.
    let mut handles = vec![];
    for _ in 0..4 {
        let rt = Arc::clone(&rt);
        let lock = Arc::clone(&lock);
        handles.push(thread::spawn(move || {
            for _ in 0..5_000 {
                lock.share(&rt);
                lock.release_share();
            }
        }));
    }
    for _ in 0..200 {
        lock.exclusive(&rt);
        if lock.reader_count() != 0 {
            lock.release_exclusive().ok();
            panic!("exclusive granted with readers inside");
        }
        lock.release_exclusive()?;
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_| DbError::OperationFailed("reader panicked".into()))?;
    }

    // Three-phase queued exclusive.
    lock.share(&rt);
    lock.queue_exclusive(&rt)?;
    if lock.try_share().is_ok() {
        return Err(DbError::OperationFailed(
            "reader slipped past queued intent".into(),
        ));
    }
    lock.release_share();
    lock.wait_queue_exclusive(&rt);
    lock.release_exclusive()?;

    lock.share(&rt);
    lock.queue_exclusive(&rt)?;
    lock.remove_queue_exclusive(&rt);
    lock.try_share()?;
    lock.release_share();
    lock.release_share();
    info!("share lock protocol holds");
    Ok(())
}

fn tables() -> Result<()> {
    info!("testing tables");
    const TABLE_DATA: u64 = 500;
    let rt = Arc::new(SyncRuntime::new());
    let table = SharedTable::create(
        TableConfig {
            key: section_key(2),
            tuple_size: DEMO_SIZE as u32,
            initial_alloc: 100,
            growth_alloc: 150,
            queue_changes: true,
            delete_lists: 3,
            add_lists: 3,
            kilroy: 1,
        },
        rt,
    )?;

    info!("inserting {TABLE_DATA} records");
    for id in 0..TABLE_DATA {
        table.add_tuple(&demo_record(id))?.unlock()?;
    }

    info!("integrity check forwards");
    let mut seen = vec![false; TABLE_DATA as usize];
    table.reset_cursor();
    let mut buf = [0u8; DEMO_SIZE];
    while let Some(tuple) = table.next_tuple() {
        tuple.read(&mut buf)?;
        let id = u64::from_le_bytes(buf[..8].try_into().unwrap_or_default());
        if buf != demo_record(id) || seen[id as usize] {
            return Err(DbError::OperationFailed("bogus or duplicate tuple".into()));
        }
        seen[id as usize] = true;
    }
    if seen.iter().any(|found| !found) {
        return Err(DbError::OperationFailed("missing tuple".into()));
    }

    info!("integrity check backwards");
    let mut count = 0;
    while table.prev_tuple().is_some() {
        count += 1;
    }
    if count != TABLE_DATA {
        return Err(DbError::OperationFailed("reverse sweep lost tuples".into()));
    }

    info!("delete the first 100 then reinsert them");
    let mut stash = vec![];
    table.reset_cursor();
    for _ in 0..100 {
        let tuple = table
            .next_tuple()
            .ok_or_else(|| DbError::NotFound("ran out of tuples".into()))?;
        stash.push(tuple.to_vec()?);
        table.delete_tuple()?;
    }
    table.reset_cursor();
    let mut remaining = 0;
    while table.next_tuple().is_some() {
        remaining += 1;
    }
    if remaining != TABLE_DATA - 100 {
        return Err(DbError::OperationFailed("wrong count after deletes".into()));
    }
    for row in &stash {
        table.add_tuple(row)?.unlock()?;
    }
    table.reset_cursor();
    let mut total = 0;
    while table.next_tuple().is_some() {
        total += 1;
    }
    if total != TABLE_DATA {
        return Err(DbError::OperationFailed("wrong count after reinsert".into()));
    }

    info!("miscellaneous tuple operations");
    table.reset_cursor();
    table
        .next_tuple()
        .ok_or_else(|| DbError::NotFound("empty table".into()))?;
    let guard = table.lock_tuple()?;
    let loc = guard.location();
    guard.unlock()?;
    let locked = table.locked_get_tuple()?;
    locked.unlock()?;
    let bounced = table.try_lock_tuple()?;
    bounced.unlock()?;
    if table.tuple_location()? != loc {
        return Err(DbError::OperationFailed("cursor coordinates drifted".into()));
    }
    table.reset_cursor();
    table.set_tuple(loc)?;

    info!("export, import, write, load");
    let flat = scratch_path("table-export.dat");
    let image = scratch_path("table-image.tab");
    table.export_table(&flat)?;
    table.write_table(&image)?;
    let exported = std::fs::metadata(&flat)?.len();
    if exported != TABLE_DATA * DEMO_SIZE as u64 {
        return Err(DbError::OperationFailed("export size off".into()));
    }
    table.close()?;

    let rt = Arc::new(SyncRuntime::new());
    let restored = SharedTable::create(
        TableConfig {
            key: section_key(3),
            tuple_size: DEMO_SIZE as u32,
            initial_alloc: 100,
            growth_alloc: 150,
            queue_changes: true,
            delete_lists: 3,
            add_lists: 3,
            kilroy: 1,
        },
        rt,
    )?;
    restored.load_table(&image)?;
    restored.reset_cursor();
    let mut total = 0;
    while restored.next_tuple().is_some() {
        total += 1;
    }
    if total != TABLE_DATA {
        return Err(DbError::OperationFailed("load lost tuples".into()));
    }
    restored.close()?;
    std::fs::remove_file(&flat).ok();
    std::fs::remove_file(&image).ok();
    Ok(())
}

fn btrees() -> Result<()> {
    info!("testing btrees (tables must already pass)");
    const ROWS: u64 = 300;
    let rt = Arc::new(SyncRuntime::new());
    let table = SharedTable::create(
        TableConfig {
            key: section_key(4),
            tuple_size: DEMO_SIZE as u32,
            initial_alloc: 100,
            growth_alloc: 100,
            queue_changes: true,
            delete_lists: 3,
            add_lists: 3,
            kilroy: 1,
        },
        rt,
    )?;
    let primary = BTree::create(
        BTreeConfig {
            key: section_key(5),
            key_len: 8,
            keys_per_page: 25,
            pages_per_block: 10,
            kind: IndexKind::Primary,
            kilroy: 1,
        },
        &table,
        Arc::new(LongKey),
    )?;
    let email = BTree::create(
        BTreeConfig {
            key: section_key(6),
            key_len: EMAIL_LEN as u32,
            keys_per_page: 25,
            pages_per_block: 10,
            kind: IndexKind::Secondary,
            kilroy: 1,
        },
        &table,
        Arc::new(EmailKey),
    )?;

    info!("inserting {ROWS} rows through both indexes");
    for id in 0..ROWS {
        table.add_tuple(&demo_record(id))?.unlock()?;
    }
    primary.check_btree()?;
    email.check_btree()?;

    info!("find every key, both read modes");
    let mut buf = [0u8; DEMO_SIZE];
    for id in 0..ROWS {
        let key = id.to_le_bytes();
        for mode in [ReadMode::Optimistic, ReadMode::CrabLock] {
            let hit = primary
                .find_tuple(&key, mode, MatchMode::Direct, 8)?
                .ok_or_else(|| DbError::NotFound(format!("key {id} missing")))?;
            hit.read(&mut buf)?;
            if buf != demo_record(id) {
                return Err(DbError::OperationFailed(format!("wrong tuple for {id}")));
            }
        }
    }

    info!("primary uniqueness");
    for id in (0..ROWS).step_by(50) {
        if table.add_tuple(&demo_record(id)).is_ok() {
            return Err(DbError::OperationFailed("duplicate key accepted".into()));
        }
    }

    info!("scroll forwards and backwards");
    let first = primary
        .set_cursor(&0u64.to_le_bytes(), MatchMode::Direct, 8)?
        .ok_or_else(|| DbError::NotFound("key 0 missing".into()))?;
    first.read(&mut buf)?;
    for id in 1..ROWS {
        let hit = primary
            .cursor_next()?
            .ok_or_else(|| DbError::NotFound(format!("cursor lost key {id}")))?;
        hit.read(&mut buf)?;
        if u64::from_le_bytes(buf[..8].try_into().unwrap_or_default()) != id {
            return Err(DbError::OperationFailed("cursor out of order".into()));
        }
    }
    if primary.cursor_next()?.is_some() {
        return Err(DbError::OperationFailed("cursor ran past the end".into()));
    }
    for id in (0..ROWS - 1).rev() {
        let hit = primary
            .cursor_prev()?
            .ok_or_else(|| DbError::NotFound(format!("cursor lost key {id}")))?;
        hit.read(&mut buf)?;
        if u64::from_le_bytes(buf[..8].try_into().unwrap_or_default()) != id {
            return Err(DbError::OperationFailed("reverse cursor out of order".into()));
        }
    }
    primary.free_cursor();

    info!("secondary prefix scan in case-insensitive order");
    if email
        .set_cursor(b"a", MatchMode::FindFirst, 1)?
        .is_some()
    {
        let mut previous = vec![];
        while let Some(hit) = email.cursor_next()? {
            hit.read(&mut buf)?;
            let current = buf[EMAIL_OFFSET..EMAIL_OFFSET + EMAIL_LEN].to_vec();
            if !previous.is_empty()
                && EmailKey.compare(&previous, &current, EMAIL_LEN) == CmpOrdering::Greater
            {
                return Err(DbError::OperationFailed("emails out of order".into()));
            }
            previous = current;
        }
    }
    email.free_cursor();

    info!("delete every fifth row");
    for id in (0..ROWS).step_by(5) {
        let key = id.to_le_bytes();
        primary
            .find_tuple(&key, ReadMode::Optimistic, MatchMode::Direct, 8)?
            .ok_or_else(|| DbError::NotFound(format!("key {id} missing pre-delete")))?;
        table.delete_tuple()?;
    }
    for id in 0..ROWS {
        let key = id.to_le_bytes();
        let hit = primary.find_tuple(&key, ReadMode::CrabLock, MatchMode::Direct, 8)?;
        if id % 5 == 0 && hit.is_some() {
            return Err(DbError::OperationFailed("deleted key still found".into()));
        }
        if id % 5 != 0 && hit.is_none() {
            return Err(DbError::OperationFailed("live key lost".into()));
        }
    }
    primary.check_btree()?;
    email.check_btree()?;

    info!("save and restore both trees");
    let primary_file = scratch_path("primary.btr");
    let email_file = scratch_path("email.btr");
    primary.write_btree(&primary_file)?;
    email.write_btree(&email_file)?;
    primary.close()?;
    email.close()?;

    let primary = BTree::create_from_file(
        &primary_file,
        BTreeConfig {
            key: section_key(7),
            key_len: 8,
            keys_per_page: 25,
            pages_per_block: 10,
            kind: IndexKind::Primary,
            kilroy: 1,
        },
        &table,
        Arc::new(LongKey),
    )?;
    let email = BTree::create_from_file(
        &email_file,
        BTreeConfig {
            key: section_key(8),
            key_len: EMAIL_LEN as u32,
            keys_per_page: 25,
            pages_per_block: 10,
            kind: IndexKind::Secondary,
            kilroy: 1,
        },
        &table,
        Arc::new(EmailKey),
    )?;
    primary.check_btree()?;
    email.check_btree()?;
    for id in 0..ROWS {
        let key = id.to_le_bytes();
        let hit = primary.find_tuple(&key, ReadMode::Optimistic, MatchMode::Direct, 8)?;
        if (id % 5 == 0) != hit.is_none() {
            return Err(DbError::OperationFailed("restored tree disagrees".into()));
        }
    }

    info!("randomized two-thread churn");
    churn(&table)?;
    primary.check_btree()?;
    email.check_btree()?;

    primary.close()?;
    email.close()?;
    table.close()?;
    std::fs::remove_file(&primary_file).ok();
    std::fs::remove_file(&email_file).ok();
    Ok(())
}

/// Two workers randomly insert and delete over a private id range each,
/// mixing in index scans, then verify their shadows against the table.
fn churn(table: &SharedTable) -> Result<()> {
    const PER_WORKER: u64 = 25;
    const REPS: usize = 400;
    let key = table.key();

    let mut workers = vec![];
    for worker in 0..2u64 {
        workers.push(thread::spawn(move || -> Result<()> {
            let rt = Arc::new(SyncRuntime::new());
            let kilroy = 100 + worker as u32;
            let table = SharedTable::open(key, kilroy, rt)?;
            let primary = BTree::open(section_key(7), &table, Arc::new(LongKey), kilroy)?;
            let email = BTree::open(section_key(8), &table, Arc::new(EmailKey), kilroy)?;

            let base = 10_000 + worker * PER_WORKER;
            let mut present = [false; PER_WORKER as usize];
            let mut rng = rand::rng();
            for _ in 0..REPS {
                let pick = rng.random_range(0..PER_WORKER);
                let id = base + pick;
                match rng.random_range(0..4) {
                    0 | 1 => {
                        if present[pick as usize] {
                            let hit = primary
                                .find_tuple(
                                    &id.to_le_bytes(),
                                    ReadMode::CrabLock,
                                    MatchMode::Direct,
                                    8,
                                )?
                                .ok_or_else(|| {
                                    DbError::NotFound(format!("worker lost id {id}"))
                                })?;
                            let _ = hit;
                            table.delete_tuple()?;
                            present[pick as usize] = false;
                        } else {
                            table.add_tuple(&demo_record(id))?.unlock()?;
                            present[pick as usize] = true;
                        }
                    }
                    2 => {
                        let _ = primary.find_tuple(
                            &id.to_le_bytes(),
                            ReadMode::Optimistic,
                            MatchMode::Direct,
                            8,
                        )?;
                    }
                    _ => {
                        if email.set_cursor(b"a", MatchMode::FindFirst, 1)?.is_some() {
                            for _ in 0..10 {
                                if email.cursor_next()?.is_none() {
                                    break;
                                }
                            }
                        }
                        email.free_cursor();
                    }
                }
            }

            // Shadow agreement.
            for pick in 0..PER_WORKER {
                let id = base + pick;
                let hit = primary.find_tuple(
                    &id.to_le_bytes(),
                    ReadMode::CrabLock,
                    MatchMode::Direct,
                    8,
                )?;
                if hit.is_some() != present[pick as usize] {
                    return Err(DbError::OperationFailed(format!(
                        "shadow mismatch for id {id}"
                    )));
                }
            }
            primary.close()?;
            email.close()?;
            table.close()?;
            Ok(())
        }));
    }
    for worker in workers {
        worker
            .join()
            .map_err(|_| DbError::OperationFailed("churn worker panicked".into()))??;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------

fn usage() {
    eprintln!("usage: shmdb-test <section>\n");
    eprintln!("where section is one of:\n");
    for section in [
        "KernelSemaphores",
        "SharedMemory",
        "ScratchMemory",
        "SpinLocks",
        "Atomics",
        "ShareLocks",
        "Tables",
        "BTrees",
    ] {
        eprintln!("{section}");
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let section = match std::env::args().nth(1) {
        Some(section) => section,
        None => {
            usage();
            return ExitCode::FAILURE;
        }
    };

    let outcome = match section.to_ascii_lowercase().as_str() {
        "kernelsemaphores" => kernel_semaphores(),
        "sharedmemory" => shared_memory(),
        "scratchmemory" => scratch_memory(),
        "spinlocks" => spin_locks(),
        "atomics" => atomics(),
        "sharelocks" => share_locks(),
        "tables" => tables(),
        "btrees" => btrees(),
        other => {
            error!("{other} is not a recognized section");
            usage();
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(()) => {
            info!("{section}: all tests passed");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{section} failed: {err}");
            ExitCode::FAILURE
        }
    }
}
