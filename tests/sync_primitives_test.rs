// Cross-thread behavior of the lock primitives, driven the way the table
// and tree layers drive them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmdb::sync::{read_cpu_ticks, SHARE_EXCLUSIVE};
use shmdb::{KernelSem, ShareLock, SharedMem, SpinLock, SyncRuntime};

fn test_key(slot: i32) -> i32 {
    ((std::process::id() as i32) & 0x0007_FFFF) << 12 | (0x100 + slot)
}

#[test]
fn test_queued_exclusive_three_phase_protocol() {
    let rt = Arc::new(SyncRuntime::new());
    let lock = Arc::new(ShareLock::new());
    let writer_in = Arc::new(AtomicBool::new(false));

    // Readers pile in first.
    lock.share(&rt);
    lock.share(&rt);
    lock.share(&rt);

    // Queueing returns immediately even with readers active.
    lock.queue_exclusive(&rt).unwrap();
    assert!(lock.has_exclusive());
    assert_eq!(lock.reader_count(), 3);

    let waiter = {
        let rt = Arc::clone(&rt);
        let lock = Arc::clone(&lock);
        let writer_in = Arc::clone(&writer_in);
        thread::spawn(move || {
            lock.wait_queue_exclusive(&rt);
            writer_in.store(true, Ordering::SeqCst);
            assert_eq!(lock.raw(), SHARE_EXCLUSIVE);
            lock.release_exclusive().unwrap();
        })
    };

    // The wait only returns once the last reader drains.
    thread::sleep(Duration::from_millis(30));
    assert!(!writer_in.load(Ordering::SeqCst));
    lock.release_share();
    lock.release_share();
    thread::sleep(Duration::from_millis(30));
    assert!(!writer_in.load(Ordering::SeqCst), "writer entered early");
    lock.release_share();
    waiter.join().unwrap();
    assert!(writer_in.load(Ordering::SeqCst));
    assert_eq!(lock.raw(), 0);

    // Cancelling the intent lets readers through again.
    lock.share(&rt);
    lock.queue_exclusive(&rt).unwrap();
    assert!(lock.try_share().is_err());
    lock.remove_queue_exclusive(&rt);
    lock.try_share().unwrap();
    lock.release_share();
    lock.release_share();
}

#[test]
fn test_spin_lock_in_shared_memory() {
    // A lock word living inside a mapped segment coordinates two
    // attachments exactly like a process-local one.
    fn lock_of(seg: &SharedMem) -> &SpinLock {
        unsafe { &*(seg.base().as_ptr() as *const SpinLock) }
    }
    fn cell_of(seg: &SharedMem) -> &AtomicU32 {
        unsafe { &*(seg.base().as_ptr().add(64) as *const AtomicU32) }
    }

    let rt = Arc::new(SyncRuntime::new());
    let seg_a = Arc::new(SharedMem::create(test_key(0), 4096).unwrap());
    let seg_b = Arc::new(SharedMem::attach(test_key(0)).unwrap());

    let mut handles = vec![];
    for (id, seg) in [(1u32, Arc::clone(&seg_a)), (2u32, Arc::clone(&seg_b))] {
        let rt = Arc::clone(&rt);
        handles.push(thread::spawn(move || {
            let lock = unsafe { &*(seg.base().as_ptr() as *const SpinLock) };
            let cell = unsafe { &*(seg.base().as_ptr().add(64) as *const AtomicU32) };
            for _ in 0..5_000 {
                lock.acquire(&rt, id).unwrap();
                let seen = cell.load(Ordering::Relaxed);
                cell.store(seen + 1, Ordering::Relaxed);
                lock.release(id).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(cell_of(&seg_a).load(Ordering::SeqCst), 10_000);
    assert_eq!(lock_of(&seg_b).holder(), 0);
}

#[test]
fn test_kernel_semaphore_between_handles() {
    let key = test_key(1);
    let mut first = KernelSem::new();
    first.create(key).unwrap();
    let mut second = KernelSem::new();
    second.open(key).unwrap();

    first.get_lock().unwrap();
    assert!(second.try_lock().is_err());

    let passer = thread::spawn(move || {
        second.get_lock().unwrap();
        second.free_lock().unwrap();
        second.close().unwrap();
    });
    thread::sleep(Duration::from_millis(20));
    first.free_lock().unwrap();
    passer.join().unwrap();
    first.close().unwrap();
}

#[test]
fn test_arbitrate_makes_progress_under_contention() {
    // Two threads repeatedly take two locks in opposite order, bailing and
    // arbitrating on failure; both must finish.
    let rt = Arc::new(SyncRuntime::new());
    let locks = Arc::new((SpinLock::new(), SpinLock::new()));

    let mut handles = vec![];
    for id in 1..=2u32 {
        let rt = Arc::clone(&rt);
        let locks = Arc::clone(&locks);
        handles.push(thread::spawn(move || {
            for _ in 0..2_000 {
                let (first, second) = if id == 1 {
                    (&locks.0, &locks.1)
                } else {
                    (&locks.1, &locks.0)
                };
                let mut attempts = 0;
                loop {
                    first.acquire(&rt, id).unwrap();
                    if second.try_acquire(id).is_ok() {
                        break;
                    }
                    // Would deadlock; back all the way out and yield.
                    first.release(id).unwrap();
                    rt.arbitrate(attempts);
                    attempts += 1;
                }
                second.release(id).unwrap();
                first.release(id).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(locks.0.holder(), 0);
    assert_eq!(locks.1.holder(), 0);
}

#[test]
fn test_cpu_ticks_monotone_enough() {
    let a = read_cpu_ticks();
    thread::sleep(Duration::from_millis(1));
    let b = read_cpu_ticks();
    assert!(b > a);
}
