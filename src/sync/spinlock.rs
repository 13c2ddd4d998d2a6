// Kilroy-tagged exclusive spin lock.
//
// The lock is a single 32-bit word: zero means free, any non-zero value is
// the holder's kilroy (a caller-chosen identity such as process id mixed
// with thread id). Locks are process-local unless the word lives in shared
// memory, in which case they coordinate every attached process. Release
// requires the matching kilroy, so a foreign release is rejected rather
// than silently corrupting the word, and a stale holder is visible to
// external repair tooling.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{DbError, Result};
use crate::sync::atomics::cas32;
use crate::sync::backoff::SyncRuntime;

/// An exclusive lock word, embeddable in `repr(C)` shared-memory headers.
#[repr(transparent)]
pub struct SpinLock(AtomicU32);

impl SpinLock {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Take ownership, blocking through the adaptive back-off until we get
    /// it. `kilroy` must be non-zero.
    pub fn acquire(&self, rt: &SyncRuntime, kilroy: u32) -> Result<()> {
        if kilroy == 0 {
            return Err(DbError::BadParameters("kilroy must be non-zero".into()));
        }
        let mut attempts: u32 = 0;
        loop {
            // No point even trying a cas while it is held.
            if self.0.load(Ordering::SeqCst) == 0 && cas32(&self.0, 0, kilroy).is_ok() {
                return Ok(());
            }
            rt.backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
    }

    /// One read, one cas; `ObjectInUse` if somebody holds it.
    pub fn try_acquire(&self, kilroy: u32) -> Result<()> {
        if kilroy == 0 {
            return Err(DbError::BadParameters("kilroy must be non-zero".into()));
        }
        if self.0.load(Ordering::SeqCst) == 0 && cas32(&self.0, 0, kilroy).is_ok() {
            return Ok(());
        }
        Err(DbError::ObjectInUse("spin lock held".into()))
    }

    /// Release, verifying ownership first.
    pub fn release(&self, kilroy: u32) -> Result<()> {
        if self.0.load(Ordering::SeqCst) == kilroy {
            self.0.store(0, Ordering::SeqCst);
            Ok(())
        } else {
            Err(DbError::BadParameters(
                "releasing a spin lock owned by someone else".into(),
            ))
        }
    }

    /// Current holder's kilroy, zero when free. Diagnostic only; the value
    /// can be stale by the time the caller looks at it.
    pub fn holder(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release() {
        let rt = SyncRuntime::new();
        let lock = SpinLock::new();

        lock.acquire(&rt, 42).unwrap();
        assert_eq!(lock.holder(), 42);
        lock.release(42).unwrap();
        assert_eq!(lock.holder(), 0);
    }

    #[test]
    fn test_foreign_release_rejected() {
        let rt = SyncRuntime::new();
        let lock = SpinLock::new();

        lock.acquire(&rt, 1).unwrap();
        let err = lock.release(2).unwrap_err();
        assert_eq!(err.kind(), "bad_parameters");
        lock.release(1).unwrap();
    }

    #[test]
    fn test_try_acquire_bounces() {
        let rt = SyncRuntime::new();
        let lock = SpinLock::new();

        lock.acquire(&rt, 1).unwrap();
        assert_eq!(lock.try_acquire(2).unwrap_err().kind(), "object_in_use");
        lock.release(1).unwrap();
        lock.try_acquire(2).unwrap();
        lock.release(2).unwrap();
    }

    #[test]
    fn test_zero_kilroy_rejected() {
        let rt = SyncRuntime::new();
        let lock = SpinLock::new();
        assert!(lock.acquire(&rt, 0).is_err());
        assert!(lock.try_acquire(0).is_err());
    }

    #[test]
    fn test_mutual_exclusion() {
        let rt = Arc::new(SyncRuntime::new());
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = vec![];
        for id in 1..=8u32 {
            let rt = Arc::clone(&rt);
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    lock.acquire(&rt, id).unwrap();
                    // Non-atomic read-modify-write under the lock.
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                    lock.release(id).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8_000);
    }
}
