// Share lock: any number of readers, one writer.
//
// State encoding (32-bit atomic):
// - Bits 0-27: reader count
// - Bits 28-31: exclusive-intent flag (all four set at once, 0xF0000000)
//
// Readers pay one atomic increment on the hot path and roll back if the
// exclusive flag landed first. Writers install the flag with a cas (two
// writers must never both believe they own it), then wait for the reader
// count to drain. The queued-exclusive variant splits those two phases so
// a writer can reserve intent on a page while readers finish their step.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{DbError, Result};
use crate::sync::atomics::cas32;
use crate::sync::backoff::SyncRuntime;

/// Writer-intent flag occupying the top four bits of the lock word.
pub const SHARE_EXCLUSIVE: u32 = 0xF000_0000;
/// Mask selecting the reader count.
pub const SHARE_READER_MASK: u32 = 0x0FFF_FFFF;

/// A reader-writer lock word, embeddable in `repr(C)` shared headers.
#[repr(transparent)]
pub struct ShareLock(AtomicU32);

impl ShareLock {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Take a share, blocking until the exclusive flag is clear.
    pub fn share(&self, rt: &SyncRuntime) {
        let mut attempts: u32 = 0;
        loop {
            if self.try_share().is_ok() {
                return;
            }
            rt.backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
    }

    /// One trial increment; rolled back if a writer holds or wants the lock.
    pub fn try_share(&self) -> Result<()> {
        if self.0.load(Ordering::SeqCst) & SHARE_EXCLUSIVE == 0 {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.0.load(Ordering::SeqCst) & SHARE_EXCLUSIVE == 0 {
                return Ok(());
            }
            // A writer's flag landed between our increment and the check;
            // pull the increment back off.
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
        Err(DbError::ObjectInUse("share lock has exclusive intent".into()))
    }

    pub fn release_share(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    /// Take the lock exclusively, waiting out both rival writers and the
    /// reader drain.
    pub fn exclusive(&self, rt: &SyncRuntime) {
        let mut attempts: u32 = 0;
        loop {
            let seen = self.0.load(Ordering::SeqCst);
            if seen & SHARE_EXCLUSIVE == 0
                && cas32(&self.0, seen, seen | SHARE_EXCLUSIVE).is_ok()
            {
                break;
            }
            rt.backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
        self.wait_readers(rt);
    }

    /// Install the flag unless another writer already has it; then wait for
    /// readers to drain. Contention from mere readers is retried.
    pub fn try_exclusive(&self, rt: &SyncRuntime) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            let seen = self.0.load(Ordering::SeqCst);
            if seen & SHARE_EXCLUSIVE != 0 {
                return Err(DbError::ObjectInUse("another exclusive holder".into()));
            }
            if cas32(&self.0, seen, seen | SHARE_EXCLUSIVE).is_ok() {
                break;
            }
            // Could be just a reader count moving under us.
            rt.backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
        self.wait_readers(rt);
        Ok(())
    }

    /// Phase one of the three-phase protocol: install exclusive intent and
    /// return immediately, readers still draining. The caller must follow
    /// up with `wait_queue_exclusive` before touching protected state, or
    /// cancel with `remove_queue_exclusive`.
    pub fn queue_exclusive(&self, rt: &SyncRuntime) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            let seen = self.0.load(Ordering::SeqCst);
            if seen & SHARE_EXCLUSIVE != 0 {
                return Err(DbError::ObjectInUse("another exclusive holder".into()));
            }
            if cas32(&self.0, seen, seen | SHARE_EXCLUSIVE).is_ok() {
                return Ok(());
            }
            rt.backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
    }

    /// Phase two: block until the reader count reaches zero. Only valid
    /// after a successful `queue_exclusive`.
    pub fn wait_queue_exclusive(&self, rt: &SyncRuntime) {
        self.wait_readers(rt);
    }

    /// Cancel a queued exclusive, preserving whatever reader count is
    /// present.
    pub fn remove_queue_exclusive(&self, rt: &SyncRuntime) {
        let mut attempts: u32 = 0;
        loop {
            let seen = self.0.load(Ordering::SeqCst);
            if cas32(&self.0, seen, seen & SHARE_READER_MASK).is_ok() {
                return;
            }
            // Readers are still adjusting the count under us.
            rt.backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
    }

    /// Drop an exclusively held lock. Fails if readers are somehow still
    /// counted: storing zero then would lose their decrements and drive the
    /// word negative.
    pub fn release_exclusive(&self) -> Result<()> {
        if self.0.load(Ordering::SeqCst) != SHARE_EXCLUSIVE {
            return Err(DbError::UnsafeOperation(
                "freeing a share exclusive while readers remain".into(),
            ));
        }
        self.0.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Raw word, for diagnostics and structure validation.
    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reader_count(&self) -> u32 {
        self.raw() & SHARE_READER_MASK
    }

    pub fn has_exclusive(&self) -> bool {
        self.raw() & SHARE_EXCLUSIVE != 0
    }

    fn wait_readers(&self, rt: &SyncRuntime) {
        let mut attempts: u32 = 0;
        while self.0.load(Ordering::SeqCst) != SHARE_EXCLUSIVE {
            rt.backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
    }
}

impl Default for ShareLock {
    fn default() -> Self {
        Self::new()
    }
}
