// 32-bit atomic primitives for lock words in shared memory.
//
// Every cross-process cell in this crate is an AtomicU32; nothing relies on
// implicit load/store atomicity. All operations are full-fence on their
// target word.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{DbError, Result};

/// Compare `old` with `cell` and, if identical, store `new`.
///
/// Returns `ObjectInUse` when the observed value differs from `old`. One
/// shot only; retry policy belongs to the caller.
#[inline]
pub fn cas32(cell: &AtomicU32, old: u32, new: u32) -> Result<()> {
    match cell.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => Ok(()),
        Err(_) => Err(DbError::ObjectInUse("compare and exchange lost".into())),
    }
}

#[inline]
pub fn atomic_add(cell: &AtomicU32, value: u32) -> u32 {
    cell.fetch_add(value, Ordering::SeqCst)
}

#[inline]
pub fn atomic_sub(cell: &AtomicU32, value: u32) -> u32 {
    cell.fetch_sub(value, Ordering::SeqCst)
}

#[inline]
pub fn atomic_inc(cell: &AtomicU32) -> u32 {
    cell.fetch_add(1, Ordering::SeqCst)
}

#[inline]
pub fn atomic_dec(cell: &AtomicU32) -> u32 {
    cell.fetch_sub(1, Ordering::SeqCst)
}

/// Current value of the CPU tick counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn read_cpu_ticks() -> u64 {
    // Safety: rdtsc has no memory operands and is available on every
    // x86_64 part this crate targets.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Monotonic-clock stand-in on targets without a tick counter instruction.
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn read_cpu_ticks() -> u64 {
    use std::time::Instant;
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
