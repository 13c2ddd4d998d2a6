// User-space synchronization for shared memory.
//
// Lock words are bare 32-bit atomics so they can be embedded directly in
// mapped headers and coordinate every process attached to the segment.

pub mod atomics;
pub mod backoff;
pub mod semaphore;
pub mod sharelock;
pub mod spinlock;

pub use atomics::{atomic_add, atomic_dec, atomic_inc, atomic_sub, cas32, read_cpu_ticks};
pub use backoff::{CpuInfo, SyncRuntime};
pub use semaphore::KernelSem;
pub use sharelock::{ShareLock, SHARE_EXCLUSIVE, SHARE_READER_MASK};
pub use spinlock::SpinLock;

/// Cache line size used to pad hot shared structures.
pub const CACHE_LINE_SIZE: usize = 64;
