// Shared memory segments and the process-local scratch arena.

pub mod scratch;
pub mod segment;

pub use scratch::{ScratchMem, MEM_ALIGN};
pub use segment::SharedMem;
