// ShmDB - multi-process shared-memory database toolkit
// Core library module

pub mod btree;
pub mod error;
pub mod shmem;
pub mod sync;
pub mod table;

pub use btree::{BTree, BTreeCheck, BTreeConfig, IndexKind, KeyOps, MatchMode, ReadMode};
pub use error::{DbError, Result};
pub use shmem::{ScratchMem, SharedMem};
pub use sync::{KernelSem, ShareLock, SpinLock, SyncRuntime};
pub use table::{SharedTable, TableConfig, TupleGuard, TupleLoc, TupleRef};
