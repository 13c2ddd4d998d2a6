// Shared-memory tables of fixed-size tuples.

pub(crate) mod layout;
mod persist;
mod table;

pub use layout::{TupleLoc, MAX_BLOCKS, MAX_FREE_LISTS, NULL_LINK};
pub use table::{SharedTable, TupleGuard, TupleRef};

use crate::error::Result;

/// Construction options for a shared table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Host-wide shared-memory key. Block `n` lands at `key + 1 + n`, so
    /// leave room below the next IPC object.
    pub key: i32,
    /// Bytes per tuple payload.
    pub tuple_size: u32,
    /// Slot count of the first block.
    pub initial_alloc: u32,
    /// Slot count of each growth block.
    pub growth_alloc: u32,
    /// When true, deletes park on queued delete lists until the reuse ring
    /// says no cursor can still reference them; when false they return to
    /// the add pool immediately.
    pub queue_changes: bool,
    /// Delete-list fan-out (contention striping).
    pub delete_lists: u32,
    /// Add-list fan-out (contention striping).
    pub add_lists: u32,
    /// Caller identity for lock words; non-zero, e.g. pid mixed with tid.
    pub kilroy: u32,
}

/// An order-preserving structure attached to a table; every tuple add and
/// delete fans out through the registered hooks of the owning process.
pub trait TupleIndex: Send + Sync {
    /// Index the tuple at `loc`. A primary-uniqueness violation surfaces as
    /// `ObjectInUse` and vetoes the enclosing add.
    fn insert_entry(&self, kilroy: u32, loc: TupleLoc, tuple: &[u8]) -> Result<()>;

    /// Drop the entry for the tuple at `loc`.
    fn remove_entry(&self, kilroy: u32, loc: TupleLoc, tuple: &[u8]) -> Result<()>;
}
