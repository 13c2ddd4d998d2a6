// Shared-memory B-tree indexes over a table.

mod cursor;
mod layout;
mod persist;
mod tree;

pub use layout::NULL_PAGE;
pub use tree::{BTree, BTreeCheck};

use std::cmp::Ordering;

/// Key extraction and comparison, supplied at construction and invoked in
/// the hot path. Implementations must be pure: the same tuple bytes always
/// yield the same key, and `compare` must be a total order on any prefix
/// length it is called with.
pub trait KeyOps: Send + Sync {
    /// Borrow the key bytes out of a tuple payload. Must be at least the
    /// tree's key length.
    fn extract<'a>(&self, tuple: &'a [u8]) -> &'a [u8];

    /// Three-way comparison over the first `len` bytes of each key.
    fn compare(&self, a: &[u8], b: &[u8], len: usize) -> Ordering;
}

/// Primary trees enforce key uniqueness; secondary trees accept duplicates
/// and preserve insertion order within equal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Primary = 1,
    Secondary = 2,
}

/// Descent locking style for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Lock one page at a time and recheck bounds after each hop; restarts
    /// from the root on a mismatch.
    Optimistic,
    /// Hold the parent share until the child is share-locked; no restarts.
    CrabLock,
}

/// How a search key is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Exact equality over the full key length.
    Direct,
    /// Smallest key equal on the given prefix length.
    FindFirst,
    /// Largest key equal on the given prefix length.
    FindLast,
}

/// Construction options for a B-tree.
#[derive(Debug, Clone)]
pub struct BTreeConfig {
    /// Host-wide shared-memory key; page block `n` lands at `key + 1 + n`.
    pub key: i32,
    /// Fixed width of the stored keys in bytes.
    pub key_len: u32,
    /// Entries per page. A major lever for balancing parallel throughput
    /// against fan-out; must be at least 4.
    pub keys_per_page: u32,
    /// Pages added per pool growth.
    pub pages_per_block: u32,
    pub kind: IndexKind,
    /// Caller identity for the structural lock words.
    pub kilroy: u32,
}
