// Shared-memory layout of a table.
//
// The header segment (at the table's key) holds the geometry, the table
// exclusive lock and the striped free-list heads. Tuple blocks are separate
// segments at key + 1 + block_index; each slot is a small control header
// followed by the tuple payload. All cross-process fields are atomics, and
// every (block, slot) handle is bounds-checked on resolution before it is
// turned into a pointer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DbError, Result};
use crate::shmem::{SharedMem, MEM_ALIGN};
use crate::sync::{SpinLock, SyncRuntime};

/// "ATTB" little-endian; sanity check for header segments.
pub(crate) const TABLE_MAGIC: u32 = u32::from_le_bytes(*b"ATTB");

/// Null value for free-list links and block indices.
pub const NULL_LINK: u32 = u32::MAX;

/// Upper bound on add/delete list fan-out; the header embeds the arrays.
pub const MAX_FREE_LISTS: usize = 16;

/// Upper bound on tuple blocks a table may grow to.
pub const MAX_BLOCKS: u32 = 4096;

/// Live tuple, reachable by iteration.
pub(crate) const SLOT_LIVE: u32 = 0x1;
/// Freed but parked on a queued delete list, not yet eligible for reuse.
pub(crate) const SLOT_DELETE_PENDING: u32 = 0x2;

/// Coordinates of a tuple slot, stable across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleLoc {
    pub block: u32,
    pub slot: u32,
}

/// One striped free pool: a singly linked chain of slots plus its lock.
#[repr(C)]
pub(crate) struct FreeList {
    pub lock: SpinLock,
    pub head_block: AtomicU32,
    pub head_slot: AtomicU32,
    pub count: AtomicU32,
}

#[repr(C)]
pub(crate) struct TableHeader {
    pub magic: AtomicU32,
    pub tuple_size: AtomicU32,
    pub initial_alloc: AtomicU32,
    pub growth_alloc: AtomicU32,
    pub add_list_count: AtomicU32,
    pub delete_list_count: AtomicU32,
    pub queue_changes: AtomicU32,
    pub block_count: AtomicU32,
    pub users: AtomicU32,
    // Guards growth and free-list restructuring only; steady-state paths
    // use the per-list and per-slot locks.
    pub table_lock: SpinLock,
    pub add_lists: [FreeList; MAX_FREE_LISTS],
    pub delete_lists: [FreeList; MAX_FREE_LISTS],
}

/// Control header at the front of every slot.
#[repr(C)]
pub(crate) struct SlotHeader {
    pub lock: SpinLock,
    pub flags: AtomicU32,
    pub next_block: AtomicU32,
    pub next_slot: AtomicU32,
}

pub(crate) const SLOT_HEADER_BYTES: usize = std::mem::size_of::<SlotHeader>();

struct BlockMap {
    seg: SharedMem,
    slots: u32,
}

/// Process-shared core of a table: the mapped segments plus the registry
/// of indexes attached by this process.
pub(crate) struct TableShared {
    pub runtime: Arc<SyncRuntime>,
    pub key: i32,
    header_seg: SharedMem,
    blocks: RwLock<Vec<BlockMap>>,
    pub indexes: RwLock<Vec<std::sync::Weak<dyn crate::table::TupleIndex>>>,
}

// Safety: all shared state behind the raw mappings is atomic or guarded by
// the embedded lock words; process-local state is behind parking_lot locks.
unsafe impl Send for TableShared {}
unsafe impl Sync for TableShared {}

impl TableShared {
    pub(crate) fn create_segments(runtime: Arc<SyncRuntime>, key: i32) -> Result<Self> {
        let header_seg = SharedMem::create(key, std::mem::size_of::<TableHeader>())?;
        Ok(Self {
            runtime,
            key,
            header_seg,
            blocks: RwLock::new(Vec::new()),
            indexes: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn attach_segments(runtime: Arc<SyncRuntime>, key: i32) -> Result<Self> {
        let header_seg = SharedMem::attach(key)?;
        if header_seg.len() < std::mem::size_of::<TableHeader>() {
            return Err(DbError::BadParameters("undersized table header segment".into()));
        }
        let shared = Self {
            runtime,
            key,
            header_seg,
            blocks: RwLock::new(Vec::new()),
            indexes: RwLock::new(Vec::new()),
        };
        if shared.header().magic.load(Ordering::SeqCst) != TABLE_MAGIC {
            return Err(DbError::BadParameters("key does not name a table".into()));
        }
        shared.sync_blocks()?;
        Ok(shared)
    }

    #[inline]
    pub(crate) fn header(&self) -> &TableHeader {
        // Safety: the segment is at least header-sized (checked on attach,
        // sized on create), page-aligned by shmat, and all fields are
        // atomics or lock words.
        unsafe { &*(self.header_seg.base().as_ptr() as *const TableHeader) }
    }

    /// Payload stride of one slot, header included.
    #[inline]
    pub(crate) fn slot_stride(&self) -> usize {
        let tuple = self.header().tuple_size.load(Ordering::SeqCst) as usize;
        SLOT_HEADER_BYTES + ((tuple + MEM_ALIGN - 1) & !(MEM_ALIGN - 1))
    }

    /// Slot capacity of block `index` per the table geometry.
    pub(crate) fn block_slots(&self, index: u32) -> u32 {
        if index == 0 {
            self.header().initial_alloc.load(Ordering::SeqCst)
        } else {
            self.header().growth_alloc.load(Ordering::SeqCst)
        }
    }

    /// Attach any blocks the header advertises that we have not mapped yet.
    pub(crate) fn sync_blocks(&self) -> Result<()> {
        let advertised = self.header().block_count.load(Ordering::SeqCst);
        {
            let blocks = self.blocks.read();
            if blocks.len() as u32 >= advertised {
                return Ok(());
            }
        }
        let mut blocks = self.blocks.write();
        while (blocks.len() as u32) < advertised {
            let index = blocks.len() as u32;
            let seg = SharedMem::attach(self.block_key(index))?;
            let slots = self.block_slots(index);
            if seg.len() < slots as usize * self.slot_stride() {
                return Err(DbError::BadParameters("undersized tuple block".into()));
            }
            blocks.push(BlockMap { seg, slots });
        }
        Ok(())
    }

    /// Create and map the next tuple block. Caller holds the table lock.
    pub(crate) fn create_block(&self, index: u32, slots: u32) -> Result<()> {
        if index >= MAX_BLOCKS {
            return Err(DbError::OutOfMemory("table block limit reached".into()));
        }
        let seg = SharedMem::create(self.block_key(index), slots as usize * self.slot_stride())?;
        let mut blocks = self.blocks.write();
        if blocks.len() as u32 != index {
            return Err(DbError::OperationFailed("table block map out of step".into()));
        }
        blocks.push(BlockMap { seg, slots });
        Ok(())
    }

    #[inline]
    fn block_key(&self, index: u32) -> i32 {
        self.key + 1 + index as i32
    }

    pub(crate) fn block_count(&self) -> u32 {
        self.header().block_count.load(Ordering::SeqCst)
    }

    /// Resolve a slot handle to its control header, verifying bounds.
    pub(crate) fn slot(&self, loc: TupleLoc) -> Result<&SlotHeader> {
        let blocks = self.blocks.read();
        let block = blocks
            .get(loc.block as usize)
            .ok_or_else(|| DbError::BadParameters("tuple block out of range".into()))?;
        if loc.slot >= block.slots {
            return Err(DbError::BadParameters("tuple slot out of range".into()));
        }
        let offset = loc.slot as usize * self.slot_stride();
        // Safety: offset + stride <= segment length (checked at map time),
        // the base is page-aligned and the header is all atomics. The
        // reference cannot outlive self because the segment mapping does not.
        Ok(unsafe { &*(block.seg.base().as_ptr().add(offset) as *const SlotHeader) })
    }

    /// Raw payload pointer for a slot already validated via `slot`.
    pub(crate) fn payload_ptr(&self, loc: TupleLoc) -> Result<*mut u8> {
        let blocks = self.blocks.read();
        let block = blocks
            .get(loc.block as usize)
            .ok_or_else(|| DbError::BadParameters("tuple block out of range".into()))?;
        if loc.slot >= block.slots {
            return Err(DbError::BadParameters("tuple slot out of range".into()));
        }
        let offset = loc.slot as usize * self.slot_stride() + SLOT_HEADER_BYTES;
        // Safety: in-bounds per the checks above.
        Ok(unsafe { block.seg.base().as_ptr().add(offset) })
    }

    pub(crate) fn tuple_size(&self) -> usize {
        self.header().tuple_size.load(Ordering::SeqCst) as usize
    }

    /// Whether a slot currently carries a live tuple. Unlocked peek; the
    /// answer can go stale the moment it is returned.
    pub(crate) fn slot_live(&self, loc: TupleLoc) -> Result<bool> {
        Ok(self.slot(loc)?.flags.load(Ordering::SeqCst) & SLOT_LIVE != 0)
    }

    /// Copy a tuple payload out into `buf`.
    pub(crate) fn read_payload(&self, loc: TupleLoc, buf: &mut [u8]) -> Result<usize> {
        let n = self.tuple_size().min(buf.len());
        let src = self.payload_ptr(loc)?;
        // Safety: src spans tuple_size bytes inside the mapped block.
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), n) };
        Ok(n)
    }

    /// Copy `src` into a tuple payload. Caller holds the slot lock.
    pub(crate) fn write_payload(&self, loc: TupleLoc, src: &[u8]) -> Result<()> {
        if src.len() != self.tuple_size() {
            return Err(DbError::BadParameters("tuple payload size mismatch".into()));
        }
        let dst = self.payload_ptr(loc)?;
        // Safety: dst spans tuple_size bytes inside the mapped block.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }
}
