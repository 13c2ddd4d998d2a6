// Shared-memory layout of a B-tree.
//
// The header segment (at the tree's key) carries the geometry, the root and
// leaf-edge indices, the free page list and the structure locks. Pages live
// in pool blocks at key + 1 + block_index. A page is a fixed header plus an
// inline key area and a ref area; both leaf and internal pages hold
// key_count (key, ref) entries, internal entry keys being low keys of the
// child subtree. Entry bytes are plain memory deliberately: every write
// happens under the page's exclusive lock and every read under a share, so
// the lock words provide the ordering.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DbError, Result};
use crate::shmem::SharedMem;
use crate::sync::{ShareLock, SpinLock, SyncRuntime};
use crate::table::layout::TableShared;
use crate::table::TupleLoc;

use super::KeyOps;

/// "ATBT" little-endian; sanity check for header segments.
pub(crate) const BTREE_MAGIC: u32 = u32::from_le_bytes(*b"ATBT");

/// Null page index.
pub const NULL_PAGE: u32 = u32::MAX;

/// Leaf flag bit in the page flags word.
pub(crate) const PAGE_LEAF: u32 = 0x1;

#[repr(C)]
pub(crate) struct BTreeHeader {
    pub magic: AtomicU32,
    pub table_key: AtomicU32,
    pub key_len: AtomicU32,
    pub keys_per_page: AtomicU32,
    pub pages_per_block: AtomicU32,
    pub kind: AtomicU32,
    pub root: AtomicU32,
    pub leftmost: AtomicU32,
    pub rightmost: AtomicU32,
    pub page_count: AtomicU32,
    pub block_count: AtomicU32,
    pub free_head: AtomicU32,
    pub users: AtomicU32,
    // Free page list chain lock.
    pub free_lock: SpinLock,
    // Serializes splits, merges and other shape changes.
    pub struct_lock: SpinLock,
    // Descents share this; a structural writer drains them via exclusive.
    pub tree_lock: ShareLock,
}

#[repr(C)]
pub(crate) struct PageHeader {
    pub lock: ShareLock,
    // Parent page index; doubles as the next-free link on the free list.
    pub parent: AtomicU32,
    pub flags: AtomicU32,
    pub key_count: AtomicU32,
    pub prev_leaf: AtomicU32,
    pub next_leaf: AtomicU32,
}

pub(crate) const PAGE_HEADER_BYTES: usize = std::mem::size_of::<PageHeader>();

/// Bytes of one stored ref: (block, slot) for leaves, (child, 0) internal.
pub(crate) const REF_BYTES: usize = 8;

/// Process-shared core of a tree.
pub(crate) struct BTreeShared {
    pub runtime: Arc<SyncRuntime>,
    pub key: i32,
    header_seg: SharedMem,
    blocks: RwLock<Vec<SharedMem>>,
    pub table: Arc<TableShared>,
    pub ops: Arc<dyn KeyOps>,
}

// Safety: raw page contents are only touched under the embedded lock
// protocol; everything process-local sits behind parking_lot locks.
unsafe impl Send for BTreeShared {}
unsafe impl Sync for BTreeShared {}

/// A resolved page: validated pointer plus the geometry needed to slice it.
#[derive(Clone, Copy)]
pub(crate) struct Page {
    base: *mut u8,
    key_len: usize,
    keys_per_page: usize,
    pub index: u32,
}

impl BTreeShared {
    pub(crate) fn create_segments(
        runtime: Arc<SyncRuntime>,
        key: i32,
        table: Arc<TableShared>,
        ops: Arc<dyn KeyOps>,
    ) -> Result<Self> {
        let header_seg = SharedMem::create(key, std::mem::size_of::<BTreeHeader>())?;
        Ok(Self {
            runtime,
            key,
            header_seg,
            blocks: RwLock::new(Vec::new()),
            table,
            ops,
        })
    }

    pub(crate) fn attach_segments(
        runtime: Arc<SyncRuntime>,
        key: i32,
        table: Arc<TableShared>,
        ops: Arc<dyn KeyOps>,
    ) -> Result<Self> {
        let header_seg = SharedMem::attach(key)?;
        if header_seg.len() < std::mem::size_of::<BTreeHeader>() {
            return Err(DbError::BadParameters("undersized tree header segment".into()));
        }
        let shared = Self {
            runtime,
            key,
            header_seg,
            blocks: RwLock::new(Vec::new()),
            table,
            ops,
        };
        if shared.header().magic.load(Ordering::SeqCst) != BTREE_MAGIC {
            return Err(DbError::BadParameters("key does not name a B-tree".into()));
        }
        shared.sync_blocks()?;
        Ok(shared)
    }

    #[inline]
    pub(crate) fn header(&self) -> &BTreeHeader {
        // Safety: segment is at least header-sized and page-aligned; all
        // fields are atomics or lock words.
        unsafe { &*(self.header_seg.base().as_ptr() as *const BTreeHeader) }
    }

    #[inline]
    pub(crate) fn key_len(&self) -> usize {
        self.header().key_len.load(Ordering::SeqCst) as usize
    }

    #[inline]
    pub(crate) fn keys_per_page(&self) -> usize {
        self.header().keys_per_page.load(Ordering::SeqCst) as usize
    }

    /// Byte size of one page in the pool.
    #[inline]
    pub(crate) fn page_bytes(&self) -> usize {
        PAGE_HEADER_BYTES + self.keys_per_page() * (self.key_len() + REF_BYTES)
    }

    fn block_key(&self, index: u32) -> i32 {
        self.key + 1 + index as i32
    }

    /// Attach pool blocks the header advertises that we have not mapped.
    pub(crate) fn sync_blocks(&self) -> Result<()> {
        let advertised = self.header().block_count.load(Ordering::SeqCst);
        {
            if self.blocks.read().len() as u32 >= advertised {
                return Ok(());
            }
        }
        let mut blocks = self.blocks.write();
        while (blocks.len() as u32) < advertised {
            let index = blocks.len() as u32;
            let seg = SharedMem::attach(self.block_key(index))?;
            let pages = self.header().pages_per_block.load(Ordering::SeqCst) as usize;
            if seg.len() < pages * self.page_bytes() {
                return Err(DbError::BadParameters("undersized page block".into()));
            }
            blocks.push(seg);
        }
        Ok(())
    }

    /// Resolve a page index, verifying it against the mapped pool.
    pub(crate) fn page(&self, index: u32) -> Result<Page> {
        if index == NULL_PAGE {
            return Err(DbError::BadParameters("null page index".into()));
        }
        self.sync_blocks()?;
        let per_block = self.header().pages_per_block.load(Ordering::SeqCst);
        let block = index / per_block;
        let offset = (index % per_block) as usize * self.page_bytes();
        let blocks = self.blocks.read();
        let seg = blocks
            .get(block as usize)
            .ok_or_else(|| DbError::BadParameters("page index out of range".into()))?;
        // Safety: offset + page_bytes <= segment length (checked at map
        // time); the mapping outlives self.
        Ok(Page {
            base: unsafe { seg.base().as_ptr().add(offset) },
            key_len: self.key_len(),
            keys_per_page: self.keys_per_page(),
            index,
        })
    }

    /// Pop a page off the free list, growing the pool by one block when the
    /// list is dry. The page comes back zeroed except for its flags.
    pub(crate) fn alloc_page(&self, kilroy: u32, leaf: bool) -> Result<u32> {
        let header = self.header();
        header.free_lock.acquire(&self.runtime, kilroy)?;
        let result = (|| {
            let mut head = header.free_head.load(Ordering::SeqCst);
            if head == NULL_PAGE {
                self.grow_pool(header)?;
                head = header.free_head.load(Ordering::SeqCst);
                if head == NULL_PAGE {
                    return Err(DbError::OutOfMemory("page pool exhausted".into()));
                }
            }
            let page = self.page(head)?;
            header
                .free_head
                .store(page.header().parent.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(head)
        })();
        header.free_lock.release(kilroy)?;

        let index = result?;
        let page = self.page(index)?;
        let ph = page.header();
        ph.parent.store(NULL_PAGE, Ordering::SeqCst);
        ph.flags.store(if leaf { PAGE_LEAF } else { 0 }, Ordering::SeqCst);
        ph.key_count.store(0, Ordering::SeqCst);
        ph.prev_leaf.store(NULL_PAGE, Ordering::SeqCst);
        ph.next_leaf.store(NULL_PAGE, Ordering::SeqCst);
        Ok(index)
    }

    /// Return a page to the free list.
    pub(crate) fn free_page(&self, kilroy: u32, index: u32) -> Result<()> {
        let header = self.header();
        let page = self.page(index)?;
        header.free_lock.acquire(&self.runtime, kilroy)?;
        page.header()
            .parent
            .store(header.free_head.load(Ordering::SeqCst), Ordering::SeqCst);
        page.header().key_count.store(0, Ordering::SeqCst);
        header.free_head.store(index, Ordering::SeqCst);
        header.free_lock.release(kilroy)
    }

    /// Create one more pool block and thread its pages onto the free list.
    /// Caller holds the free-list lock.
    fn grow_pool(&self, header: &BTreeHeader) -> Result<()> {
        let index = header.block_count.load(Ordering::SeqCst);
        let per_block = header.pages_per_block.load(Ordering::SeqCst);
        let seg = SharedMem::create(
            self.block_key(index),
            per_block as usize * self.page_bytes(),
        )?;
        {
            let mut blocks = self.blocks.write();
            if blocks.len() as u32 != index {
                return Err(DbError::OperationFailed("page block map out of step".into()));
            }
            blocks.push(seg);
        }
        header.block_count.store(index + 1, Ordering::SeqCst);

        let first = index * per_block;
        for new_page in first..first + per_block {
            let page = self.page(new_page)?;
            page.header()
                .parent
                .store(header.free_head.load(Ordering::SeqCst), Ordering::SeqCst);
            header.free_head.store(new_page, Ordering::SeqCst);
        }
        header.page_count.store(first + per_block, Ordering::SeqCst);
        Ok(())
    }
}

impl Page {
    #[inline]
    pub(crate) fn header(&self) -> &PageHeader {
        // Safety: base points at a full page inside a live mapping.
        unsafe { &*(self.base as *const PageHeader) }
    }

    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        self.header().flags.load(Ordering::SeqCst) & PAGE_LEAF != 0
    }

    #[inline]
    pub(crate) fn key_count(&self) -> usize {
        self.header().key_count.load(Ordering::SeqCst) as usize
    }

    #[inline]
    fn key_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.keys_per_page);
        // Safety: slot-bounded arithmetic inside the page.
        unsafe { self.base.add(PAGE_HEADER_BYTES + slot * self.key_len) }
    }

    #[inline]
    fn ref_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.keys_per_page);
        // Safety: slot-bounded arithmetic inside the page.
        unsafe {
            self.base
                .add(PAGE_HEADER_BYTES + self.keys_per_page * self.key_len + slot * REF_BYTES)
        }
    }

    /// Borrow the key bytes at `slot`. Caller holds the page lock.
    pub(crate) fn key(&self, slot: usize) -> &[u8] {
        // Safety: in-page, lock-protocol synchronized.
        unsafe { std::slice::from_raw_parts(self.key_ptr(slot), self.key_len) }
    }

    pub(crate) fn ref_at(&self, slot: usize) -> (u32, u32) {
        // Safety: in-page, lock-protocol synchronized.
        unsafe {
            let p = self.ref_ptr(slot);
            let mut a = [0u8; 4];
            let mut b = [0u8; 4];
            std::ptr::copy_nonoverlapping(p, a.as_mut_ptr(), 4);
            std::ptr::copy_nonoverlapping(p.add(4), b.as_mut_ptr(), 4);
            (u32::from_le_bytes(a), u32::from_le_bytes(b))
        }
    }

    pub(crate) fn tuple_ref(&self, slot: usize) -> TupleLoc {
        let (block, tuple_slot) = self.ref_at(slot);
        TupleLoc {
            block,
            slot: tuple_slot,
        }
    }

    pub(crate) fn child(&self, slot: usize) -> u32 {
        self.ref_at(slot).0
    }

    pub(crate) fn set_entry(&self, slot: usize, key: &[u8], r: (u32, u32)) {
        debug_assert_eq!(key.len(), self.key_len);
        // Safety: in-page, caller holds the exclusive lock.
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), self.key_ptr(slot), self.key_len);
            let p = self.ref_ptr(slot);
            std::ptr::copy_nonoverlapping(r.0.to_le_bytes().as_ptr(), p, 4);
            std::ptr::copy_nonoverlapping(r.1.to_le_bytes().as_ptr(), p.add(4), 4);
        }
    }

    /// Shift entries right and place (key, ref) at `slot`. Caller holds the
    /// exclusive lock and has verified there is room.
    pub(crate) fn insert_entry(&self, slot: usize, key: &[u8], r: (u32, u32)) {
        let count = self.key_count();
        debug_assert!(slot <= count && count < self.keys_per_page);
        // Safety: shifting inside the fixed arrays; bounds asserted.
        unsafe {
            std::ptr::copy(
                self.key_ptr(slot),
                self.key_ptr(slot + 1),
                (count - slot) * self.key_len,
            );
            std::ptr::copy(
                self.ref_ptr(slot),
                self.ref_ptr(slot + 1),
                (count - slot) * REF_BYTES,
            );
        }
        self.set_entry(slot, key, r);
        self.header()
            .key_count
            .store(count as u32 + 1, Ordering::SeqCst);
    }

    /// Remove the entry at `slot`, shifting the rest left.
    pub(crate) fn remove_entry(&self, slot: usize) {
        let count = self.key_count();
        debug_assert!(slot < count);
        // Safety: shifting inside the fixed arrays; bounds asserted.
        unsafe {
            std::ptr::copy(
                self.key_ptr(slot + 1),
                self.key_ptr(slot),
                (count - slot - 1) * self.key_len,
            );
            std::ptr::copy(
                self.ref_ptr(slot + 1),
                self.ref_ptr(slot),
                (count - slot - 1) * REF_BYTES,
            );
        }
        self.header()
            .key_count
            .store(count as u32 - 1, Ordering::SeqCst);
    }

    /// Move entries `from..count` into the front of `dst` (which is empty).
    pub(crate) fn split_off(&self, from: usize, dst: &Page) {
        let count = self.key_count();
        debug_assert!(from <= count && dst.key_count() == 0);
        let moved = count - from;
        // Safety: disjoint pages, bounds asserted.
        unsafe {
            std::ptr::copy_nonoverlapping(self.key_ptr(from), dst.key_ptr(0), moved * self.key_len);
            std::ptr::copy_nonoverlapping(self.ref_ptr(from), dst.ref_ptr(0), moved * REF_BYTES);
        }
        self.header().key_count.store(from as u32, Ordering::SeqCst);
        dst.header().key_count.store(moved as u32, Ordering::SeqCst);
    }

    /// Append every entry of `src` after this page's entries.
    pub(crate) fn absorb(&self, src: &Page) {
        let count = self.key_count();
        let moved = src.key_count();
        debug_assert!(count + moved <= self.keys_per_page);
        // Safety: disjoint pages, bounds asserted.
        unsafe {
            std::ptr::copy_nonoverlapping(src.key_ptr(0), self.key_ptr(count), moved * self.key_len);
            std::ptr::copy_nonoverlapping(src.ref_ptr(0), self.ref_ptr(count), moved * REF_BYTES);
        }
        self.header()
            .key_count
            .store((count + moved) as u32, Ordering::SeqCst);
        src.header().key_count.store(0, Ordering::SeqCst);
    }
}
