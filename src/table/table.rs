// The shared table proper: striped free pools, growth, per-tuple locks,
// cursors, and the index fan-out that keeps attached B-trees consistent.
//
// Concurrency policy: the table exclusive lock guards growth and free-list
// restructuring only. Steady-state adds, deletes and scans use the per-list
// spin locks and the per-slot locks; a scanning reader takes no global lock
// and re-verifies each slot's liveness under its lock before yielding it.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{DbError, Result};
use crate::sync::SyncRuntime;

use super::layout::{
    FreeList, TableShared, TupleLoc, MAX_FREE_LISTS, NULL_LINK, SLOT_DELETE_PENDING, SLOT_LIVE,
    TABLE_MAGIC,
};
use super::{TableConfig, TupleIndex};

#[derive(Debug, Clone, Copy)]
enum CursorPos {
    BeforeStart,
    At(TupleLoc),
    AfterEnd,
}

/// A per-process handle onto a shared table. Each handle carries its own
/// cursor and kilroy; open additional handles for additional threads.
pub struct SharedTable {
    shared: Arc<TableShared>,
    kilroy: u32,
    cursor: Mutex<CursorPos>,
    // Rotates deletes across the queued lists so the reuse ring advances
    // even under a single writer.
    delete_stripe: std::sync::atomic::AtomicU32,
}

impl SharedTable {
    /// Create the table and its first tuple block. Fails if `key` exists.
    pub fn create(config: TableConfig, runtime: Arc<SyncRuntime>) -> Result<Self> {
        Self::validate(&config)?;
        let shared = Arc::new(TableShared::create_segments(runtime, config.key)?);
        let table = Self {
            shared,
            kilroy: config.kilroy,
            cursor: Mutex::new(CursorPos::BeforeStart),
            delete_stripe: std::sync::atomic::AtomicU32::new(0),
        };

        let header = table.shared.header();
        header.tuple_size.store(config.tuple_size, Ordering::SeqCst);
        header.initial_alloc.store(config.initial_alloc, Ordering::SeqCst);
        header.growth_alloc.store(config.growth_alloc, Ordering::SeqCst);
        header
            .add_list_count
            .store(config.add_lists, Ordering::SeqCst);
        header
            .delete_list_count
            .store(config.delete_lists, Ordering::SeqCst);
        header
            .queue_changes
            .store(config.queue_changes as u32, Ordering::SeqCst);
        header.users.store(1, Ordering::SeqCst);
        for list in header.add_lists.iter().chain(header.delete_lists.iter()) {
            list.head_block.store(NULL_LINK, Ordering::SeqCst);
            list.head_slot.store(NULL_LINK, Ordering::SeqCst);
        }

        table.shared.create_block(0, config.initial_alloc)?;
        for slot in 0..config.initial_alloc {
            let list = &header.add_lists[(slot % config.add_lists) as usize];
            table.push_free(list, TupleLoc { block: 0, slot })?;
        }
        header.block_count.store(1, Ordering::SeqCst);

        // Publish last so a concurrent open never sees a half-built table.
        header.magic.store(TABLE_MAGIC, Ordering::SeqCst);
        Ok(table)
    }

    /// Attach to an existing table.
    pub fn open(key: i32, kilroy: u32, runtime: Arc<SyncRuntime>) -> Result<Self> {
        if kilroy == 0 {
            return Err(DbError::BadParameters("kilroy must be non-zero".into()));
        }
        let shared = Arc::new(TableShared::attach_segments(runtime, key)?);
        shared.header().users.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            shared,
            kilroy,
            cursor: Mutex::new(CursorPos::BeforeStart),
            delete_stripe: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Detach this handle. The last process out removes the segments.
    pub fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }

    fn validate(config: &TableConfig) -> Result<()> {
        if config.key == 0
            || config.tuple_size == 0
            || config.initial_alloc == 0
            || config.growth_alloc == 0
            || config.kilroy == 0
        {
            return Err(DbError::BadParameters("zero table construction field".into()));
        }
        let lists_ok = |n: u32| n >= 1 && n as usize <= MAX_FREE_LISTS;
        if !lists_ok(config.add_lists) || !lists_ok(config.delete_lists) {
            return Err(DbError::BadParameters("free-list fan-out out of range".into()));
        }
        Ok(())
    }

    pub fn key(&self) -> i32 {
        self.shared.key
    }

    pub fn kilroy(&self) -> u32 {
        self.kilroy
    }

    pub fn tuple_size(&self) -> usize {
        self.shared.tuple_size()
    }

    pub fn runtime(&self) -> &Arc<SyncRuntime> {
        &self.shared.runtime
    }

    pub(crate) fn shared(&self) -> &Arc<TableShared> {
        &self.shared
    }

    /// Attach an index hook; every subsequent add and delete through this
    /// process's handles fans out to it.
    pub(crate) fn register_index(&self, hook: Weak<dyn TupleIndex>) {
        self.shared.indexes.write().push(hook);
    }

    fn hooks(&self) -> Vec<Arc<dyn TupleIndex>> {
        let mut registry = self.shared.indexes.write();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.iter().filter_map(Weak::upgrade).collect()
    }

    // ------------------------------------------------------------------
    // Free pools
    // ------------------------------------------------------------------

    pub(super) fn push_free(&self, list: &FreeList, loc: TupleLoc) -> Result<()> {
        let rt = &self.shared.runtime;
        list.lock.acquire(rt, self.kilroy)?;
        let result = (|| {
            let slot = self.shared.slot(loc)?;
            slot.next_block
                .store(list.head_block.load(Ordering::SeqCst), Ordering::SeqCst);
            slot.next_slot
                .store(list.head_slot.load(Ordering::SeqCst), Ordering::SeqCst);
            list.head_block.store(loc.block, Ordering::SeqCst);
            list.head_slot.store(loc.slot, Ordering::SeqCst);
            list.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })();
        list.lock.release(self.kilroy)?;
        result
    }

    fn pop_free(&self, list: &FreeList) -> Result<Option<TupleLoc>> {
        let rt = &self.shared.runtime;
        list.lock.acquire(rt, self.kilroy)?;
        let result = (|| {
            let head = TupleLoc {
                block: list.head_block.load(Ordering::SeqCst),
                slot: list.head_slot.load(Ordering::SeqCst),
            };
            if head.block == NULL_LINK {
                return Ok(None);
            }
            let slot = self.shared.slot(head)?;
            list.head_block
                .store(slot.next_block.load(Ordering::SeqCst), Ordering::SeqCst);
            list.head_slot
                .store(slot.next_slot.load(Ordering::SeqCst), Ordering::SeqCst);
            list.count.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(head))
        })();
        list.lock.release(self.kilroy)?;
        result
    }

    fn pop_any_add_list(&self) -> Result<Option<TupleLoc>> {
        let header = self.shared.header();
        let count = header.add_list_count.load(Ordering::SeqCst);
        let stripe = self.kilroy % count;
        for step in 0..count {
            let list = &header.add_lists[((stripe + step) % count) as usize];
            if let Some(loc) = self.pop_free(list)? {
                return Ok(Some(loc));
            }
        }
        Ok(None)
    }

    /// Grow by one block of `growth_alloc` slots under the table lock.
    fn grow(&self) -> Result<()> {
        let header = self.shared.header();
        header.table_lock.acquire(&self.shared.runtime, self.kilroy)?;
        let result = (|| {
            // Another process may have grown while we waited for the lock.
            self.shared.sync_blocks()?;
            let occupied: u32 = header
                .add_lists
                .iter()
                .map(|l| l.count.load(Ordering::SeqCst))
                .sum();
            if occupied > 0 {
                return Ok(());
            }
            let index = header.block_count.load(Ordering::SeqCst);
            let slots = header.growth_alloc.load(Ordering::SeqCst);
            let add_lists = header.add_list_count.load(Ordering::SeqCst);
            self.shared.create_block(index, slots)?;
            for slot in 0..slots {
                let list = &header.add_lists[(slot % add_lists) as usize];
                self.push_free(list, TupleLoc { block: index, slot })?;
            }
            header.block_count.store(index + 1, Ordering::SeqCst);
            Ok(())
        })();
        header.table_lock.release(self.kilroy)?;
        result
    }

    /// Spec rule for queued deletes: after appending to list `i`, once the
    /// next list in the ring is at least half a growth block deep, list `i`
    /// has aged a full ring lap and its slots go back to the add pool.
    fn maybe_recycle_deletes(&self, appended_to: u32) -> Result<()> {
        let header = self.shared.header();
        let lists = header.delete_list_count.load(Ordering::SeqCst);
        let threshold = (header.growth_alloc.load(Ordering::SeqCst) / 2).max(1);
        let next = (appended_to + 1) % lists;
        if header.delete_lists[next as usize].count.load(Ordering::SeqCst) < threshold {
            return Ok(());
        }
        header.table_lock.acquire(&self.shared.runtime, self.kilroy)?;
        let result = (|| {
            if header.delete_lists[next as usize].count.load(Ordering::SeqCst) < threshold {
                return Ok(()); // lost the race to another recycler
            }
            let add_lists = header.add_list_count.load(Ordering::SeqCst);
            let source = &header.delete_lists[appended_to as usize];
            let mut spread = self.kilroy;
            while let Some(loc) = self.pop_free(source)? {
                // No longer pending: the slot is ordinary free stock now.
                self.shared.slot(loc)?.flags.store(0, Ordering::SeqCst);
                let list = &header.add_lists[(spread % add_lists) as usize];
                self.push_free(list, loc)?;
                spread = spread.wrapping_add(1);
            }
            Ok(())
        })();
        header.table_lock.release(self.kilroy)?;
        result
    }

    // ------------------------------------------------------------------
    // Tuple operations
    // ------------------------------------------------------------------

    /// Insert a tuple and index it everywhere. On success the new tuple is
    /// returned with its slot lock held; drop the guard (or call
    /// `unlock`) once any dependent bookkeeping is done. A primary-key
    /// collision rolls the slot and every partial index insertion back.
    pub fn add_tuple(&self, src: &[u8]) -> Result<TupleGuard<'_>> {
        if src.len() != self.shared.tuple_size() {
            return Err(DbError::BadParameters("tuple payload size mismatch".into()));
        }
        self.shared.sync_blocks()?;

        let loc = loop {
            if let Some(loc) = self.pop_any_add_list()? {
                break loc;
            }
            self.grow()?;
        };

        let slot = self.shared.slot(loc)?;
        slot.lock.acquire(&self.shared.runtime, self.kilroy)?;
        self.shared.write_payload(loc, src)?;
        slot.flags.store(SLOT_LIVE, Ordering::SeqCst);

        let hooks = self.hooks();
        for (done, hook) in hooks.iter().enumerate() {
            if let Err(err) = hook.insert_entry(self.kilroy, loc, src) {
                for earlier in &hooks[..done] {
                    let _ = earlier.remove_entry(self.kilroy, loc, src);
                }
                slot.flags.store(0, Ordering::SeqCst);
                slot.lock.release(self.kilroy)?;
                let header = self.shared.header();
                let stripe = self.kilroy % header.add_list_count.load(Ordering::SeqCst);
                self.push_free(&header.add_lists[stripe as usize], loc)?;
                return Err(err);
            }
        }

        *self.cursor.lock() = CursorPos::At(loc);
        Ok(self.guard(loc))
    }

    /// Delete the current cursor tuple: de-index it, take it out of the
    /// iteration order and park it for reuse. The caller normally holds the
    /// slot lock already; if not, it is taken here.
    pub fn delete_tuple(&self) -> Result<()> {
        let loc = match *self.cursor.lock() {
            CursorPos::At(loc) => loc,
            _ => return Err(DbError::BadParameters("cursor is not on a tuple".into())),
        };
        let slot = self.shared.slot(loc)?;
        let we_locked = if slot.lock.holder() == self.kilroy {
            false
        } else {
            slot.lock.acquire(&self.shared.runtime, self.kilroy)?;
            true
        };

        let result = self.delete_locked(loc);
        if result.is_err() && we_locked {
            let _ = slot.lock.release(self.kilroy);
        }
        result
    }

    fn delete_locked(&self, loc: TupleLoc) -> Result<()> {
        let slot = self.shared.slot(loc)?;
        if slot.flags.load(Ordering::SeqCst) & SLOT_LIVE == 0 {
            return Err(DbError::NotFound("cursor tuple is no longer live".into()));
        }

        let mut payload = vec![0u8; self.shared.tuple_size()];
        self.shared.read_payload(loc, &mut payload)?;

        let hooks = self.hooks();
        for (done, hook) in hooks.iter().enumerate() {
            if let Err(err) = hook.remove_entry(self.kilroy, loc, &payload) {
                for earlier in &hooks[..done] {
                    let _ = earlier.insert_entry(self.kilroy, loc, &payload);
                }
                return Err(err);
            }
        }

        let header = self.shared.header();
        let queued = header.queue_changes.load(Ordering::SeqCst) != 0;
        slot.flags.store(
            if queued { SLOT_DELETE_PENDING } else { 0 },
            Ordering::SeqCst,
        );
        slot.lock.release(self.kilroy)?;

        if queued {
            let lists = header.delete_list_count.load(Ordering::SeqCst);
            let stripe = self
                .delete_stripe
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(self.kilroy)
                % lists;
            self.push_free(&header.delete_lists[stripe as usize], loc)?;
            self.maybe_recycle_deletes(stripe)?;
        } else {
            let stripe = self.kilroy % header.add_list_count.load(Ordering::SeqCst);
            self.push_free(&header.add_lists[stripe as usize], loc)?;
        }
        Ok(())
    }

    /// Lock the current cursor tuple and return it.
    pub fn lock_tuple(&self) -> Result<TupleGuard<'_>> {
        let loc = self.cursor_loc()?;
        let slot = self.shared.slot(loc)?;
        slot.lock.acquire(&self.shared.runtime, self.kilroy)?;
        if slot.flags.load(Ordering::SeqCst) & SLOT_LIVE == 0 {
            slot.lock.release(self.kilroy)?;
            return Err(DbError::NotFound("cursor tuple is no longer live".into()));
        }
        Ok(self.guard(loc))
    }

    /// Like `lock_tuple` but bounces with `ObjectInUse` instead of waiting.
    pub fn try_lock_tuple(&self) -> Result<TupleGuard<'_>> {
        let loc = self.cursor_loc()?;
        let slot = self.shared.slot(loc)?;
        slot.lock.try_acquire(self.kilroy)?;
        if slot.flags.load(Ordering::SeqCst) & SLOT_LIVE == 0 {
            slot.lock.release(self.kilroy)?;
            return Err(DbError::NotFound("cursor tuple is no longer live".into()));
        }
        Ok(self.guard(loc))
    }

    /// The cursor tuple, locked. Alias kept for callers phrasing the
    /// operation as a read rather than a lock.
    pub fn locked_get_tuple(&self) -> Result<TupleGuard<'_>> {
        self.lock_tuple()
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Park the cursor before the first slot.
    pub fn reset_cursor(&self) {
        *self.cursor.lock() = CursorPos::BeforeStart;
    }

    /// Advance to the next live tuple, skipping freed slots. Liveness is
    /// re-verified under the slot lock so a slot that flipped from live to
    /// free mid-scan is never returned.
    pub fn next_tuple(&self) -> Option<TupleRef<'_>> {
        let mut cursor = self.cursor.lock();
        let start = match *cursor {
            CursorPos::BeforeStart => None,
            CursorPos::At(loc) => Some(loc),
            CursorPos::AfterEnd => return None,
        };
        match self.scan_forward(start) {
            Some(found) => {
                *cursor = CursorPos::At(found);
                Some(TupleRef { table: self, loc: found })
            }
            None => {
                *cursor = CursorPos::AfterEnd;
                None
            }
        }
    }

    /// Step back to the previous live tuple.
    pub fn prev_tuple(&self) -> Option<TupleRef<'_>> {
        let mut cursor = self.cursor.lock();
        let start = match *cursor {
            CursorPos::BeforeStart => return None,
            CursorPos::At(loc) => Some(loc),
            CursorPos::AfterEnd => None,
        };
        match self.scan_backward(start) {
            Some(found) => {
                *cursor = CursorPos::At(found);
                Some(TupleRef { table: self, loc: found })
            }
            None => {
                *cursor = CursorPos::BeforeStart;
                None
            }
        }
    }

    /// Opaque coordinates of the cursor tuple, for handing to save files
    /// and index entries.
    pub fn tuple_location(&self) -> Result<TupleLoc> {
        self.cursor_loc()
    }

    /// Reposition the cursor by opaque coordinates.
    pub fn set_tuple(&self, loc: TupleLoc) -> Result<TupleRef<'_>> {
        self.shared.sync_blocks()?;
        if !self.shared.slot_live(loc)? {
            return Err(DbError::NotFound("no live tuple at those coordinates".into()));
        }
        *self.cursor.lock() = CursorPos::At(loc);
        Ok(TupleRef { table: self, loc })
    }

    pub(crate) fn position_cursor(&self, loc: TupleLoc) {
        *self.cursor.lock() = CursorPos::At(loc);
    }

    fn cursor_loc(&self) -> Result<TupleLoc> {
        match *self.cursor.lock() {
            CursorPos::At(loc) => Ok(loc),
            _ => Err(DbError::BadParameters("cursor is not on a tuple".into())),
        }
    }

    fn guard(&self, loc: TupleLoc) -> TupleGuard<'_> {
        TupleGuard {
            table: self,
            loc,
            armed: true,
        }
    }

    pub(super) fn scan_forward(&self, after: Option<TupleLoc>) -> Option<TupleLoc> {
        self.shared.sync_blocks().ok()?;
        let blocks = self.shared.block_count();
        let (mut block, mut slot) = match after {
            None => (0, 0),
            Some(loc) => (loc.block, loc.slot + 1),
        };
        while block < blocks {
            let limit = self.shared.block_slots(block);
            while slot < limit {
                let loc = TupleLoc { block, slot };
                if self.live_under_lock(loc) {
                    return Some(loc);
                }
                slot += 1;
            }
            block += 1;
            slot = 0;
        }
        None
    }

    fn scan_backward(&self, before: Option<TupleLoc>) -> Option<TupleLoc> {
        self.shared.sync_blocks().ok()?;
        let blocks = self.shared.block_count();
        if blocks == 0 {
            return None;
        }
        let (mut block, mut slot) = match before {
            None => {
                let block = blocks - 1;
                (block, self.shared.block_slots(block) as i64 - 1)
            }
            Some(loc) => (loc.block, loc.slot as i64 - 1),
        };
        loop {
            while slot >= 0 {
                let loc = TupleLoc {
                    block,
                    slot: slot as u32,
                };
                if self.live_under_lock(loc) {
                    return Some(loc);
                }
                slot -= 1;
            }
            if block == 0 {
                return None;
            }
            block -= 1;
            slot = self.shared.block_slots(block) as i64 - 1;
        }
    }

    /// Liveness check with the flip-protection recheck. A slot we already
    /// hold the lock on counts as settled.
    fn live_under_lock(&self, loc: TupleLoc) -> bool {
        let slot = match self.shared.slot(loc) {
            Ok(slot) => slot,
            Err(_) => return false,
        };
        if slot.flags.load(Ordering::SeqCst) & SLOT_LIVE == 0 {
            return false;
        }
        if slot.lock.holder() == self.kilroy {
            return true;
        }
        if slot.lock.acquire(&self.shared.runtime, self.kilroy).is_err() {
            return false;
        }
        let live = slot.flags.load(Ordering::SeqCst) & SLOT_LIVE != 0;
        let _ = slot.lock.release(self.kilroy);
        live
    }
}

impl Drop for SharedTable {
    fn drop(&mut self) {
        self.shared.header().users.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An unlocked view of a tuple. Copy the payload out before relying on it;
/// a concurrent mutator may rewrite the slot at any time.
pub struct TupleRef<'t> {
    table: &'t SharedTable,
    loc: TupleLoc,
}

impl TupleRef<'_> {
    pub fn location(&self) -> TupleLoc {
        self.loc
    }

    /// Copy the payload (or as much as fits) into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.table.shared.read_payload(self.loc, buf)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.table.shared.tuple_size()];
        self.read(&mut buf)?;
        Ok(buf)
    }
}

/// A tuple held under its slot lock. Dereferences to the payload bytes;
/// dropping the guard releases the lock.
pub struct TupleGuard<'t> {
    table: &'t SharedTable,
    loc: TupleLoc,
    armed: bool,
}

impl std::fmt::Debug for TupleGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleGuard")
            .field("loc", &self.loc)
            .field("armed", &self.armed)
            .finish()
    }
}

impl TupleGuard<'_> {
    pub fn location(&self) -> TupleLoc {
        self.loc
    }

    /// Release the lock now, reporting any ownership error.
    pub fn unlock(mut self) -> Result<()> {
        self.armed = false;
        let slot = self.table.shared.slot(self.loc)?;
        slot.lock.release(self.table.kilroy)
    }

    /// Delete the guarded tuple. Consumes the guard; the slot lock is
    /// surrendered as part of freeing the slot.
    pub fn delete(mut self) -> Result<()> {
        self.armed = false;
        self.table.position_cursor(self.loc);
        self.table.delete_locked(self.loc)
    }
}

impl Deref for TupleGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: the slot was validated when the guard was built, the
        // mapping outlives the table borrow, and we hold the slot lock.
        unsafe {
            let ptr = self
                .table
                .shared
                .payload_ptr(self.loc)
                .expect("tuple guard location is always valid; slot/lock invariants guarantee payload_ptr succeeds");
            std::slice::from_raw_parts(ptr, self.table.shared.tuple_size())
        }
    }
}

impl DerefMut for TupleGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: as in Deref, and the slot lock makes us the only writer.
        unsafe {
            let ptr = self
                .table
                .shared
                .payload_ptr(self.loc)
                .expect("tuple guard location is always valid; slot/lock invariants guarantee payload_ptr succeeds");
            std::slice::from_raw_parts_mut(ptr, self.table.shared.tuple_size())
        }
    }
}

impl Drop for TupleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(slot) = self.table.shared.slot(self.loc) {
                let _ = slot.lock.release(self.table.kilroy);
            }
        }
    }
}
