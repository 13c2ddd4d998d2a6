// The B-tree proper.
//
// Concurrency protocol: every descent holds a share on the tree structure
// lock, so page boundaries cannot move underneath it. In-page writes take
// the page's share lock via the three-phase queued exclusive, letting
// readers already on the page drain. Shape changes (splits, merges, root
// moves) serialize on the structural spin lock and then drain all descents
// by taking the structure lock exclusively; leaf rewrites still honor
// parked cursor shares through page exclusives taken in ascending
// page-index order.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DbError, Result};
use crate::table::{SharedTable, TupleIndex, TupleLoc, TupleRef};

use super::layout::{BTreeShared, Page, BTREE_MAGIC, NULL_PAGE};
use super::{BTreeConfig, IndexKind, KeyOps, MatchMode, ReadMode};

/// Statistics and proof-of-health from a full structural validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeCheck {
    pub depth: u32,
    pub pages: u32,
    pub leaves: u32,
    pub keys: u64,
}

pub(crate) struct CursorState {
    pub page: u32,
    pub pos: usize,
    pub last_key: Vec<u8>,
    pub last_ref: TupleLoc,
}

/// A per-process handle onto a shared B-tree over `table`. Carries its own
/// cursor; open one handle per thread.
pub struct BTree<'t> {
    pub(crate) shared: Arc<BTreeShared>,
    pub(crate) table: &'t SharedTable,
    pub(crate) kilroy: u32,
    pub(crate) cursor: Mutex<Option<CursorState>>,
}

impl<'t> BTree<'t> {
    /// Create the tree, allocate its first page block, and register it with
    /// the table so adds and deletes flow through it.
    pub fn create(
        config: BTreeConfig,
        table: &'t SharedTable,
        ops: Arc<dyn KeyOps>,
    ) -> Result<Self> {
        Self::validate(&config)?;
        let shared = Arc::new(BTreeShared::create_segments(
            table.runtime().clone(),
            config.key,
            table.shared().clone(),
            ops,
        )?);

        let header = shared.header();
        header.table_key.store(table.key() as u32, Ordering::SeqCst);
        header.key_len.store(config.key_len, Ordering::SeqCst);
        header
            .keys_per_page
            .store(config.keys_per_page, Ordering::SeqCst);
        header
            .pages_per_block
            .store(config.pages_per_block, Ordering::SeqCst);
        header.kind.store(config.kind as u32, Ordering::SeqCst);
        header.users.store(1, Ordering::SeqCst);
        header.free_head.store(NULL_PAGE, Ordering::SeqCst);

        let root = shared.alloc_page(config.kilroy, true)?;
        header.root.store(root, Ordering::SeqCst);
        header.leftmost.store(root, Ordering::SeqCst);
        header.rightmost.store(root, Ordering::SeqCst);
        header.magic.store(BTREE_MAGIC, Ordering::SeqCst);

        let tree = Self {
            shared,
            table,
            kilroy: config.kilroy,
            cursor: Mutex::new(None),
        };
        tree.register();
        Ok(tree)
    }

    /// Attach to an existing tree and register it with the table.
    pub fn open(
        key: i32,
        table: &'t SharedTable,
        ops: Arc<dyn KeyOps>,
        kilroy: u32,
    ) -> Result<Self> {
        if kilroy == 0 {
            return Err(DbError::BadParameters("kilroy must be non-zero".into()));
        }
        let shared = Arc::new(BTreeShared::attach_segments(
            table.runtime().clone(),
            key,
            table.shared().clone(),
            ops,
        )?);
        if shared.header().table_key.load(Ordering::SeqCst) != table.key() as u32 {
            return Err(DbError::BadParameters(
                "tree belongs to a different table".into(),
            ));
        }
        shared.header().users.fetch_add(1, Ordering::SeqCst);
        let tree = Self {
            shared,
            table,
            kilroy,
            cursor: Mutex::new(None),
        };
        tree.register();
        Ok(tree)
    }

    /// Create the tree, then restore it from a save file.
    pub fn create_from_file(
        path: &std::path::Path,
        config: BTreeConfig,
        table: &'t SharedTable,
        ops: Arc<dyn KeyOps>,
    ) -> Result<Self> {
        let tree = Self::create(config, table, ops)?;
        tree.load_btree(path)?;
        Ok(tree)
    }

    /// Detach this handle; any cursor lock is released first.
    pub fn close(self) -> Result<()> {
        self.release_cursor();
        drop(self);
        Ok(())
    }

    fn validate(config: &BTreeConfig) -> Result<()> {
        if config.key == 0
            || config.key_len == 0
            || config.pages_per_block == 0
            || config.kilroy == 0
        {
            return Err(DbError::BadParameters("zero tree construction field".into()));
        }
        if config.keys_per_page < 4 {
            return Err(DbError::BadParameters(
                "keys per page must be at least 4".into(),
            ));
        }
        Ok(())
    }

    fn register(&self) {
        let hook: Arc<dyn TupleIndex> = self.shared.clone();
        self.table.register_index(Arc::downgrade(&hook));
    }

    pub fn key(&self) -> i32 {
        self.shared.key
    }

    pub fn key_len(&self) -> usize {
        self.shared.key_len()
    }

    pub fn kind(&self) -> IndexKind {
        self.shared.kind()
    }

    /// Locate a tuple by key. A successful find positions the table cursor
    /// on the tuple, so a follow-up `delete_tuple` or `lock_tuple` acts on
    /// it. The returned view is unlocked; copy out before trusting it
    /// across other operations.
    pub fn find_tuple(
        &self,
        key: &[u8],
        read_mode: ReadMode,
        match_mode: MatchMode,
        len: usize,
    ) -> Result<Option<TupleRef<'t>>> {
        let eff = self.shared.effective_len(match_mode, len, key)?;
        match self.shared.find(key, read_mode, match_mode, eff, false)? {
            Some(hit) => self.resolve(hit.loc),
            None => Ok(None),
        }
    }

    pub(super) fn resolve(&self, loc: TupleLoc) -> Result<Option<TupleRef<'t>>> {
        match self.table.set_tuple(loc) {
            Ok(tuple) => Ok(Some(tuple)),
            // The tuple was deleted between index lookup and resolution.
            Err(DbError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Full structural validation: in-page ordering, separator keys against
    /// children, the leaf chain both ways, and table liveness of every leaf
    /// entry. Meant for tests and rare user request, not the hot path.
    pub fn check_btree(&self) -> Result<BTreeCheck> {
        self.shared.check(self.kilroy)
    }
}

impl Drop for BTree<'_> {
    fn drop(&mut self) {
        self.release_cursor();
        self.shared.header().users.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A located entry: its leaf, position, and the table slot it names.
pub(crate) struct EntryHit {
    pub page: u32,
    pub pos: usize,
    pub loc: TupleLoc,
}

impl BTreeShared {
    pub(crate) fn kind(&self) -> IndexKind {
        if self.header().kind.load(Ordering::SeqCst) == IndexKind::Primary as u32 {
            IndexKind::Primary
        } else {
            IndexKind::Secondary
        }
    }

    fn min_keys(&self) -> usize {
        self.keys_per_page() / 2
    }

    pub(crate) fn effective_len(
        &self,
        mode: MatchMode,
        len: usize,
        key: &[u8],
    ) -> Result<usize> {
        let key_len = self.key_len();
        let eff = match mode {
            MatchMode::Direct => key_len,
            MatchMode::FindFirst | MatchMode::FindLast => len,
        };
        if eff == 0 || eff > key_len || key.len() < eff {
            return Err(DbError::BadParameters("bad key length for match".into()));
        }
        Ok(eff)
    }

    // ------------------------------------------------------------------
    // Descent and search
    // ------------------------------------------------------------------

    /// Entry index an internal page routes `key` through. `upper` picks the
    /// rightmost child whose low key compares <=; otherwise the rightmost
    /// strictly below, which is where the leftmost equal key can hide.
    /// Entry 0 is the catch-all for keys below every low key.
    fn route(&self, page: &Page, key: &[u8], len: usize, upper: bool) -> usize {
        let mut chosen = 0;
        for i in 0..page.key_count() {
            let cmp = self.ops.compare(page.key(i), key, len);
            let take = if upper {
                cmp != CmpOrdering::Greater
            } else {
                cmp == CmpOrdering::Less
            };
            if take {
                chosen = i;
            } else {
                break;
            }
        }
        chosen
    }

    /// First position whose key compares >= over `len` bytes.
    fn lower_bound(&self, page: &Page, key: &[u8], len: usize) -> usize {
        for i in 0..page.key_count() {
            if self.ops.compare(page.key(i), key, len) != CmpOrdering::Less {
                return i;
            }
        }
        page.key_count()
    }

    /// First position whose key compares > over `len` bytes.
    fn upper_bound(&self, page: &Page, key: &[u8], len: usize) -> usize {
        for i in 0..page.key_count() {
            if self.ops.compare(page.key(i), key, len) == CmpOrdering::Greater {
                return i;
            }
        }
        page.key_count()
    }

    /// Lock-free leaf routing; valid under the tree share (structure is
    /// frozen) or the tree exclusive.
    fn leaf_for(&self, key: &[u8], len: usize, upper: bool) -> Result<u32> {
        let mut idx = self.header().root.load(Ordering::SeqCst);
        loop {
            let page = self.page(idx)?;
            if page.is_leaf() {
                return Ok(idx);
            }
            idx = page.child(self.route(&page, key, len, upper));
        }
    }

    /// Locked descent. Returns the leaf with its share held. Optimistic
    /// holds only one page at a time and verifies after each hop that the
    /// key is not below the page's first key (legal only on a catch-all
    /// hop); a stale read restarts from the root, and repeated failures
    /// fall back to crabbing. Crab holds parent and child together.
    fn descend_shared(
        &self,
        key: &[u8],
        len: usize,
        upper: bool,
        read_mode: ReadMode,
    ) -> Result<u32> {
        let rt = &self.runtime;
        match read_mode {
            ReadMode::CrabLock => {
                let mut idx = self.header().root.load(Ordering::SeqCst);
                let mut page = self.page(idx)?;
                page.header().lock.share(rt);
                loop {
                    if page.is_leaf() {
                        return Ok(idx);
                    }
                    let child_idx = page.child(self.route(&page, key, len, upper));
                    let child = self.page(child_idx)?;
                    child.header().lock.share(rt);
                    page.header().lock.release_share();
                    page = child;
                    idx = child_idx;
                }
            }
            ReadMode::Optimistic => {
                let mut restarts = 0;
                'restart: loop {
                    let mut idx = self.header().root.load(Ordering::SeqCst);
                    let mut via_catch_all = true;
                    loop {
                        let page = self.page(idx)?;
                        page.header().lock.share(rt);
                        let in_range = via_catch_all
                            || (page.key_count() > 0
                                && self.ops.compare(page.key(0), key, len)
                                    != CmpOrdering::Greater);
                        if !in_range {
                            page.header().lock.release_share();
                            restarts += 1;
                            if restarts > 3 {
                                return self.descend_shared(key, len, upper, ReadMode::CrabLock);
                            }
                            continue 'restart;
                        }
                        if page.is_leaf() {
                            return Ok(idx);
                        }
                        let slot = self.route(&page, key, len, upper);
                        let child = page.child(slot);
                        via_catch_all = slot == 0;
                        page.header().lock.release_share();
                        idx = child;
                    }
                }
            }
        }
    }

    /// Find an entry per the match mode. On a hit with `keep_share` the
    /// leaf share is left held for the caller's cursor; otherwise every
    /// lock is released before returning.
    pub(crate) fn find(
        &self,
        key: &[u8],
        read_mode: ReadMode,
        mode: MatchMode,
        len: usize,
        keep_share: bool,
    ) -> Result<Option<EntryHit>> {
        let header = self.header();
        let rt = &self.runtime;
        header.tree_lock.share(rt);
        let result = self.find_locked(key, read_mode, mode, len, keep_share);
        header.tree_lock.release_share();
        result
    }

    fn find_locked(
        &self,
        key: &[u8],
        read_mode: ReadMode,
        mode: MatchMode,
        len: usize,
        keep_share: bool,
    ) -> Result<Option<EntryHit>> {
        let rt = &self.runtime;
        let upper = matches!(mode, MatchMode::FindLast);
        let mut idx = self.descend_shared(key, len, upper, read_mode)?;
        let mut page = self.page(idx)?;

        let hit = match mode {
            // Direct is the leftmost-equal scan over the full key length; a
            // low key gone stale under deletions means the equal entry can
            // sit one leaf right of the routed one, so both modes walk.
            MatchMode::Direct | MatchMode::FindFirst => {
                // The first entry >= the prefix may sit a leaf or two to the
                // right when the routed leaf ends below it.
                loop {
                    let pos = self.lower_bound(&page, key, len);
                    if pos < page.key_count() {
                        break if self.ops.compare(page.key(pos), key, len) == CmpOrdering::Equal {
                            Some(pos)
                        } else {
                            None
                        };
                    }
                    let next = page.header().next_leaf.load(Ordering::SeqCst);
                    if next == NULL_PAGE {
                        break None;
                    }
                    let next_page = self.page(next)?;
                    next_page.header().lock.share(rt);
                    page.header().lock.release_share();
                    page = next_page;
                    idx = next;
                }
            }
            MatchMode::FindLast => {
                // The run's tail can sit left of the routed leaf (a low key
                // gone stale under deletions) or spill right across leaves;
                // walk whichever way the page contents say.
                loop {
                    let pos = self.upper_bound(&page, key, len);
                    if pos == 0 {
                        let prev = page.header().prev_leaf.load(Ordering::SeqCst);
                        if prev == NULL_PAGE {
                            break None;
                        }
                        let prev_page = self.page(prev)?;
                        prev_page.header().lock.share(rt);
                        page.header().lock.release_share();
                        page = prev_page;
                        idx = prev;
                        continue;
                    }
                    let next = page.header().next_leaf.load(Ordering::SeqCst);
                    if pos < page.key_count() || next == NULL_PAGE {
                        break if self.ops.compare(page.key(pos - 1), key, len)
                            == CmpOrdering::Equal
                        {
                            Some(pos - 1)
                        } else {
                            None
                        };
                    }
                    let next_page = self.page(next)?;
                    next_page.header().lock.share(rt);
                    if next_page.key_count() > 0
                        && self.ops.compare(next_page.key(0), key, len) == CmpOrdering::Equal
                    {
                        page.header().lock.release_share();
                        page = next_page;
                        idx = next;
                    } else {
                        next_page.header().lock.release_share();
                        break if self.ops.compare(page.key(pos - 1), key, len)
                            == CmpOrdering::Equal
                        {
                            Some(pos - 1)
                        } else {
                            None
                        };
                    }
                }
            }
        };

        match hit {
            Some(pos) => {
                let loc = page.tuple_ref(pos);
                if !keep_share {
                    page.header().lock.release_share();
                }
                Ok(Some(EntryHit { page: idx, pos, loc }))
            }
            None => {
                page.header().lock.release_share();
                Ok(None)
            }
        }
    }

    /// First (or last) entry of the whole index, leaf share held on a hit.
    pub(crate) fn edge_entry(&self, first: bool) -> Result<Option<EntryHit>> {
        let header = self.header();
        let rt = &self.runtime;
        header.tree_lock.share(rt);
        let result = (|| {
            let mut idx = if first {
                header.leftmost.load(Ordering::SeqCst)
            } else {
                header.rightmost.load(Ordering::SeqCst)
            };
            loop {
                let page = self.page(idx)?;
                page.header().lock.share(rt);
                if page.key_count() > 0 {
                    let pos = if first { 0 } else { page.key_count() - 1 };
                    return Ok(Some(EntryHit {
                        page: idx,
                        pos,
                        loc: page.tuple_ref(pos),
                    }));
                }
                let step = if first {
                    page.header().next_leaf.load(Ordering::SeqCst)
                } else {
                    page.header().prev_leaf.load(Ordering::SeqCst)
                };
                page.header().lock.release_share();
                if step == NULL_PAGE {
                    return Ok(None);
                }
                idx = step;
            }
        })();
        header.tree_lock.release_share();
        result
    }

    /// The entry following the remembered (key, ref) position, for cursor
    /// repositioning after the cursor stood aside for a writer. Walks the
    /// equal run; if the remembered entry is gone, the first entry past the
    /// run stands in. Leaf share held on a hit.
    pub(crate) fn successor_of(&self, key: &[u8], after: TupleLoc) -> Result<Option<EntryHit>> {
        let header = self.header();
        let rt = &self.runtime;
        header.tree_lock.share(rt);
        let result = (|| {
            let key_len = self.key_len();
            let mut idx = self.leaf_for(key, key_len, false)?;
            let mut page = self.page(idx)?;
            page.header().lock.share(rt);
            let mut pos = self.lower_bound(&page, key, key_len);
            let mut passed = false;
            loop {
                if pos >= page.key_count() {
                    let next = page.header().next_leaf.load(Ordering::SeqCst);
                    if next == NULL_PAGE {
                        page.header().lock.release_share();
                        return Ok(None);
                    }
                    let next_page = self.page(next)?;
                    next_page.header().lock.share(rt);
                    page.header().lock.release_share();
                    page = next_page;
                    idx = next;
                    pos = 0;
                    continue;
                }
                let past_run =
                    self.ops.compare(page.key(pos), key, key_len) == CmpOrdering::Greater;
                if passed || past_run {
                    return Ok(Some(EntryHit {
                        page: idx,
                        pos,
                        loc: page.tuple_ref(pos),
                    }));
                }
                if page.tuple_ref(pos) == after {
                    passed = true;
                }
                pos += 1;
            }
        })();
        header.tree_lock.release_share();
        result
    }

    /// Mirror of `successor_of`, walking the equal run tail-first.
    pub(crate) fn predecessor_of(&self, key: &[u8], before: TupleLoc) -> Result<Option<EntryHit>> {
        let header = self.header();
        let rt = &self.runtime;
        header.tree_lock.share(rt);
        let result = (|| {
            let key_len = self.key_len();
            let mut idx = self.leaf_for(key, key_len, true)?;
            let mut page = self.page(idx)?;
            page.header().lock.share(rt);
            let mut pos = self.upper_bound(&page, key, key_len) as i64 - 1;
            let mut passed = false;
            loop {
                if pos < 0 {
                    let prev = page.header().prev_leaf.load(Ordering::SeqCst);
                    if prev == NULL_PAGE {
                        page.header().lock.release_share();
                        return Ok(None);
                    }
                    let prev_page = self.page(prev)?;
                    prev_page.header().lock.share(rt);
                    page.header().lock.release_share();
                    page = prev_page;
                    idx = prev;
                    pos = page.key_count() as i64 - 1;
                    continue;
                }
                let slot = pos as usize;
                let below_run =
                    self.ops.compare(page.key(slot), key, key_len) == CmpOrdering::Less;
                if passed || below_run {
                    return Ok(Some(EntryHit {
                        page: idx,
                        pos: slot,
                        loc: page.tuple_ref(slot),
                    }));
                }
                if page.tuple_ref(slot) == before {
                    passed = true;
                }
                pos -= 1;
            }
        })();
        header.tree_lock.release_share();
        result
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    pub(crate) fn insert(&self, kilroy: u32, key: &[u8], loc: TupleLoc) -> Result<()> {
        let header = self.header();
        let rt = &self.runtime;

        header.tree_lock.share(rt);
        let fast = self.try_fast_insert(key, loc);
        header.tree_lock.release_share();
        match fast {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => return Err(err),
        }

        header.struct_lock.acquire(rt, kilroy)?;
        header.tree_lock.exclusive(rt);
        let result = self.insert_structural(kilroy, key, loc);
        let _ = header.tree_lock.release_exclusive();
        header.struct_lock.release(kilroy)?;
        result
    }

    /// In-page insert under the three-phase page lock. Returns Ok(false)
    /// when the shape has to change (full leaf) or when the uniqueness
    /// probe cannot be answered from one leaf.
    fn try_fast_insert(&self, key: &[u8], loc: TupleLoc) -> Result<bool> {
        let rt = &self.runtime;
        let key_len = self.key_len();
        let lower = self.leaf_for(key, key_len, false)?;
        let upper = self.leaf_for(key, key_len, true)?;
        if lower != upper {
            // An equal key could straddle the leaf boundary; only the
            // structural path can probe and insert atomically there.
            return Ok(false);
        }
        let page = self.page(upper)?;

        let mut attempts = 0;
        while page.header().lock.queue_exclusive(rt).is_err() {
            rt.backoff(attempts);
            attempts = attempts.saturating_add(1);
        }
        page.header().lock.wait_queue_exclusive(rt);

        let outcome = (|| {
            if self.kind() == IndexKind::Primary {
                let pos = self.lower_bound(&page, key, key_len);
                if pos < page.key_count()
                    && self.ops.compare(page.key(pos), key, key_len) == CmpOrdering::Equal
                {
                    return Err(DbError::ObjectInUse("duplicate primary key".into()));
                }
            }
            if page.key_count() < self.keys_per_page() {
                let pos = self.upper_bound(&page, key, key_len);
                page.insert_entry(pos, key, (loc.block, loc.slot));
                Ok(true)
            } else {
                Ok(false)
            }
        })();
        let _ = page.header().lock.release_exclusive();
        outcome
    }

    /// Insert with splits, under the structural and tree-exclusive locks.
    fn insert_structural(&self, kilroy: u32, key: &[u8], loc: TupleLoc) -> Result<()> {
        let key_len = self.key_len();
        if self.kind() == IndexKind::Primary && self.probe_exact(key)? {
            return Err(DbError::ObjectInUse("duplicate primary key".into()));
        }
        let leaf = self.leaf_for(key, key_len, true)?;
        let page = self.page(leaf)?;
        let pos = self.upper_bound(&page, key, key_len);
        self.insert_with_split(kilroy, leaf, pos, key, (loc.block, loc.slot))
    }

    /// Exact-match probe that tolerates equal runs crossing leaves.
    fn probe_exact(&self, key: &[u8]) -> Result<bool> {
        let key_len = self.key_len();
        let mut idx = self.leaf_for(key, key_len, false)?;
        loop {
            let page = self.page(idx)?;
            let pos = self.lower_bound(&page, key, key_len);
            if pos < page.key_count() {
                return Ok(self.ops.compare(page.key(pos), key, key_len) == CmpOrdering::Equal);
            }
            let next = page.header().next_leaf.load(Ordering::SeqCst);
            if next == NULL_PAGE {
                return Ok(false);
            }
            idx = next;
        }
    }

    fn insert_with_split(
        &self,
        kilroy: u32,
        page_idx: u32,
        pos: usize,
        key: &[u8],
        entry_ref: (u32, u32),
    ) -> Result<()> {
        let header = self.header();
        let page = self.page(page_idx)?;
        let keys_per_page = self.keys_per_page();

        if page.key_count() < keys_per_page {
            if page.is_leaf() {
                return self.with_page_exclusives(&mut vec![page_idx], || {
                    page.insert_entry(pos, key, entry_ref);
                    Ok(())
                });
            }
            page.insert_entry(pos, key, entry_ref);
            self.page(entry_ref.0)?
                .header()
                .parent
                .store(page_idx, Ordering::SeqCst);
            return Ok(());
        }

        // Split: upper half moves to a fresh right sibling.
        let is_leaf = page.is_leaf();
        let right_idx = self.alloc_page(kilroy, is_leaf)?;
        let right = self.page(right_idx)?;
        let split = keys_per_page / 2;

        if is_leaf {
            let old_next = page.header().next_leaf.load(Ordering::SeqCst);
            self.with_page_exclusives(&mut vec![page_idx, old_next], || {
                page.split_off(split, &right);
                right.header().next_leaf.store(old_next, Ordering::SeqCst);
                right.header().prev_leaf.store(page_idx, Ordering::SeqCst);
                page.header().next_leaf.store(right_idx, Ordering::SeqCst);
                if old_next == NULL_PAGE {
                    header.rightmost.store(right_idx, Ordering::SeqCst);
                } else {
                    self.page(old_next)?
                        .header()
                        .prev_leaf
                        .store(right_idx, Ordering::SeqCst);
                }
                Ok(())
            })?;
        } else {
            page.split_off(split, &right);
            for i in 0..right.key_count() {
                self.page(right.child(i))?
                    .header()
                    .parent
                    .store(right_idx, Ordering::SeqCst);
            }
        }
        right
            .header()
            .parent
            .store(page.header().parent.load(Ordering::SeqCst), Ordering::SeqCst);

        // Land the pending entry on the proper side.
        let (target_idx, target_pos) = if pos >= split {
            (right_idx, pos - split)
        } else {
            (page_idx, pos)
        };
        let target = self.page(target_idx)?;
        if is_leaf {
            self.with_page_exclusives(&mut vec![target_idx], || {
                target.insert_entry(target_pos, key, entry_ref);
                Ok(())
            })?;
        } else {
            target.insert_entry(target_pos, key, entry_ref);
            self.page(entry_ref.0)?
                .header()
                .parent
                .store(target_idx, Ordering::SeqCst);
        }

        // Propagate the new sibling's low key upward.
        let right_low = right.key(0).to_vec();
        let parent_idx = page.header().parent.load(Ordering::SeqCst);
        if parent_idx == NULL_PAGE {
            let new_root = self.alloc_page(kilroy, false)?;
            let root_page = self.page(new_root)?;
            root_page.insert_entry(0, page.key(0), (page_idx, 0));
            root_page.insert_entry(1, &right_low, (right_idx, 0));
            page.header().parent.store(new_root, Ordering::SeqCst);
            right.header().parent.store(new_root, Ordering::SeqCst);
            header.root.store(new_root, Ordering::SeqCst);
            return Ok(());
        }
        let parent = self.page(parent_idx)?;
        let ppos = self.position_of_child(&parent, page_idx)?;
        self.insert_with_split(kilroy, parent_idx, ppos + 1, &right_low, (right_idx, 0))
    }

    // ------------------------------------------------------------------
    // Remove
    // ------------------------------------------------------------------

    pub(crate) fn remove(&self, kilroy: u32, key: &[u8], loc: TupleLoc) -> Result<()> {
        let header = self.header();
        let rt = &self.runtime;

        header.tree_lock.share(rt);
        let fast = self.try_fast_remove(key, loc);
        header.tree_lock.release_share();
        match fast {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => return Err(err),
        }

        header.struct_lock.acquire(rt, kilroy)?;
        header.tree_lock.exclusive(rt);
        let result = self.remove_structural(kilroy, key, loc);
        let _ = header.tree_lock.release_exclusive();
        header.struct_lock.release(kilroy)?;
        result
    }

    /// In-page removal; Ok(false) when the leaf would underflow.
    fn try_fast_remove(&self, key: &[u8], loc: TupleLoc) -> Result<bool> {
        let rt = &self.runtime;
        let key_len = self.key_len();
        let mut idx = self.leaf_for(key, key_len, false)?;
        loop {
            let page = self.page(idx)?;
            let mut attempts = 0;
            while page.header().lock.queue_exclusive(rt).is_err() {
                rt.backoff(attempts);
                attempts = attempts.saturating_add(1);
            }
            page.header().lock.wait_queue_exclusive(rt);

            let mut run_over = false;
            let mut found = None;
            let start = self.lower_bound(&page, key, key_len);
            for pos in start..page.key_count() {
                if self.ops.compare(page.key(pos), key, key_len) != CmpOrdering::Equal {
                    run_over = true;
                    break;
                }
                if page.tuple_ref(pos) == loc {
                    found = Some(pos);
                    break;
                }
            }
            if let Some(pos) = found {
                let root = self.header().root.load(Ordering::SeqCst);
                let fits = idx == root || page.key_count() - 1 >= self.min_keys();
                if fits {
                    page.remove_entry(pos);
                }
                let _ = page.header().lock.release_exclusive();
                return Ok(fits);
            }

            let next = page.header().next_leaf.load(Ordering::SeqCst);
            let _ = page.header().lock.release_exclusive();
            if run_over || next == NULL_PAGE {
                return Err(DbError::NotFound("key not present in index".into()));
            }
            idx = next;
        }
    }

    fn remove_structural(&self, kilroy: u32, key: &[u8], loc: TupleLoc) -> Result<()> {
        let key_len = self.key_len();
        let mut idx = self.leaf_for(key, key_len, false)?;
        let (leaf, pos) = loop {
            let page = self.page(idx)?;
            let start = self.lower_bound(&page, key, key_len);
            let mut run_over = false;
            let mut found = None;
            for pos in start..page.key_count() {
                if self.ops.compare(page.key(pos), key, key_len) != CmpOrdering::Equal {
                    run_over = true;
                    break;
                }
                if page.tuple_ref(pos) == loc {
                    found = Some(pos);
                    break;
                }
            }
            if let Some(pos) = found {
                break (idx, pos);
            }
            let next = page.header().next_leaf.load(Ordering::SeqCst);
            if run_over || next == NULL_PAGE {
                return Err(DbError::NotFound("key not present in index".into()));
            }
            idx = next;
        };

        let page = self.page(leaf)?;
        self.with_page_exclusives(&mut vec![leaf], || {
            page.remove_entry(pos);
            Ok(())
        })?;
        self.rebalance(kilroy, leaf)
    }

    /// Restore minimum occupancy after a removal, borrowing from a sibling
    /// or merging and recursing upward. Runs under the tree exclusive.
    fn rebalance(&self, kilroy: u32, idx: u32) -> Result<()> {
        let header = self.header();
        let page = self.page(idx)?;
        let root = header.root.load(Ordering::SeqCst);

        if idx == root {
            if !page.is_leaf() && page.key_count() == 1 {
                let only = page.child(0);
                self.page(only)?
                    .header()
                    .parent
                    .store(NULL_PAGE, Ordering::SeqCst);
                header.root.store(only, Ordering::SeqCst);
                self.free_page(kilroy, idx)?;
            }
            return Ok(());
        }
        if page.key_count() >= self.min_keys() {
            return Ok(());
        }

        let parent_idx = page.header().parent.load(Ordering::SeqCst);
        let parent = self.page(parent_idx)?;
        let ppos = self.position_of_child(&parent, idx)?;
        let is_leaf = page.is_leaf();

        // Borrow from the left sibling.
        if ppos > 0 {
            let left_idx = parent.child(ppos - 1);
            let left = self.page(left_idx)?;
            if left.key_count() > self.min_keys() {
                let last = left.key_count() - 1;
                let moved_key = left.key(last).to_vec();
                let moved_ref = left.ref_at(last);
                if is_leaf {
                    self.with_page_exclusives(&mut vec![left_idx, idx], || {
                        left.remove_entry(last);
                        page.insert_entry(0, &moved_key, moved_ref);
                        Ok(())
                    })?;
                } else {
                    left.remove_entry(last);
                    page.insert_entry(0, &moved_key, moved_ref);
                    self.page(moved_ref.0)?
                        .header()
                        .parent
                        .store(idx, Ordering::SeqCst);
                }
                parent.set_entry(ppos, &moved_key, (idx, 0));
                return Ok(());
            }
        }

        // Borrow from the right sibling.
        if ppos + 1 < parent.key_count() {
            let right_idx = parent.child(ppos + 1);
            let right = self.page(right_idx)?;
            if right.key_count() > self.min_keys() {
                let moved_key = right.key(0).to_vec();
                let moved_ref = right.ref_at(0);
                if is_leaf {
                    self.with_page_exclusives(&mut vec![idx, right_idx], || {
                        right.remove_entry(0);
                        page.insert_entry(page.key_count(), &moved_key, moved_ref);
                        Ok(())
                    })?;
                } else {
                    right.remove_entry(0);
                    page.insert_entry(page.key_count(), &moved_key, moved_ref);
                    self.page(moved_ref.0)?
                        .header()
                        .parent
                        .store(idx, Ordering::SeqCst);
                }
                parent.set_entry(ppos + 1, right.key(0), (right_idx, 0));
                return Ok(());
            }
        }

        // Merge with a sibling and recurse into the parent.
        if ppos > 0 {
            let left_idx = parent.child(ppos - 1);
            let left = self.page(left_idx)?;
            if is_leaf {
                let next = page.header().next_leaf.load(Ordering::SeqCst);
                self.with_page_exclusives(&mut vec![left_idx, idx, next], || {
                    left.absorb(&page);
                    left.header().next_leaf.store(next, Ordering::SeqCst);
                    if next == NULL_PAGE {
                        header.rightmost.store(left_idx, Ordering::SeqCst);
                    } else {
                        self.page(next)?
                            .header()
                            .prev_leaf
                            .store(left_idx, Ordering::SeqCst);
                    }
                    Ok(())
                })?;
            } else {
                let base = left.key_count();
                left.absorb(&page);
                for i in base..left.key_count() {
                    self.page(left.child(i))?
                        .header()
                        .parent
                        .store(left_idx, Ordering::SeqCst);
                }
            }
            self.free_page(kilroy, idx)?;
            parent.remove_entry(ppos);
            return self.rebalance(kilroy, parent_idx);
        }

        if parent.key_count() < 2 {
            // Lone underfull child of an underfull parent; the parent's own
            // rebalance resolves it on a later pass.
            return Ok(());
        }
        let right_idx = parent.child(1);
        let right = self.page(right_idx)?;
        if is_leaf {
            let next = right.header().next_leaf.load(Ordering::SeqCst);
            self.with_page_exclusives(&mut vec![idx, right_idx, next], || {
                page.absorb(&right);
                page.header().next_leaf.store(next, Ordering::SeqCst);
                if next == NULL_PAGE {
                    header.rightmost.store(idx, Ordering::SeqCst);
                } else {
                    self.page(next)?
                        .header()
                        .prev_leaf
                        .store(idx, Ordering::SeqCst);
                }
                Ok(())
            })?;
        } else {
            let base = page.key_count();
            page.absorb(&right);
            for i in base..page.key_count() {
                self.page(page.child(i))?
                    .header()
                    .parent
                    .store(idx, Ordering::SeqCst);
            }
        }
        self.free_page(kilroy, right_idx)?;
        parent.remove_entry(1);
        self.rebalance(kilroy, parent_idx)
    }

    fn position_of_child(&self, parent: &Page, child: u32) -> Result<usize> {
        for i in 0..parent.key_count() {
            if parent.child(i) == child {
                return Ok(i);
            }
        }
        Err(DbError::OperationFailed("child missing from parent page".into()))
    }

    /// Queue-exclusive the given pages in ascending index order, run `f`,
    /// release. Ascending order is the crate-wide rule that keeps two
    /// writers from meeting in the middle.
    fn with_page_exclusives<F>(&self, ids: &mut Vec<u32>, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let rt = &self.runtime;
        ids.retain(|&i| i != NULL_PAGE);
        ids.sort_unstable();
        ids.dedup();
        let mut locked = Vec::with_capacity(ids.len());
        for &i in ids.iter() {
            let page = self.page(i)?;
            let mut attempts = 0;
            while page.header().lock.queue_exclusive(rt).is_err() {
                rt.backoff(attempts);
                attempts = attempts.saturating_add(1);
            }
            page.header().lock.wait_queue_exclusive(rt);
            locked.push(i);
        }
        let out = f();
        for &i in locked.iter().rev() {
            if let Ok(page) = self.page(i) {
                let _ = page.header().lock.release_exclusive();
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    pub(crate) fn check(&self, kilroy: u32) -> Result<BTreeCheck> {
        let header = self.header();
        let rt = &self.runtime;
        header.struct_lock.acquire(rt, kilroy)?;
        header.tree_lock.exclusive(rt);
        let result = self.check_inner();
        let _ = header.tree_lock.release_exclusive();
        header.struct_lock.release(kilroy)?;
        result
    }

    fn check_inner(&self) -> Result<BTreeCheck> {
        let header = self.header();
        let root = header.root.load(Ordering::SeqCst);
        let mut leaves = Vec::new();
        let mut stats = BTreeCheck {
            depth: 0,
            pages: 0,
            leaves: 0,
            keys: 0,
        };
        self.check_page(root, NULL_PAGE, 1, &mut leaves, &mut stats)?;

        // Leaf chain agrees with the recursion, both directions.
        let mut idx = header.leftmost.load(Ordering::SeqCst);
        let mut prev = NULL_PAGE;
        let mut chained = Vec::new();
        while idx != NULL_PAGE {
            let page = self.page(idx)?;
            if !page.is_leaf() {
                return Err(DbError::OperationFailed("non-leaf on the leaf chain".into()));
            }
            if page.header().prev_leaf.load(Ordering::SeqCst) != prev {
                return Err(DbError::OperationFailed("broken leaf back-link".into()));
            }
            chained.push(idx);
            prev = idx;
            idx = page.header().next_leaf.load(Ordering::SeqCst);
        }
        if prev != header.rightmost.load(Ordering::SeqCst) {
            return Err(DbError::OperationFailed("rightmost leaf mismatch".into()));
        }
        if chained != leaves {
            return Err(DbError::OperationFailed(
                "leaf chain disagrees with tree order".into(),
            ));
        }

        // Every leaf entry must name a live tuple.
        for &leaf in &leaves {
            let page = self.page(leaf)?;
            for pos in 0..page.key_count() {
                if !self.table.slot_live(page.tuple_ref(pos))? {
                    return Err(DbError::OperationFailed(
                        "index entry names a dead tuple".into(),
                    ));
                }
            }
        }

        stats.leaves = leaves.len() as u32;
        Ok(stats)
    }

    /// Returns (min, max) key of the subtree, absent for an empty leaf.
    #[allow(clippy::type_complexity)]
    fn check_page(
        &self,
        idx: u32,
        expected_parent: u32,
        depth: u32,
        leaves: &mut Vec<u32>,
        stats: &mut BTreeCheck,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let key_len = self.key_len();
        let page = self.page(idx)?;
        stats.pages += 1;
        stats.depth = stats.depth.max(depth);

        if page.header().parent.load(Ordering::SeqCst) != expected_parent {
            return Err(DbError::OperationFailed("bad parent pointer".into()));
        }

        let strict = self.kind() == IndexKind::Primary;
        for i in 1..page.key_count() {
            let cmp = self.ops.compare(page.key(i - 1), page.key(i), key_len);
            let ordered = if strict {
                cmp == CmpOrdering::Less
            } else {
                cmp != CmpOrdering::Greater
            };
            if !ordered {
                return Err(DbError::OperationFailed("keys out of order in page".into()));
            }
        }

        if page.is_leaf() {
            stats.keys += page.key_count() as u64;
            leaves.push(idx);
            if page.key_count() == 0 {
                return Ok(None);
            }
            return Ok(Some((
                page.key(0).to_vec(),
                page.key(page.key_count() - 1).to_vec(),
            )));
        }

        if page.key_count() == 0 {
            return Err(DbError::OperationFailed("empty internal page".into()));
        }
        let mut subtree_min: Option<Vec<u8>> = None;
        let mut prev_max: Option<Vec<u8>> = None;
        for i in 0..page.key_count() {
            let child = page.child(i);
            let bounds = self
                .check_page(child, idx, depth + 1, leaves, stats)?
                .ok_or_else(|| DbError::OperationFailed("empty non-root subtree".into()))?;
            let (child_min, child_max) = bounds;
            // The separator must not exceed the smallest key of its child;
            // entry 0 is the catch-all and may sit above it.
            if i > 0
                && self.ops.compare(page.key(i), &child_min, key_len) == CmpOrdering::Greater
            {
                return Err(DbError::OperationFailed("separator above child keys".into()));
            }
            if let Some(prev) = &prev_max {
                let cmp = self.ops.compare(prev, &child_min, key_len);
                let ordered = if strict {
                    cmp == CmpOrdering::Less
                } else {
                    cmp != CmpOrdering::Greater
                };
                if !ordered {
                    return Err(DbError::OperationFailed(
                        "sibling subtrees out of order".into(),
                    ));
                }
            }
            if subtree_min.is_none() {
                subtree_min = Some(child_min);
            }
            prev_max = Some(child_max);
        }
        Ok(Some((
            subtree_min.expect("loop above always sets this"),
            prev_max.expect("loop above always sets this"),
        )))
    }
}

impl TupleIndex for BTreeShared {
    fn insert_entry(&self, kilroy: u32, loc: TupleLoc, tuple: &[u8]) -> Result<()> {
        let key_len = self.key_len();
        let key = self.ops.extract(tuple);
        if key.len() < key_len {
            return Err(DbError::BadParameters("extracted key shorter than key length".into()));
        }
        self.insert(kilroy, &key[..key_len], loc)
    }

    fn remove_entry(&self, kilroy: u32, loc: TupleLoc, tuple: &[u8]) -> Result<()> {
        let key_len = self.key_len();
        let key = self.ops.extract(tuple);
        if key.len() < key_len {
            return Err(DbError::BadParameters("extracted key shorter than key length".into()));
        }
        self.remove(kilroy, &key[..key_len], loc)
    }
}
