// Range cursors over the leaf chain.
//
// A cursor owns at most one share lock, on its current leaf. Crossing a
// boundary crabs onto the neighbor before letting go of the prior leaf, but
// never blocks while holding a lock: if the neighbor carries a writer's
// exclusive intent, the cursor releases its own share, backs off, and
// reacquires. A cursor whose remembered entry moved (a split or merge ran
// while it stood aside) repositions itself from the remembered key and ref.

use std::sync::atomic::Ordering;

use crate::error::{DbError, Result};
use crate::table::TupleRef;

use super::layout::NULL_PAGE;
use super::tree::{BTree, CursorState, EntryHit};
use super::MatchMode;

impl<'t> BTree<'t> {
    /// Position the cursor by key and take a share on its leaf. Also
    /// positions the table cursor on the found tuple.
    pub fn set_cursor(
        &self,
        key: &[u8],
        match_mode: MatchMode,
        len: usize,
    ) -> Result<Option<TupleRef<'t>>> {
        self.release_cursor();
        let eff = self.shared.effective_len(match_mode, len, key)?;
        let hit = self
            .shared
            .find(key, super::ReadMode::CrabLock, match_mode, eff, true)?;
        self.adopt(hit)
    }

    /// Position on the first entry of the index.
    pub fn set_cursor_to_start(&self) -> Result<Option<TupleRef<'t>>> {
        self.release_cursor();
        let hit = self.shared.edge_entry(true)?;
        self.adopt(hit)
    }

    /// Position on the last entry of the index.
    pub fn set_cursor_to_end(&self) -> Result<Option<TupleRef<'t>>> {
        self.release_cursor();
        let hit = self.shared.edge_entry(false)?;
        self.adopt(hit)
    }

    /// Advance to the next entry in key order.
    pub fn cursor_next(&self) -> Result<Option<TupleRef<'t>>> {
        let rt = self.shared.runtime.clone();
        let mut guard = self.cursor.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| DbError::BadParameters("cursor is not set".into()))?;

        let page = self.shared.page(state.page)?;
        if state.pos + 1 < page.key_count() {
            state.pos += 1;
            state.last_key = page.key(state.pos).to_vec();
            state.last_ref = page.tuple_ref(state.pos);
            let loc = state.last_ref;
            drop(guard);
            return self.resolve(loc);
        }

        let mut attempts = 0u32;
        loop {
            let page = self.shared.page(state.page)?;
            let next = page.header().next_leaf.load(Ordering::SeqCst);
            if next == NULL_PAGE {
                return Ok(None);
            }
            let next_page = self.shared.page(next)?;
            match next_page.header().lock.try_share() {
                Ok(()) => {
                    let intact = next_page.is_leaf()
                        && next_page.header().prev_leaf.load(Ordering::SeqCst) == state.page
                        && next_page.key_count() > 0;
                    if intact {
                        page.header().lock.release_share();
                        state.page = next;
                        state.pos = 0;
                        state.last_key = next_page.key(0).to_vec();
                        state.last_ref = next_page.tuple_ref(0);
                        let loc = state.last_ref;
                        drop(guard);
                        return self.resolve(loc);
                    }
                    // The neighbor index went stale while we looked away.
                    next_page.header().lock.release_share();
                }
                Err(_) => {
                    // A writer wants the neighbor; get out of its way, then
                    // come back and see whether our own leaf survived.
                    page.header().lock.release_share();
                    rt.arbitrate(attempts);
                    attempts = attempts.saturating_add(1);
                    page.header().lock.share(&rt);
                    let intact = page.is_leaf()
                        && state.pos < page.key_count()
                        && page.tuple_ref(state.pos) == state.last_ref;
                    if intact {
                        continue;
                    }
                }
            }
            // Reposition from the remembered entry.
            let key = std::mem::take(&mut state.last_key);
            let after = state.last_ref;
            page.header().lock.release_share();
            *guard = None;
            drop(guard);
            let hit = self.shared.successor_of(&key, after)?;
            return self.adopt(hit);
        }
    }

    /// Step back to the previous entry in key order.
    pub fn cursor_prev(&self) -> Result<Option<TupleRef<'t>>> {
        let rt = self.shared.runtime.clone();
        let mut guard = self.cursor.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| DbError::BadParameters("cursor is not set".into()))?;

        let page = self.shared.page(state.page)?;
        if state.pos > 0 && page.key_count() > 0 {
            state.pos -= 1;
            state.last_key = page.key(state.pos).to_vec();
            state.last_ref = page.tuple_ref(state.pos);
            let loc = state.last_ref;
            drop(guard);
            return self.resolve(loc);
        }

        let mut attempts = 0u32;
        loop {
            let page = self.shared.page(state.page)?;
            let prev = page.header().prev_leaf.load(Ordering::SeqCst);
            if prev == NULL_PAGE {
                return Ok(None);
            }
            let prev_page = self.shared.page(prev)?;
            match prev_page.header().lock.try_share() {
                Ok(()) => {
                    let intact = prev_page.is_leaf()
                        && prev_page.header().next_leaf.load(Ordering::SeqCst) == state.page
                        && prev_page.key_count() > 0;
                    if intact {
                        page.header().lock.release_share();
                        state.page = prev;
                        state.pos = prev_page.key_count() - 1;
                        state.last_key = prev_page.key(state.pos).to_vec();
                        state.last_ref = prev_page.tuple_ref(state.pos);
                        let loc = state.last_ref;
                        drop(guard);
                        return self.resolve(loc);
                    }
                    prev_page.header().lock.release_share();
                }
                Err(_) => {
                    page.header().lock.release_share();
                    rt.arbitrate(attempts);
                    attempts = attempts.saturating_add(1);
                    page.header().lock.share(&rt);
                    let intact = page.is_leaf()
                        && state.pos < page.key_count()
                        && page.tuple_ref(state.pos) == state.last_ref;
                    if intact {
                        continue;
                    }
                }
            }
            let key = std::mem::take(&mut state.last_key);
            let before = state.last_ref;
            page.header().lock.release_share();
            *guard = None;
            drop(guard);
            let hit = self.shared.predecessor_of(&key, before)?;
            return self.adopt(hit);
        }
    }

    /// Release the cursor and any leaf lock it holds.
    pub fn free_cursor(&self) {
        self.release_cursor();
    }

    pub(crate) fn release_cursor(&self) {
        let mut guard = self.cursor.lock();
        if let Some(state) = guard.take() {
            if let Ok(page) = self.shared.page(state.page) {
                page.header().lock.release_share();
            }
        }
    }

    /// Install a located entry (leaf share already held) as the cursor and
    /// hand back the tuple it names.
    fn adopt(&self, hit: Option<EntryHit>) -> Result<Option<TupleRef<'t>>> {
        let hit = match hit {
            Some(hit) => hit,
            None => return Ok(None),
        };
        let page = self.shared.page(hit.page)?;
        *self.cursor.lock() = Some(CursorState {
            page: hit.page,
            pos: hit.pos,
            last_key: page.key(hit.pos).to_vec(),
            last_ref: hit.loc,
        });
        match self.resolve(hit.loc) {
            Ok(Some(tuple)) => Ok(Some(tuple)),
            other => {
                self.release_cursor();
                other
            }
        }
    }
}
