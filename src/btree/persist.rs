// B-tree persistence: the full page image, pages in index order.
//
// Free pages serialize with a zero key count; on load the free list is
// rebuilt from the pages unreachable from the root, so the reachable tree
// restores structurally exact.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::error::{DbError, Result};

use super::layout::{PAGE_LEAF, NULL_PAGE};
use super::tree::BTree;

const SAVE_MAGIC: &[u8; 4] = b"ATBT";
const SAVE_VERSION: u32 = 1;

fn w32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn r32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn r8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

impl BTree<'_> {
    /// Serialize the tree: header, then every pool page in index order.
    pub fn write_btree(&self, path: &Path) -> Result<()> {
        let shared = &self.shared;
        let header = shared.header();
        let rt = &shared.runtime;
        header.struct_lock.acquire(rt, self.kilroy)?;
        header.tree_lock.exclusive(rt);
        let result = (|| {
            let key_len = shared.key_len();
            let mut out = BufWriter::new(File::create(path)?);
            out.write_all(SAVE_MAGIC)?;
            w32(&mut out, SAVE_VERSION)?;
            w32(&mut out, key_len as u32)?;
            w32(&mut out, shared.keys_per_page() as u32)?;
            w32(&mut out, header.pages_per_block.load(Ordering::SeqCst))?;
            out.write_all(&[header.kind.load(Ordering::SeqCst) as u8])?;
            w32(&mut out, header.root.load(Ordering::SeqCst))?;
            w32(&mut out, header.leftmost.load(Ordering::SeqCst))?;
            w32(&mut out, header.rightmost.load(Ordering::SeqCst))?;
            let pages = header.page_count.load(Ordering::SeqCst);
            w32(&mut out, pages)?;
            w32(&mut out, header.table_key.load(Ordering::SeqCst))?;

            for index in 0..pages {
                let page = shared.page(index)?;
                let leaf = page.is_leaf();
                out.write_all(&[leaf as u8])?;
                w32(&mut out, page.header().parent.load(Ordering::SeqCst))?;
                let count = page.key_count();
                w32(&mut out, count as u32)?;
                w32(&mut out, page.header().prev_leaf.load(Ordering::SeqCst))?;
                w32(&mut out, page.header().next_leaf.load(Ordering::SeqCst))?;
                for slot in 0..count {
                    out.write_all(page.key(slot))?;
                }
                for slot in 0..count {
                    let (a, b) = page.ref_at(slot);
                    if leaf {
                        w32(&mut out, a)?;
                        w32(&mut out, b)?;
                    } else {
                        w32(&mut out, a)?;
                    }
                }
            }
            out.flush()?;
            Ok(())
        })();
        let _ = header.tree_lock.release_exclusive();
        header.struct_lock.release(self.kilroy)?;
        result
    }

    /// Restore a `write_btree` image into this freshly created, empty tree.
    pub fn load_btree(&self, path: &Path) -> Result<()> {
        let shared = &self.shared;
        let header = shared.header();
        let rt = &shared.runtime;

        let mut input = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != SAVE_MAGIC {
            return Err(DbError::BadParameters("not a B-tree save file".into()));
        }
        if r32(&mut input)? != SAVE_VERSION {
            return Err(DbError::BadParameters("unknown B-tree save version".into()));
        }
        let key_len = shared.key_len();
        if r32(&mut input)? as usize != key_len
            || r32(&mut input)? as usize != shared.keys_per_page()
            || r32(&mut input)? != header.pages_per_block.load(Ordering::SeqCst)
            || r8(&mut input)? as u32 != header.kind.load(Ordering::SeqCst)
        {
            return Err(DbError::BadParameters("tree geometry mismatch".into()));
        }
        let root = r32(&mut input)?;
        let leftmost = r32(&mut input)?;
        let rightmost = r32(&mut input)?;
        let file_pages = r32(&mut input)?;
        let _table_key = r32(&mut input)?;

        header.struct_lock.acquire(rt, self.kilroy)?;
        header.tree_lock.exclusive(rt);
        let result = (|| {
            let current_root = shared.page(header.root.load(Ordering::SeqCst))?;
            if !current_root.is_leaf() || current_root.key_count() != 0 {
                return Err(DbError::UnsafeOperation(
                    "loading into a non-empty tree".into(),
                ));
            }

            // Grow the pool to the file's size; the free list is rebuilt
            // from scratch afterwards, so interim pops do not matter.
            while header.page_count.load(Ordering::SeqCst) < file_pages {
                shared.alloc_page(self.kilroy, true)?;
            }
            if header.page_count.load(Ordering::SeqCst) != file_pages {
                return Err(DbError::BadParameters("pool size mismatch".into()));
            }

            let mut key = vec![0u8; key_len];
            for index in 0..file_pages {
                let page = shared.page(index)?;
                let leaf = r8(&mut input)? != 0;
                let parent = r32(&mut input)?;
                let count = r32(&mut input)? as usize;
                if count > shared.keys_per_page() {
                    return Err(DbError::BadParameters("page overflow in save".into()));
                }
                let prev_leaf = r32(&mut input)?;
                let next_leaf = r32(&mut input)?;

                let ph = page.header();
                ph.flags.store(if leaf { PAGE_LEAF } else { 0 }, Ordering::SeqCst);
                ph.parent.store(parent, Ordering::SeqCst);
                ph.prev_leaf.store(prev_leaf, Ordering::SeqCst);
                ph.next_leaf.store(next_leaf, Ordering::SeqCst);
                ph.key_count.store(0, Ordering::SeqCst);

                // Keys come as one block, refs as another, in slot order.
                let mut keys = vec![0u8; count * key_len];
                input.read_exact(&mut keys)?;
                for slot in 0..count {
                    key.copy_from_slice(&keys[slot * key_len..(slot + 1) * key_len]);
                    let r = if leaf {
                        (r32(&mut input)?, r32(&mut input)?)
                    } else {
                        (r32(&mut input)?, 0)
                    };
                    page.set_entry(slot, &key, r);
                }
                ph.key_count.store(count as u32, Ordering::SeqCst);
            }

            header.root.store(root, Ordering::SeqCst);
            header.leftmost.store(leftmost, Ordering::SeqCst);
            header.rightmost.store(rightmost, Ordering::SeqCst);

            self.rebuild_free_pages(file_pages)
        })();
        let _ = header.tree_lock.release_exclusive();
        header.struct_lock.release(self.kilroy)?;
        result
    }

    /// Reset the free list to exactly the pages unreachable from the root.
    fn rebuild_free_pages(&self, pages: u32) -> Result<()> {
        let shared = &self.shared;
        let header = shared.header();

        let mut reachable = vec![false; pages as usize];
        let mut stack = vec![header.root.load(Ordering::SeqCst)];
        while let Some(index) = stack.pop() {
            if index == NULL_PAGE || index >= pages || reachable[index as usize] {
                continue;
            }
            reachable[index as usize] = true;
            let page = shared.page(index)?;
            if !page.is_leaf() {
                for slot in 0..page.key_count() {
                    stack.push(page.child(slot));
                }
            }
        }

        header.free_head.store(NULL_PAGE, Ordering::SeqCst);
        for index in (0..pages).rev() {
            if !reachable[index as usize] {
                shared.free_page(self.kilroy, index)?;
            }
        }
        Ok(())
    }
}
