// Table persistence.
//
// Two formats. Export/import is a bare stream of live tuple payloads in
// iteration order, reconstructable only by a caller who knows the tuple
// size. Write/load is the full internal image: geometry, per-slot control
// headers (locks zeroed) and payloads, from which a freshly created table
// reproduces a logically equal one, free-list chains included.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::error::{DbError, Result};

use super::layout::{TupleLoc, NULL_LINK, SLOT_DELETE_PENDING, SLOT_LIVE};
use super::table::SharedTable;

const SAVE_MAGIC: &[u8; 4] = b"ATTB";
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

/// Fill `buf` with one fixed record. Ok(false) on a clean end of file;
/// a torn trailing record is an error.
fn read_record<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(DbError::FileError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated record",
            )));
        }
        filled += n;
    }
    Ok(true)
}

impl SharedTable {
    /// Write every live tuple, in iteration order, as raw fixed records.
    /// Returns the record count.
    pub fn export_table(&self, path: &Path) -> Result<u64> {
        let mut out = BufWriter::new(File::create(path)?);
        let mut buf = vec![0u8; self.tuple_size()];
        let mut written = 0u64;
        let mut pos: Option<TupleLoc> = None;
        while let Some(loc) = self.scan_forward(pos) {
            self.shared().read_payload(loc, &mut buf)?;
            out.write_all(&buf)?;
            written += 1;
            pos = Some(loc);
        }
        out.flush()?;
        Ok(written)
    }

    /// Bulk-load fixed records written by `export_table` (or any flat file
    /// of `tuple_size` records). Every record goes through the normal add
    /// path, so attached indexes stay consistent.
    pub fn import_table(&self, path: &Path) -> Result<u64> {
        let mut input = BufReader::new(File::open(path)?);
        let mut buf = vec![0u8; self.tuple_size()];
        let mut loaded = 0u64;
        while read_record(&mut input, &mut buf)? {
            self.add_tuple(&buf)?.unlock()?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Save the full internal structure for a fast warm start.
    pub fn write_table(&self, path: &Path) -> Result<()> {
        let shared = self.shared();
        let header = shared.header();
        // Freeze growth and free-list restructuring for a stable image.
        header
            .table_lock
            .acquire(self.runtime(), self.kilroy())?;
        let result = (|| {
            shared.sync_blocks()?;
            let mut out = BufWriter::new(File::create(path)?);
            out.write_all(SAVE_MAGIC)?;
            w32(&mut out, SAVE_VERSION)?;
            w32(&mut out, header.tuple_size.load(Ordering::SeqCst))?;
            let blocks = header.block_count.load(Ordering::SeqCst);
            w32(&mut out, blocks)?;
            for block in 0..blocks {
                w32(&mut out, shared.block_slots(block))?;
            }
            w32(&mut out, header.add_list_count.load(Ordering::SeqCst))?;
            w32(&mut out, header.delete_list_count.load(Ordering::SeqCst))?;
            out.write_all(&[header.queue_changes.load(Ordering::SeqCst) as u8])?;

            let mut buf = vec![0u8; shared.tuple_size()];
            for block in 0..blocks {
                let slots = shared.block_slots(block);
                w32(&mut out, slots)?;
                for slot in 0..slots {
                    let loc = TupleLoc { block, slot };
                    let control = shared.slot(loc)?;
                    w32(&mut out, 0)?; // lock word, always zeroed on disk
                    w32(&mut out, control.flags.load(Ordering::SeqCst))?;
                    w32(&mut out, control.next_block.load(Ordering::SeqCst))?;
                    w32(&mut out, control.next_slot.load(Ordering::SeqCst))?;
                    shared.read_payload(loc, &mut buf)?;
                    out.write_all(&buf)?;
                }
            }
            out.flush()?;
            Ok(())
        })();
        header.table_lock.release(self.kilroy())?;
        result
    }

    /// Restore a `write_table` image into this freshly created table. The
    /// table must be empty and its geometry must match the file's.
    pub fn load_table(&self, path: &Path) -> Result<()> {
        let shared = self.shared();
        let header = shared.header();
        if self.scan_forward(None).is_some() {
            return Err(DbError::UnsafeOperation(
                "loading into a non-empty table".into(),
            ));
        }

        let mut input = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != SAVE_MAGIC {
            return Err(DbError::BadParameters("not a table save file".into()));
        }
        if r32(&mut input)? != SAVE_VERSION {
            return Err(DbError::BadParameters("unknown table save version".into()));
        }
        if r32(&mut input)? != header.tuple_size.load(Ordering::SeqCst) {
            return Err(DbError::BadParameters("tuple size mismatch".into()));
        }
        let file_blocks = r32(&mut input)?;
        if file_blocks == 0 {
            return Err(DbError::BadParameters("save file names no blocks".into()));
        }
        for block in 0..file_blocks {
            let slots = r32(&mut input)?;
            let expect = if block == 0 {
                header.initial_alloc.load(Ordering::SeqCst)
            } else {
                header.growth_alloc.load(Ordering::SeqCst)
            };
            if slots != expect {
                return Err(DbError::BadParameters("block geometry mismatch".into()));
            }
        }
        if r32(&mut input)? != header.add_list_count.load(Ordering::SeqCst)
            || r32(&mut input)? != header.delete_list_count.load(Ordering::SeqCst)
        {
            return Err(DbError::BadParameters("free-list fan-out mismatch".into()));
        }
        let mut flush = [0u8; 1];
        input.read_exact(&mut flush)?;

        header
            .table_lock
            .acquire(self.runtime(), self.kilroy())?;
        let result = (|| {
            // Match the file's block layout before filling slots.
            shared.sync_blocks()?;
            while header.block_count.load(Ordering::SeqCst) < file_blocks {
                let index = header.block_count.load(Ordering::SeqCst);
                shared.create_block(index, header.growth_alloc.load(Ordering::SeqCst))?;
                header.block_count.store(index + 1, Ordering::SeqCst);
            }

            let mut buf = vec![0u8; shared.tuple_size()];
            for block in 0..file_blocks {
                let slots = r32(&mut input)?;
                if slots != shared.block_slots(block) {
                    return Err(DbError::BadParameters("block geometry mismatch".into()));
                }
                for slot in 0..slots {
                    let loc = TupleLoc { block, slot };
                    let control = shared.slot(loc)?;
                    let _lock = r32(&mut input)?;
                    control.flags.store(r32(&mut input)?, Ordering::SeqCst);
                    control.next_block.store(r32(&mut input)?, Ordering::SeqCst);
                    control.next_slot.store(r32(&mut input)?, Ordering::SeqCst);
                    input.read_exact(&mut buf)?;
                    shared.write_payload(loc, &buf)?;
                }
            }
            self.rebuild_free_lists(file_blocks)
        })();
        header.table_lock.release(self.kilroy())?;
        result
    }

    /// Reconstruct the free pools from slot links: a chain head is a free
    /// slot no other free slot points to. Chains keep their membership and
    /// internal order; delete-pending chains go back to delete lists.
    fn rebuild_free_lists(&self, blocks: u32) -> Result<()> {
        let shared = self.shared();
        let header = shared.header();
        for list in header.add_lists.iter().chain(header.delete_lists.iter()) {
            list.head_block.store(NULL_LINK, Ordering::SeqCst);
            list.head_slot.store(NULL_LINK, Ordering::SeqCst);
            list.count.store(0, Ordering::SeqCst);
        }

        let mut free = Vec::new();
        let mut inbound = HashSet::new();
        for block in 0..blocks {
            for slot in 0..shared.block_slots(block) {
                let loc = TupleLoc { block, slot };
                let control = shared.slot(loc)?;
                if control.flags.load(Ordering::SeqCst) & SLOT_LIVE != 0 {
                    continue;
                }
                free.push(loc);
                let next = TupleLoc {
                    block: control.next_block.load(Ordering::SeqCst),
                    slot: control.next_slot.load(Ordering::SeqCst),
                };
                if next.block != NULL_LINK {
                    inbound.insert(next);
                }
            }
        }

        let add_lists = header.add_list_count.load(Ordering::SeqCst);
        let delete_lists = header.delete_list_count.load(Ordering::SeqCst);
        let (mut next_add, mut next_delete) = (0u32, 0u32);
        let mut visited = HashSet::new();
        for head in free {
            if inbound.contains(&head) {
                continue;
            }
            // Walk the chain head to tail, then splice it onto a list.
            let mut chain = Vec::new();
            let mut walk = head;
            loop {
                if !visited.insert(walk) {
                    return Err(DbError::BadParameters("cyclic free chain in save".into()));
                }
                let control = shared.slot(walk)?;
                if control.flags.load(Ordering::SeqCst) & SLOT_LIVE != 0 {
                    return Err(DbError::BadParameters("free chain crosses a live slot".into()));
                }
                chain.push(walk);
                let next_block = control.next_block.load(Ordering::SeqCst);
                if next_block == NULL_LINK {
                    break;
                }
                walk = TupleLoc {
                    block: next_block,
                    slot: control.next_slot.load(Ordering::SeqCst),
                };
            }
            let queued = shared.slot(head)?.flags.load(Ordering::SeqCst) & SLOT_DELETE_PENDING != 0;
            let list = if queued {
                let list = &header.delete_lists[(next_delete % delete_lists) as usize];
                next_delete += 1;
                list
            } else {
                let list = &header.add_lists[(next_add % add_lists) as usize];
                next_add += 1;
                list
            };
            // Splice preserving chain order: push tail first.
            for &loc in chain.iter().rev() {
                self.push_free(list, loc)?;
            }
        }
        Ok(())
    }
}
