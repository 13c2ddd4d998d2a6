// Named shared-memory segments over System-V IPC.
//
// A segment is (key, base pointer, size). Creation zero-fills (kernel
// guarantee), attachment maps the same physical pages at a process-private
// address, and the segment lives until the last attached process detaches.

use std::ptr::NonNull;

use crate::error::{DbError, Result};

/// A mapped shared-memory segment identified by a host-wide integer key.
#[derive(Debug)]
pub struct SharedMem {
    id: libc::c_int,
    key: i32,
    base: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is valid for the life of the struct and all access
// to its contents goes through atomics or lock-guarded raw pointers.
unsafe impl Send for SharedMem {}
unsafe impl Sync for SharedMem {}

impl SharedMem {
    /// Create a segment of `size` bytes at `key`; fails if the key exists.
    pub fn create(key: i32, size: usize) -> Result<Self> {
        if key == 0 || size == 0 {
            return Err(DbError::BadParameters("zero shared memory key or size".into()));
        }
        // Safety: plain shmget syscall.
        let id = unsafe {
            libc::shmget(key, size, 0o666 | libc::IPC_CREAT | libc::IPC_EXCL)
        };
        if id < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EEXIST {
                return Err(DbError::ObjectInUse("shared memory key exists".into()));
            }
            return Err(DbError::OutOfMemory("shmget create rejected".into()));
        }
        Self::map(id, key, size)
    }

    /// Attach to an existing segment; fails if the key does NOT exist.
    pub fn attach(key: i32) -> Result<Self> {
        if key == 0 {
            return Err(DbError::BadParameters("zero shared memory key".into()));
        }
        // Safety: plain shmget syscall.
        let id = unsafe { libc::shmget(key, 0, 0) };
        if id < 0 {
            return Err(DbError::NotFound("shared memory key absent".into()));
        }
        // Safety: ds is fully overwritten by IPC_STAT on success.
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } < 0 {
            return Err(DbError::OperationFailed("shmctl IPC_STAT failed".into()));
        }
        Self::map(id, key, ds.shm_segsz as usize)
    }

    fn map(id: libc::c_int, key: i32, len: usize) -> Result<Self> {
        // Safety: id was just returned by shmget.
        let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if base == usize::MAX as *mut libc::c_void {
            return Err(DbError::OperationFailed("shmat failed".into()));
        }
        Ok(Self {
            id,
            key,
            base: NonNull::new(base as *mut u8)
                .ok_or_else(|| DbError::OperationFailed("null shared mapping".into()))?,
            len,
        })
    }

    /// The mapped address of the segment in this process.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    /// Detach; the last detacher removes the segment from the host.
    pub fn detach(self) -> Result<()> {
        // Drop does the actual work; this form surfaces intent at call sites.
        drop(self);
        Ok(())
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        // Safety: base was returned by shmat and is detached exactly once.
        unsafe {
            libc::shmdt(self.base.as_ptr() as *const libc::c_void);
            let mut ds: libc::shmid_ds = std::mem::zeroed();
            if libc::shmctl(self.id, libc::IPC_STAT, &mut ds) == 0 && ds.shm_nattch == 0 {
                libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_key(slot: i32) -> i32 {
        ((std::process::id() as i32) & 0x000F_FFFF) << 8 | (0x10 + slot)
    }

    #[test]
    fn test_create_attach_share_bytes() {
        let a = SharedMem::create(test_key(0), 4096).unwrap();
        assert_eq!(a.len(), 4096);

        // A second attachment sees writes made through the first.
        let b = SharedMem::attach(test_key(0)).unwrap();
        let cell_a = unsafe { &*(a.base().as_ptr() as *const AtomicU32) };
        let cell_b = unsafe { &*(b.base().as_ptr() as *const AtomicU32) };
        assert_eq!(cell_b.load(Ordering::SeqCst), 0);
        cell_a.store(0xDEAD_BEEF, Ordering::SeqCst);
        assert_eq!(cell_b.load(Ordering::SeqCst), 0xDEAD_BEEF);

        drop(b);
        drop(a);
        // Last detach removed the segment.
        assert!(SharedMem::attach(test_key(0)).is_err());
    }

    #[test]
    fn test_create_collision() {
        let a = SharedMem::create(test_key(1), 1024).unwrap();
        let err = SharedMem::create(test_key(1), 1024).unwrap_err();
        assert_eq!(err.kind(), "object_in_use");
        drop(a);
    }

    #[test]
    fn test_zero_key_rejected() {
        assert!(SharedMem::create(0, 64).is_err());
        assert!(SharedMem::attach(0).is_err());
    }
}
