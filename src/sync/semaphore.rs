// Cross-process counted semaphore over System-V IPC.
//
// A semaphore group of three: [0] the counted value, [1] a process counter
// seeded with a large sentinel, [2] a latch guarding creation and teardown.
// The dance around creation and the last-detacher removal follows the
// classic Stevens recipe for surviving the races SysV leaves open. Every
// semop carries SEM_UNDO so a crashed holder releases its locks and gives
// back its process-counter decrement.

use crate::error::{DbError, Result};

/// Sentinel seeded into the process counter; when `close` sees it restored
/// the closer is the last one out and removes the group.
const BIG_COUNT: i32 = 10_000;

const SEM_VALUE: u16 = 0;
const SEM_PROCS: u16 = 1;
const SEM_LATCH: u16 = 2;

/// A named kernel semaphore, shared and viewable among all processes.
pub struct KernelSem {
    id: libc::c_int,
}

fn sembuf(num: u16, op: i16, flg: i32) -> libc::sembuf {
    libc::sembuf {
        sem_num: num,
        sem_op: op,
        sem_flg: flg as i16,
    }
}

fn semop(id: libc::c_int, ops: &mut [libc::sembuf]) -> libc::c_int {
    // Safety: `ops` is a valid sembuf array for the duration of the call.
    unsafe { libc::semop(id, ops.as_mut_ptr(), ops.len()) }
}

impl KernelSem {
    pub fn new() -> Self {
        Self { id: -1 }
    }

    /// Create a named semaphore; fails if the key already exists.
    /// `key` must be a unique non-zero number across the host.
    pub fn create(&mut self, key: i32) -> Result<()> {
        if self.id > -1 {
            return Err(DbError::ObjectInUse("semaphore handle already open".into()));
        }
        if key == libc::IPC_PRIVATE as i32 || key == -1 || key == 0 {
            return Err(DbError::BadParameters("illegal semaphore key".into()));
        }

        loop {
            // Safety: plain semget syscall.
            let id = unsafe {
                libc::semget(key, 3, 0o666 | libc::IPC_CREAT | libc::IPC_EXCL)
            };
            if id < 0 {
                return Err(DbError::OperationFailed("semget create rejected".into()));
            }

            // Take the latch before initializing, in case a racing creator
            // got the same id between our semget and now.
            let mut lock_ops = [sembuf(SEM_LATCH, 0, 0), sembuf(SEM_LATCH, 1, libc::SEM_UNDO)];
            if semop(id, &mut lock_ops) < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::EINVAL {
                    // The group vanished under us; start over.
                    continue;
                }
                return Err(DbError::OperationFailed("semaphore latch failed".into()));
            }

            // Safety: GETVAL takes no semun argument.
            let procs = unsafe { libc::semctl(id, SEM_PROCS as libc::c_int, libc::GETVAL) };
            if procs < 0 {
                return Err(DbError::OperationFailed("semctl GETVAL failed".into()));
            }
            if procs == 0 {
                // Nobody initialized it yet; that job is ours.
                // Safety: SETVAL passes the value as the variadic argument.
                if unsafe { libc::semctl(id, SEM_VALUE as libc::c_int, libc::SETVAL, 1) } < 0 {
                    return Err(DbError::OperationFailed("semctl SETVAL failed".into()));
                }
                if unsafe {
                    libc::semctl(id, SEM_PROCS as libc::c_int, libc::SETVAL, BIG_COUNT)
                } < 0
                {
                    return Err(DbError::OperationFailed("semctl SETVAL failed".into()));
                }
            }

            // Register ourselves and drop the latch in one shot.
            let mut end_ops = [
                sembuf(SEM_PROCS, -1, libc::SEM_UNDO),
                sembuf(SEM_LATCH, -1, libc::SEM_UNDO),
            ];
            if semop(id, &mut end_ops) < 0 {
                return Err(DbError::OperationFailed("semaphore create finish failed".into()));
            }

            self.id = id;
            return Ok(());
        }
    }

    /// Open an existing semaphore; fails if the key does NOT exist.
    pub fn open(&mut self, key: i32) -> Result<()> {
        if self.id > -1 {
            return Err(DbError::ObjectInUse("semaphore handle already open".into()));
        }
        if key == libc::IPC_PRIVATE as i32 || key == -1 || key == 0 {
            return Err(DbError::BadParameters("illegal semaphore key".into()));
        }

        // Safety: plain semget syscall.
        let id = unsafe { libc::semget(key, 3, 0) };
        if id < 0 {
            return Err(DbError::OperationFailed("semget open rejected".into()));
        }

        let mut open_ops = [sembuf(SEM_PROCS, -1, libc::SEM_UNDO)];
        if semop(id, &mut open_ops) < 0 {
            return Err(DbError::OperationFailed("semaphore open failed".into()));
        }

        self.id = id;
        Ok(())
    }

    /// Lock, blocking until successful.
    pub fn get_lock(&self) -> Result<()> {
        self.op_block(-1)
    }

    /// Unlock.
    pub fn free_lock(&self) -> Result<()> {
        self.op_block(1)
    }

    /// Try to lock, returning `ObjectInUse` instead of blocking.
    pub fn try_lock(&self) -> Result<()> {
        if self.id < 0 {
            return Err(DbError::BadParameters("semaphore not open".into()));
        }
        let mut ops = [sembuf(SEM_VALUE, -1, libc::SEM_UNDO | libc::IPC_NOWAIT)];
        if semop(self.id, &mut ops) < 0 {
            return Err(DbError::ObjectInUse("semaphore busy".into()));
        }
        Ok(())
    }

    /// Detach; the last process out removes the group.
    pub fn close(&mut self) -> Result<()> {
        if self.id == -1 {
            return Ok(());
        }

        // Latch, then give back our process-counter decrement.
        let mut close_ops = [
            sembuf(SEM_LATCH, 0, 0),
            sembuf(SEM_LATCH, 1, libc::SEM_UNDO),
            sembuf(SEM_PROCS, 1, libc::SEM_UNDO),
        ];
        if semop(self.id, &mut close_ops) < 0 {
            return Err(DbError::OperationFailed("semaphore close failed".into()));
        }

        // Safety: GETVAL takes no semun argument.
        let procs = unsafe { libc::semctl(self.id, SEM_PROCS as libc::c_int, libc::GETVAL) };
        if procs < 0 {
            return Err(DbError::OperationFailed("semctl GETVAL failed".into()));
        }

        if procs == BIG_COUNT {
            // Last one out deletes the group (which also drops the latch).
            // Safety: IPC_RMID ignores the semnum argument.
            if unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) } < 0 {
                return Err(DbError::OperationFailed("semctl IPC_RMID failed".into()));
            }
        } else {
            let mut unlock_ops = [sembuf(SEM_LATCH, -1, libc::SEM_UNDO)];
            if semop(self.id, &mut unlock_ops) < 0 {
                return Err(DbError::OperationFailed("semaphore unlatch failed".into()));
            }
        }

        self.id = -1;
        Ok(())
    }

    fn op_block(&self, delta: i16) -> Result<()> {
        if self.id < 0 {
            return Err(DbError::BadParameters("semaphore not open".into()));
        }
        if delta == 0 {
            return Err(DbError::BadParameters("zero semaphore adjustment".into()));
        }
        let mut ops = [sembuf(SEM_VALUE, delta, libc::SEM_UNDO)];
        if semop(self.id, &mut ops) < 0 {
            return Err(DbError::OperationFailed("semop failed".into()));
        }
        Ok(())
    }
}

impl Drop for KernelSem {
    fn drop(&mut self) {
        if self.id > -1 {
            let _ = self.close();
        }
    }
}

impl Default for KernelSem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(slot: i32) -> i32 {
        // Derive from the pid so parallel test runs do not collide.
        ((std::process::id() as i32) & 0x000F_FFFF) << 8 | (0x40 + slot)
    }

    #[test]
    fn test_create_lock_unlock_close() {
        let mut sem = KernelSem::new();
        sem.create(test_key(0)).unwrap();
        sem.get_lock().unwrap();
        sem.free_lock().unwrap();
        sem.close().unwrap();
    }

    #[test]
    fn test_try_lock_bounces_when_held() {
        let mut a = KernelSem::new();
        a.create(test_key(1)).unwrap();
        let mut b = KernelSem::new();
        b.open(test_key(1)).unwrap();

        a.get_lock().unwrap();
        assert_eq!(b.try_lock().unwrap_err().kind(), "object_in_use");
        a.free_lock().unwrap();
        b.try_lock().unwrap();
        b.free_lock().unwrap();

        b.close().unwrap();
        a.close().unwrap();
    }

    #[test]
    fn test_open_missing_fails() {
        let mut sem = KernelSem::new();
        assert!(sem.open(test_key(2)).is_err());
    }

    #[test]
    fn test_create_collision() {
        let mut a = KernelSem::new();
        a.create(test_key(3)).unwrap();
        let mut b = KernelSem::new();
        assert!(b.create(test_key(3)).is_err());
        b.open(test_key(3)).unwrap();
        b.close().unwrap();
        a.close().unwrap();
    }
}
