// Adaptive back-off for contested lock words.
//
// Spinning only pays off when the holder can progress on another core, so
// the schedule is picked from the detected processor count: multi-CPU hosts
// start with short busy-spins and escalate through micro-sleeps; single-CPU
// hosts go straight to sleeping.

use std::ptr;
use std::time::Duration;

/// Host facts the lock primitives tune themselves from.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub processors: usize,
}

/// Explicit runtime handle for back-off tuning.
///
/// Construct one per process and share it with every table and tree handle.
/// Replaces any notion of process-global lock-library initialization.
#[derive(Debug)]
pub struct SyncRuntime {
    cpu: CpuInfo,
}

/// Busy-spin `count` iterations against a cell the optimizer cannot elide.
#[inline]
fn spin(count: u32) {
    let mut herring: u32 = 0;
    for i in 0..count {
        // Safety: local stack cell, always valid for writes.
        unsafe { ptr::write_volatile(&mut herring, i) };
        std::hint::spin_loop();
    }
}

impl SyncRuntime {
    pub fn new() -> Self {
        Self {
            cpu: CpuInfo {
                processors: num_cpus::get(),
            },
        }
    }

    /// Override the detected processor count (single-CPU schedule testing).
    pub fn with_processors(processors: usize) -> Self {
        Self {
            cpu: CpuInfo {
                processors: processors.max(1),
            },
        }
    }

    pub fn cpu_info(&self) -> CpuInfo {
        self.cpu
    }

    /// One back-off step for a lock that has already been contested
    /// `attempts` times. Callers increment the counter themselves.
    pub fn backoff(&self, attempts: u32) {
        if self.cpu.processors > 1 {
            match attempts {
                // The lock is probably held for a quickly used and freed
                // resource; churn a little before touching the scheduler.
                0 => spin(3),
                1 => spin(7),
                2 => spin(9),
                3 => spin(101),
                4 => spin(1007),
                5 => sleep_us(10),
                6 => spin(7),
                7 => spin(101),
                8 => sleep_us(10),
                9 => spin(103),
                10 => sleep_us(10),
                11 => sleep_us(100),
                12 => spin(101),
                13 | 14 => sleep_us(100),
                15 => spin(103),
                16 | 17 => sleep_us(1_000),
                18 => spin(101),
                19 => sleep_us(10_000),
                // Probably wedged; give the holder plenty of free CPU.
                _ => sleep_us(1_000_000),
            }
        } else {
            match attempts {
                // On one processor, spinning just starves the holder.
                0 | 1 => sleep_us(10),
                2 | 3 => sleep_us(100),
                4 | 5 => sleep_us(1_000),
                6 | 7 => sleep_us(10_000),
                8 | 9 => sleep_us(100_000),
                _ => sleep_us(1_000_000),
            }
        }
    }

    /// Cooperative yield for callers renegotiating multiple locks to dodge
    /// a deadlock. Start `attempts` at zero and increase it on every call.
    pub fn arbitrate(&self, attempts: u32) {
        self.backoff(attempts);
    }
}

impl Default for SyncRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn sleep_us(us: u64) {
    std::thread::sleep(Duration::from_micros(us));
}
