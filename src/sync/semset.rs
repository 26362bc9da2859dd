//! An array of `MAX_PROCESSES` wait-counters backed by System V semaphore
//! sets.
//!
//! A single `semget` set is capped (typically by `SEMMSL`) well below
//! `MAX_PROCESSES`, so a `SemSet` composes as many underlying sets as
//! needed, each holding `SYSV_SETS_PER_SEMSET` semaphores, and does the
//! `slot -> (set, sem)` arithmetic itself. This mirrors
//! `original_source/SemSet.c`'s `SETS_NEEDED`/`SET_NO`/`SEM_NO` macros.

use std::io;

use crate::error::{ProcshareError, Result};
use crate::options::{MAX_PROCESSES, SYSV_SETS_PER_SEMSET};

const SETS_NEEDED: usize = (MAX_PROCESSES + SYSV_SETS_PER_SEMSET - 1) / SYSV_SETS_PER_SEMSET;

fn set_no(slot: usize) -> usize {
    slot / SYSV_SETS_PER_SEMSET
}

fn sem_no(slot: usize) -> usize {
    slot % SYSV_SETS_PER_SEMSET
}

/// Storable directly in shared memory: holds the `semid`s returned by
/// `semget`, not the semaphores themselves (those live in kernel space).
#[repr(C)]
pub struct SemSet {
    semids: [i32; SETS_NEEDED],
}

impl SemSet {
    /// Creates `SETS_NEEDED` fresh, privately-keyed semaphore sets, each
    /// `SYSV_SETS_PER_SEMSET` semaphores wide, all counters starting at
    /// zero.
    pub fn create() -> Result<SemSet> {
        let mut semids = [0i32; SETS_NEEDED];
        for slot in semids.iter_mut() {
            let id = unsafe {
                libc::semget(
                    libc::IPC_PRIVATE,
                    SYSV_SETS_PER_SEMSET as i32,
                    libc::IPC_CREAT | 0o600,
                )
            };
            if id < 0 {
                // best-effort teardown of sets created so far
                for &created in semids.iter() {
                    if created != 0 {
                        unsafe {
                            libc::semctl(created, 0, libc::IPC_RMID);
                        }
                    }
                }
                return Err(ProcshareError::Os(io::Error::last_os_error()));
            }
            *slot = id;
        }
        Ok(SemSet { semids })
    }

    pub fn destroy(&self) {
        for &id in self.semids.iter() {
            unsafe {
                libc::semctl(id, 0, libc::IPC_RMID);
            }
        }
    }

    /// Increments slot `n`'s counter, waking one waiter if one is
    /// blocked in `down`.
    pub fn up(&self, n: usize) -> Result<()> {
        self.sem_op(n, 1)
    }

    /// Decrements slot `n`'s counter, blocking until it is positive.
    /// Restarted internally on `EINTR`.
    pub fn down(&self, n: usize) -> Result<()> {
        self.sem_op(n, -1)
    }

    fn sem_op(&self, slot: usize, delta: i16) -> Result<()> {
        debug_assert!(slot < MAX_PROCESSES);
        let semid = self.semids[set_no(slot)];
        let sembuf = libc::sembuf {
            sem_num: sem_no(slot) as u16,
            sem_op: delta,
            sem_flg: 0,
        };
        loop {
            let rc = unsafe { libc::semop(semid, &sembuf as *const _ as *mut _, 1) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ProcshareError::Os(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_then_down_does_not_block() {
        let set = SemSet::create().expect("semget should succeed in test sandbox");
        set.up(3).unwrap();
        set.down(3).unwrap();
        set.destroy();
    }

    #[test]
    fn test_set_no_sem_no_arithmetic() {
        assert_eq!(set_no(0), 0);
        assert_eq!(sem_no(0), 0);
        assert_eq!(set_no(SYSV_SETS_PER_SEMSET), 1);
        assert_eq!(sem_no(SYSV_SETS_PER_SEMSET), 0);
        assert_eq!(set_no(MAX_PROCESSES - 1), SETS_NEEDED - 1);
    }
}
