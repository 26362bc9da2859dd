//! Reentrant, blocking, cross-participant mutex.
//!
//! Composed from a [`Spinlock`] guarding a small owner/nest-count/waiters
//! record, plus a [`SemSet`] the caller supplies to actually sleep and
//! wake. `Lock` itself never touches the OS; it only decides who owns the
//! lock and who to wake next, so it can live anywhere in shared memory
//! (inside a `SharedObjectHeader`, inside `Globals::regtable`, ...)
//! without depending on where its semaphore counters happen to live.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{ProcshareError, Result};
use crate::handle::Handle;
use crate::sync::bitmap::Bitmap;
use crate::sync::semset::SemSet;
use crate::sync::spinlock::Spinlock;

#[repr(C)]
pub struct Lock {
    spinlock: Spinlock,
    owner_slot: AtomicI32,
    nest_count: AtomicI32,
    waiters: Bitmap,
    /// Round-robin cursor for waiter selection on release. Lives inside
    /// the shared `Lock` itself rather than as a process-local static:
    /// the lock is shared by every participant contending for it, so
    /// fairness has to be tracked in the one place all of them see.
    cursor: AtomicI32,
}

impl Lock {
    pub const fn new() -> Lock {
        Lock {
            spinlock: Spinlock::new(),
            owner_slot: AtomicI32::new(-1),
            nest_count: AtomicI32::new(0),
            waiters: Bitmap::new(),
            cursor: AtomicI32::new(0),
        }
    }

    pub fn owner_slot(&self) -> i32 {
        self.owner_slot.load(Ordering::Acquire)
    }

    pub fn is_held_by(&self, slot: i32) -> bool {
        self.owner_slot() == slot
    }

    /// Attempts to acquire without blocking: succeeds if the lock is free
    /// or already owned by `self_slot`.
    pub fn try_acquire(&self, self_slot: i32) -> bool {
        let _g = self.spinlock.lock();
        let owner = self.owner_slot.load(Ordering::Relaxed);
        if owner == -1 || owner == self_slot {
            self.owner_slot.store(self_slot, Ordering::Relaxed);
            self.nest_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Blocks until acquired. `semset` provides the OS-level sleep/wake
    /// primitive; `self_slot` both identifies the caller to waiters and
    /// indexes into `semset`. `waiting_on` is this lock's own handle
    /// (`Handle::NULL` if it has none, e.g. a lock internal to `Globals`);
    /// it's recorded in the sleep table before sleeping so other
    /// participants can tell what slot `self_slot` is blocked on, and
    /// cleared again once acquired.
    pub fn acquire(&self, self_slot: i32, semset: &SemSet, waiting_on: Handle) -> Result<()> {
        loop {
            if self.try_acquire(self_slot) {
                crate::globals::clear_waiting(self_slot);
                return Ok(());
            }
            {
                let _g = self.spinlock.lock();
                // Re-check under the lock: the owner may have released
                // between the failed try_acquire above and taking the
                // spinlock again.
                let owner = self.owner_slot.load(Ordering::Relaxed);
                if owner == -1 || owner == self_slot {
                    continue;
                }
                self.waiters.set(self_slot as usize, Ordering::Relaxed);
            }
            crate::globals::mark_waiting(self_slot, waiting_on);
            semset.down(self_slot as usize)?;
        }
    }

    /// Releases one nesting level. Fails if `self_slot` doesn't own the
    /// lock. When the nest count reaches zero, wakes the next waiter
    /// found by scanning the waiters bitmap round-robin from the cursor.
    pub fn release(&self, self_slot: i32, semset: &SemSet) -> Result<()> {
        let woken = {
            let _g = self.spinlock.lock();
            if self.owner_slot.load(Ordering::Relaxed) != self_slot {
                return Err(ProcshareError::NonOwnerRelease);
            }
            let remaining = self.nest_count.fetch_sub(1, Ordering::Relaxed) - 1;
            if remaining > 0 {
                None
            } else {
                self.owner_slot.store(-1, Ordering::Relaxed);
                let start = self.cursor.load(Ordering::Relaxed) as usize;
                let chosen = self.waiters.next_set_from(start, Ordering::Relaxed);
                if let Some(slot) = chosen {
                    self.waiters.clear(slot, Ordering::Relaxed);
                    self.cursor.store((slot + 1) as i32, Ordering::Relaxed);
                }
                chosen
            }
        };
        if let Some(slot) = woken {
            semset.up(slot)?;
        }
        Ok(())
    }
}

impl Default for Lock {
    fn default() -> Lock {
        Lock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_acquire_is_reentrant() {
        let lock = Lock::new();
        assert!(lock.try_acquire(3));
        assert!(lock.try_acquire(3));
        assert_eq!(lock.owner_slot(), 3);
        assert!(!lock.try_acquire(4));
    }

    #[test]
    fn test_release_by_non_owner_fails() {
        let lock = Lock::new();
        let semset = SemSet::create().unwrap();
        lock.try_acquire(1);
        assert!(matches!(
            lock.release(2, &semset),
            Err(ProcshareError::NonOwnerRelease)
        ));
        semset.destroy();
    }

    #[test]
    fn test_nest_count_tracks_owner() {
        let lock = Lock::new();
        let semset = SemSet::create().unwrap();
        lock.try_acquire(1);
        lock.try_acquire(1);
        lock.release(1, &semset).unwrap();
        assert_eq!(lock.owner_slot(), 1);
        lock.release(1, &semset).unwrap();
        assert_eq!(lock.owner_slot(), -1);
        semset.destroy();
    }

    #[test]
    fn test_round_robin_wakeup_order() {
        let lock = Lock::new();
        let semset = SemSet::create().unwrap();
        lock.try_acquire(0);
        {
            let _g = lock.spinlock.lock();
            lock.waiters.set(5, Ordering::Relaxed);
            lock.waiters.set(2, Ordering::Relaxed);
        }
        lock.cursor.store(3, Ordering::Relaxed);
        lock.release(0, &semset).unwrap();
        // cursor started at 3: the next set bit at/after 3 is 5, not 2.
        semset.down(5).unwrap();
        semset.destroy();
    }
}
