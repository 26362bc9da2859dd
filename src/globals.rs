//! The root record: participant table, region registry, sleep table.
//!
//! `Globals` lives in its own region, created by whichever participant
//! calls [`globals_init`] first; every descendant inherits the mapping at
//! duplication and thus sees it at the same address. Unlike every other
//! shared structure in this crate, `Globals` is *not* reached through the
//! handle layer — it is the one region each participant attaches
//! directly, by address, since the handle layer's own region table lives
//! inside it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::error::{ProcshareError, Result};
use crate::handle::Handle;
use crate::options::MAX_PROCESSES;
use crate::options::MAX_REGIONS;
use crate::region::{self, RegionHandle};
use crate::sync::lock::Lock;
use crate::sync::semset::SemSet;
use crate::sync::spinlock::Spinlock;
use crate::util::address::Address;

#[repr(C)]
struct ProcTable {
    spinlock: Spinlock,
    slots: [AtomicI32; MAX_PROCESSES],
}

impl ProcTable {
    fn init(&self) {
        let _g = self.spinlock.lock();
        for slot in self.slots.iter() {
            slot.store(-1, Ordering::Relaxed);
        }
    }

    fn get_or_assign(&self, pid: i32) -> Result<i32> {
        let _g = self.spinlock.lock();
        let mut free: Option<usize> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let v = slot.load(Ordering::Relaxed);
            if v == pid {
                return Ok(i as i32);
            }
            if v == -1 && free.is_none() {
                free = Some(i);
            }
        }
        match free {
            Some(i) => {
                self.slots[i].store(pid, Ordering::Relaxed);
                Ok(i as i32)
            }
            None => Err(ProcshareError::TooManyParticipants),
        }
    }

    /// Clears `pid`'s row. Returns `true` if no rows remain used.
    fn free(&self, pid: i32) -> bool {
        let _g = self.spinlock.lock();
        let mut any_used = false;
        for slot in self.slots.iter() {
            let v = slot.load(Ordering::Relaxed);
            if v == pid {
                slot.store(-1, Ordering::Relaxed);
            } else if v != -1 {
                any_used = true;
            }
        }
        !any_used
    }
}

#[repr(C)]
struct RegionTable {
    lock: Lock,
    count: std::cell::UnsafeCell<i32>,
    free_hint: std::cell::UnsafeCell<i32>,
    rows: [std::cell::UnsafeCell<RegionHandle>; MAX_REGIONS],
}

// SAFETY: `count`, `free_hint` and every row are only ever mutated while
// holding `lock`, the same discipline `SharedObjectHeader::srefcnt`
// follows under its own `reflock`.
unsafe impl Send for RegionTable {}
unsafe impl Sync for RegionTable {}

impl RegionTable {
    fn init(&mut self) {
        unsafe {
            *self.count.get() = 0;
            *self.free_hint.get() = 0;
            for row in self.rows.iter() {
                *row.get() = RegionHandle::NULL;
            }
        }
    }

    fn free_hint(&self) -> i32 {
        unsafe { *self.free_hint.get() }
    }

    fn row(&self, i: usize) -> RegionHandle {
        unsafe { *self.rows[i].get() }
    }
}

#[repr(C)]
struct SleepTable {
    semset: SemSet,
    waiting_on: [std::cell::UnsafeCell<Handle>; MAX_PROCESSES],
}

// SAFETY: slot `i` of `waiting_on` is only ever written by the
// participant occupying process-table slot `i`, so distinct slots never
// race; a diagnostic read of another slot may observe a torn value but
// never a dangling one, since `Handle` has no invalid bit pattern.
unsafe impl Send for SleepTable {}
unsafe impl Sync for SleepTable {}

/// The root record, allocated once per process tree in its own region.
#[repr(C)]
struct GlobalsRaw {
    my_region: i32,
    proctable: ProcTable,
    regtable: RegionTable,
    sleeptable: SleepTable,
}

struct GlobalsState {
    addr: Address,
    region: RegionHandle,
    region_index_in_process: Option<i32>,
}

lazy_static::lazy_static! {
    static ref GLOBALS: Mutex<Option<GlobalsState>> = Mutex::new(None);
}

thread_local! {
    static MY_SLOT: std::cell::Cell<i32> = std::cell::Cell::new(-1);
}

fn raw<'a>(state: &GlobalsState) -> &'a GlobalsRaw {
    unsafe { &*state.addr.to_ptr::<GlobalsRaw>() }
}

/// Called exactly once per process tree by the first participant; every
/// descendant instead inherits the mapping across `fork` and never calls
/// this again (it calls [`participant_attach`] instead, performed
/// implicitly by [`crate::participant::init`]).
pub fn globals_init() -> Result<()> {
    let mut guard = GLOBALS.lock().unwrap();
    if guard.is_some() {
        return Ok(());
    }
    let size = std::mem::size_of::<GlobalsRaw>();
    let region = region::region_new(size)?;
    let addr = region::region_attach(&region)?;
    unsafe {
        let raw_ptr = addr.to_mut_ptr::<GlobalsRaw>();
        std::ptr::write_bytes(raw_ptr, 0, 1);
        (*raw_ptr).my_region = -1;
        (*raw_ptr).proctable.init();
        (*raw_ptr).regtable.init();
        (*raw_ptr).sleeptable.semset = SemSet::create()?;
        for h in (*raw_ptr).sleeptable.waiting_on.iter_mut() {
            *h.get_mut() = Handle::NULL;
        }
    }
    *guard = Some(GlobalsState {
        addr,
        region,
        region_index_in_process: None,
    });
    log::debug!("globals_init: created globals region");
    Ok(())
}

/// Attaches an already-initialized `Globals` at the address and region
/// handle it was created at; used after `fork()` when inheriting the
/// mapping directly rather than recreating it (the common case), and by
/// `init_child` to reconfirm it.
pub fn globals_attach(region: RegionHandle, addr: Address) {
    let mut guard = GLOBALS.lock().unwrap();
    *guard = Some(GlobalsState {
        addr,
        region,
        region_index_in_process: None,
    });
}

/// Destroys every remaining region and the `Globals` region itself. Only
/// the last participant should call this (see
/// [`crate::participant::teardown`]).
pub fn globals_cleanup() {
    let mut guard = GLOBALS.lock().unwrap();
    if let Some(state) = guard.take() {
        let g = raw(&state);
        for i in 0..MAX_REGIONS {
            let row = g.regtable.row(i);
            if !row.is_null() {
                region::region_destroy(&row);
            }
        }
        g.sleeptable.semset.destroy();
        let _ = region::region_detach(state.addr, state.region.size);
        region::region_destroy(&state.region);
        log::debug!("globals_cleanup: destroyed globals and all regions");
    }
}

fn with_globals<R>(f: impl FnOnce(&GlobalsRaw) -> R) -> Result<R> {
    let guard = GLOBALS.lock().unwrap();
    match guard.as_ref() {
        Some(state) => Ok(f(raw(state))),
        None => Err(ProcshareError::AllocationFailed),
    }
}

/// Linear-scans the process table under its spinlock; returns the
/// existing slot for `pid` or assigns the lowest free one.
pub fn get_or_assign_slot(pid: i32) -> Result<i32> {
    let slot = with_globals(|g| g.proctable.get_or_assign(pid))??;
    MY_SLOT.with(|s| s.set(slot));
    Ok(slot)
}

/// Clears `pid`'s row. Returns `true` when no participant remains.
pub fn free_slot(pid: i32) -> Result<bool> {
    with_globals(|g| g.proctable.free(pid))
}

pub fn my_slot() -> i32 {
    MY_SLOT.with(|s| s.get())
}

/// Creates a region and registers it in `Globals::regtable`, returning
/// its region index for use in `Handle`s.
pub fn region_new(size: usize) -> Result<i32> {
    let region = region::region_new(size)?;
    with_globals(|g| {
        let semset = &g.sleeptable.semset;
        g.regtable.lock.acquire(my_slot(), semset, Handle::NULL)?;
        let result = (|| {
            let start = g.regtable.free_hint().max(0) as usize;
            for offset in 0..MAX_REGIONS {
                let i = (start + offset) % MAX_REGIONS;
                // SAFETY: every row, `count` and `free_hint` are only
                // mutated under regtable.lock, which we hold here.
                if g.regtable.row(i).is_null() {
                    unsafe {
                        *g.regtable.rows[i].get() = region;
                        *g.regtable.count.get() += 1;
                        *g.regtable.free_hint.get() = ((i + 1) % MAX_REGIONS) as i32;
                    }
                    return Ok(i as i32);
                }
            }
            Err(ProcshareError::TooManyRegions)
        })();
        g.regtable.lock.release(my_slot(), semset)?;
        result
    })?
}

/// Looks up the region handle registered under `index`.
pub fn region_handle(index: i32) -> Result<RegionHandle> {
    with_globals(|g| {
        if index < 0 || index as usize >= MAX_REGIONS {
            return Err(ProcshareError::ReverseMappingFailed);
        }
        let row = g.regtable.row(index as usize);
        if row.is_null() {
            Err(ProcshareError::ReverseMappingFailed)
        } else {
            Ok(row)
        }
    })?
}

/// Destroys the region registered under `index` and clears its row.
pub fn region_destroy(index: i32) -> Result<()> {
    with_globals(|g| {
        if index < 0 || index as usize >= MAX_REGIONS {
            return Ok(());
        }
        let semset = &g.sleeptable.semset;
        g.regtable.lock.acquire(my_slot(), semset, Handle::NULL)?;
        let row = g.regtable.row(index as usize);
        if !row.is_null() {
            region::region_destroy(&row);
            // SAFETY: protected by regtable.lock, held above.
            unsafe {
                *g.regtable.rows[index as usize].get() = RegionHandle::NULL;
                *g.regtable.count.get() -= 1;
            }
        }
        g.regtable.lock.release(my_slot(), semset)?;
        crate::handle::forget_region(index);
        Ok(())
    })?
}

/// The global `SemSet` every `Lock` in the system blocks on.
pub fn semset() -> Result<&'static SemSet> {
    let guard = GLOBALS.lock().unwrap();
    match guard.as_ref() {
        Some(state) => {
            let g = raw(state);
            Ok(unsafe { &*(&g.sleeptable.semset as *const SemSet) })
        }
        None => Err(ProcshareError::AllocationFailed),
    }
}

/// Records in the sleep table that process-table slot `self_slot` is
/// about to block waiting on `handle` (the lock's own address, per
/// spec.md §4.5). Called by [`crate::sync::lock::Lock::acquire`] right
/// before it sleeps on the `SemSet`. Best-effort: if `Globals` isn't
/// initialized (e.g. a `Lock` exercised standalone in a unit test) this
/// silently does nothing, since the sleep table is a diagnostic aid, not
/// load-bearing for correctness.
pub fn mark_waiting(self_slot: i32, handle: Handle) {
    let _ = with_globals(|g| {
        if self_slot >= 0 && (self_slot as usize) < MAX_PROCESSES {
            unsafe {
                *g.sleeptable.waiting_on[self_slot as usize].get() = handle;
            }
        }
    });
}

/// Clears slot `self_slot`'s sleep-table entry; called once a blocked
/// `acquire` succeeds.
pub fn clear_waiting(self_slot: i32) {
    mark_waiting(self_slot, Handle::NULL);
}

/// What process-table slot `slot` is currently blocked waiting on, or
/// `Handle::NULL` if it isn't blocked (or `Globals` isn't initialized).
pub fn waiting_on(slot: i32) -> Handle {
    if slot < 0 || slot as usize >= MAX_PROCESSES {
        return Handle::NULL;
    }
    with_globals(|g| unsafe { *g.sleeptable.waiting_on[slot as usize].get() }).unwrap_or(Handle::NULL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_assignment_is_idempotent() {
        globals_init().unwrap();
        let s1 = get_or_assign_slot(4242).unwrap();
        let s2 = get_or_assign_slot(4242).unwrap();
        assert_eq!(s1, s2);
        assert!(free_slot(4242).unwrap());
    }

    #[test]
    fn test_region_new_and_destroy_round_trip() {
        globals_init().unwrap();
        let idx = region_new(256).unwrap();
        let rh = region_handle(idx).unwrap();
        assert!(rh.size >= 256);
        region_destroy(idx).unwrap();
        assert!(region_handle(idx).is_err());
    }

    #[test]
    fn test_mark_and_clear_waiting() {
        globals_init().unwrap();
        let slot = get_or_assign_slot(4343).unwrap();
        let h = Handle {
            region: 7,
            offset: 11,
        };
        assert_eq!(waiting_on(slot), Handle::NULL);
        mark_waiting(slot, h);
        assert_eq!(waiting_on(slot), h);
        clear_waiting(slot);
        assert_eq!(waiting_on(slot), Handle::NULL);
        free_slot(4343).unwrap();
    }
}
