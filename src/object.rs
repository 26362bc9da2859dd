//! The header every shared container carries ahead of its payload.
//!
//! Conceptually this is "prepended to the host runtime's object header"
//! in the original design; since this crate defines its own payloads
//! instead of inheriting a host object model, the header is simply the
//! first field of each container's raw struct (`containers::dict::Raw`,
//! `containers::list::Raw`, `containers::tuple::Raw`). A `kind` tag
//! replaces dynamic dispatch over the three container types so `decref`
//! can find and run the right deinitializer without a vtable.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::handle::Handle;
use crate::sync::bitmap::Bitmap;
use crate::sync::lock::Lock;
use crate::sync::spinlock::Spinlock;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ObjectKind {
    Dict = 0,
    List = 1,
    Tuple = 2,
}

/// Per-object metadata prepended to every shared container's payload.
#[repr(C)]
pub struct SharedObjectHeader {
    pub kind: ObjectKind,
    /// Index into the process-wide type registry, used by `decref`'s
    /// final destruction step to find the owning type's instance heap.
    pub type_slot: u32,
    /// Set by the registered type at construction time; `enter` takes no
    /// lock at all when this is set, mirroring a meta-type opting out of
    /// synchronization entirely.
    pub no_synch: bool,
    is_corrupt: AtomicBool,
    pub lock: Lock,
    /// Optional handle to an auxiliary shared dict of attributes.
    pub dict_handle: Handle,
    reflock: Spinlock,
    srefcnt: std::cell::UnsafeCell<u32>,
    proxy_bitmap: Bitmap,
}

// SAFETY: every field that isn't already atomic is protected by `reflock`
// (srefcnt, and the bitmap's bit-level mutations are individually atomic
// and only ever combined with srefcnt under reflock for the dealloc
// test). The struct is designed to live in memory shared across OS
// processes, which is a stronger requirement than ordinary thread safety.
unsafe impl Send for SharedObjectHeader {}
unsafe impl Sync for SharedObjectHeader {}

impl SharedObjectHeader {
    pub fn init(kind: ObjectKind, type_slot: u32, no_synch: bool) -> SharedObjectHeader {
        SharedObjectHeader {
            kind,
            type_slot,
            no_synch,
            is_corrupt: AtomicBool::new(false),
            lock: Lock::new(),
            dict_handle: Handle::NULL,
            reflock: Spinlock::new(),
            srefcnt: std::cell::UnsafeCell::new(0),
            proxy_bitmap: Bitmap::new(),
        }
    }

    pub fn is_corrupt(&self) -> bool {
        self.is_corrupt.load(Ordering::Acquire)
    }

    pub fn mark_corrupt(&self) {
        self.is_corrupt.store(true, Ordering::Release);
    }

    fn dealloc_test(&self) -> bool {
        // SAFETY: called only while `reflock` is held.
        let srefcnt = unsafe { *self.srefcnt.get() };
        srefcnt == 0 && self.proxy_bitmap.is_all_zero(Ordering::Relaxed)
    }

    /// Increments the shared reference count. Called whenever another
    /// shared object stores a handle to this one.
    pub fn incref(&self) {
        let _g = self.reflock.lock();
        unsafe {
            *self.srefcnt.get() += 1;
        }
    }

    /// Decrements the shared reference count and, if this was the last
    /// reference of any kind (shared or proxy), destroys the object. The
    /// caller must not touch `self` again once this returns `Ok(true)`.
    pub fn decref(&self) -> Result<bool> {
        let should_dealloc = {
            let _g = self.reflock.lock();
            unsafe {
                debug_assert!(*self.srefcnt.get() > 0);
                *self.srefcnt.get() -= 1;
            }
            self.dealloc_test()
        };
        if should_dealloc {
            self.destroy()?;
        }
        Ok(should_dealloc)
    }

    /// Sets this participant's proxy bit, marking that at least one proxy
    /// for this object is currently live in this process.
    pub fn set_proxy_bit(&self, slot: i32) {
        let _g = self.reflock.lock();
        self.proxy_bitmap.set(slot as usize, Ordering::Relaxed);
    }

    /// Clears this participant's proxy bit. If this drops the object to
    /// fully unreferenced, destroys it.
    pub fn clear_proxy_bit(&self, slot: i32) -> Result<bool> {
        let should_dealloc = {
            let _g = self.reflock.lock();
            self.proxy_bitmap.clear(slot as usize, Ordering::Relaxed);
            self.dealloc_test()
        };
        if should_dealloc {
            self.destroy()?;
        }
        Ok(should_dealloc)
    }

    fn destroy(&self) -> Result<()> {
        if !self.dict_handle.is_null() {
            decref_handle(self.dict_handle)?;
        }
        crate::registry::free_object(self)
    }
}

/// Resolves a handle to a raw pointer at the header of the shared object
/// it names.
pub fn header_ptr(h: Handle) -> Result<*const SharedObjectHeader> {
    Ok(crate::handle::handle_to_pointer(h)?.to_ptr::<SharedObjectHeader>())
}

/// Dereferences a handle to another shared object and decrefs it,
/// deallocating transitively if that drops it to zero. Used by container
/// teardown (`dict`/`list`/`tuple` deinit) to release element handles.
pub fn decref_handle(h: Handle) -> Result<()> {
    if h.is_null() {
        return Ok(());
    }
    let ptr = crate::handle::handle_to_pointer(h)?.to_ptr::<SharedObjectHeader>();
    unsafe { (*ptr).decref() }?;
    Ok(())
}

pub fn incref_handle(h: Handle) -> Result<()> {
    if h.is_null() {
        return Ok(());
    }
    let ptr = crate::handle::handle_to_pointer(h)?.to_ptr::<SharedObjectHeader>();
    unsafe { (*ptr).incref() };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incref_decref_balance() {
        let header = SharedObjectHeader::init(ObjectKind::Tuple, 0, true);
        header.incref();
        header.incref();
        assert!(!unsafe { header.decref_for_test() });
        assert!(unsafe { header.decref_for_test() });
    }

    #[test]
    fn test_proxy_bit_and_refcnt_both_gate_dealloc() {
        let header = SharedObjectHeader::init(ObjectKind::Tuple, 0, true);
        header.incref();
        header.set_proxy_bit(1);
        assert!(!header.dealloc_test());
        unsafe {
            *header.srefcnt.get() -= 1;
        }
        assert!(!header.dealloc_test());
        header.proxy_bitmap.clear(1, Ordering::Relaxed);
        assert!(header.dealloc_test());
    }

    impl SharedObjectHeader {
        /// Test-only: runs the refcount half of `decref` without the
        /// registry-dependent destruction path, since unit tests here
        /// run without a live participant/registry.
        unsafe fn decref_for_test(&self) -> bool {
            let _g = self.reflock.lock();
            *self.srefcnt.get() -= 1;
            self.dealloc_test()
        }
    }
}
