//! Type registration, object deallocation dispatch, and the per-process
//! proxy map.
//!
//! A process-wide registry replaces the original's meta-type attribute
//! lookups: each registered type contributes an [`ObjectKind`], a heap
//! pair, and a [`crate::monitor::Synchronizer`], keyed by a small integer
//! slot rather than a runtime type object. Registration is expected to
//! happen identically (same types, same order) in every participant
//! before the first `fork`, so `type_slot`s stored in shared object
//! headers mean the same thing in every process — this crate does not
//! attempt to reconcile registries that diverge across participants.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ProcshareError, Result};
use crate::handle::Handle;
use crate::heap::alloc_bridge::HeapPair;
use crate::monitor::{Monitor, Synchronizer};
use crate::object::{ObjectKind, SharedObjectHeader};
use crate::proxy::Proxy;
use crate::util::address::Address;

pub struct TypeEntry {
    pub kind: ObjectKind,
    pub heaps: HeapPair,
    pub synchronizer: Arc<dyn Synchronizer>,
}

struct Registry {
    entries: Vec<TypeEntry>,
    by_type: HashMap<TypeId, u32>,
}

lazy_static::lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        entries: Vec::new(),
        by_type: HashMap::new(),
    });
    static ref PROXY_MAP: Mutex<HashMap<Handle, std::sync::Weak<Proxy>>> = Mutex::new(HashMap::new());
}

/// Installs a shareability entry for `T`. Uses the default [`Monitor`]
/// synchronizer unless `synchronizer` is given. Calling this twice for
/// the same `T` is an error: re-registration would change the meaning of
/// `type_slot`s already written into existing shared objects.
pub fn register_type<T: 'static>(kind: ObjectKind, synchronizer: Option<Arc<dyn Synchronizer>>) -> Result<u32> {
    let type_id = TypeId::of::<T>();
    let mut reg = REGISTRY.lock().unwrap();
    if let Some(&slot) = reg.by_type.get(&type_id) {
        return Ok(slot);
    }
    let heaps = HeapPair::create()?;
    let synchronizer = synchronizer.unwrap_or_else(|| Arc::new(Monitor));
    let slot = reg.entries.len() as u32;
    reg.entries.push(TypeEntry {
        kind,
        heaps,
        synchronizer,
    });
    reg.by_type.insert(type_id, slot);
    Ok(slot)
}

/// Looks up a type's registry slot. Fails with `NotShareable` if the
/// type was never registered — this crate's hard-error treatment of a
/// missing synchronization manager (see the crate's design notes).
pub fn slot_for<T: 'static>() -> Result<u32> {
    let type_id = TypeId::of::<T>();
    let reg = REGISTRY.lock().unwrap();
    reg.by_type.get(&type_id).copied().ok_or(ProcshareError::NotShareable)
}

fn with_entry<R>(slot: u32, f: impl FnOnce(&TypeEntry) -> R) -> R {
    let reg = REGISTRY.lock().unwrap();
    f(&reg.entries[slot as usize])
}

pub fn heaps_for(slot: u32) -> HeapPair {
    with_entry(slot, |e| e.heaps.clone())
}

pub fn synchronizer_for(slot: u32) -> Arc<dyn Synchronizer> {
    with_entry(slot, |e| e.synchronizer.clone())
}

/// Deallocates a shared object whose refcount pair has both reached
/// zero. Dispatches on `header.kind` to the container-specific deinit
/// (which decrefs element handles) before returning the block to the
/// owning type's instance heap.
pub fn free_object(header: &SharedObjectHeader) -> Result<()> {
    let addr = Address::from_ptr(header as *const SharedObjectHeader);
    match header.kind {
        ObjectKind::Dict => crate::containers::dict::deinit_raw(addr)?,
        ObjectKind::List => crate::containers::list::deinit_raw(addr)?,
        ObjectKind::Tuple => crate::containers::tuple::deinit_raw(addr)?,
    }
    let heaps = heaps_for(header.type_slot);
    heaps.free_instance(addr)
}

/// Looks up or creates a proxy for `shared`, mirroring `make_proxy`. The
/// map holds weak references so a proxy with no outstanding owner is
/// collected as soon as its last `Arc<Proxy>` drops; a stale weak entry
/// is silently replaced.
pub fn make_proxy(shared: Handle) -> Result<Arc<Proxy>> {
    let mut map = PROXY_MAP.lock().unwrap();
    if let Some(weak) = map.get(&shared) {
        if let Some(proxy) = weak.upgrade() {
            return Ok(proxy);
        }
    }
    let header = crate::object::header_ptr(shared)?;
    unsafe { (*header).set_proxy_bit(crate::globals::my_slot()) };
    let proxy = Arc::new_cyclic(|weak| Proxy::new_with_self(shared, weak.clone()));
    map.insert(shared, Arc::downgrade(&proxy));
    Ok(proxy)
}

/// Removes `shared`'s entry from the proxy map if it is still the one
/// pointing at `expected` (a sanity check against a newer proxy having
/// replaced it between the `Drop` firing and this call taking the lock).
pub(crate) fn evict_proxy(shared: Handle, expected: &std::sync::Weak<Proxy>) {
    let mut map = PROXY_MAP.lock().unwrap();
    if let Some(existing) = map.get(&shared) {
        if existing.ptr_eq(expected) {
            map.remove(&shared);
        }
    }
}

/// Walks every live proxy and re-sets its referent's proxy bit for this
/// participant. Run once per child right after a process duplication:
/// the child inherited every `Proxy` value but none of the bits they
/// represent (the bitmap itself is shared memory and was a snapshot of
/// the parent's participant set at fork time).
pub fn resync_proxy_bits_after_fork() -> Result<()> {
    let map = PROXY_MAP.lock().unwrap();
    let slot = crate::globals::my_slot();
    for (handle, weak) in map.iter() {
        if weak.upgrade().is_some() {
            let ptr = crate::object::header_ptr(*handle)?;
            unsafe { (*ptr).set_proxy_bit(slot) };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[test]
    fn test_register_type_is_idempotent() {
        let s1 = register_type::<Dummy>(ObjectKind::Tuple, None).unwrap();
        let s2 = register_type::<Dummy>(ObjectKind::Tuple, None).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_slot_for_unregistered_fails() {
        struct NeverRegistered;
        assert!(matches!(
            slot_for::<NeverRegistered>(),
            Err(ProcshareError::NotShareable)
        ));
    }
}
