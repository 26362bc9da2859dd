//! Per-participant handle to a shared object.
//!
//! A `Proxy` is the only thing embedders ever hold directly: it mediates
//! every access to its referent through a [`crate::monitor::Synchronizer`]
//! and keeps the referent's proxy bit set for as long as it's alive.
//! Proxies are cached per-referent in a process-wide weak map
//! (`registry::make_proxy`) so repeated lookups of the same shared object
//! return the same `Proxy` identity.

use std::sync::Weak;

use crate::containers::{dict, list, tuple};
use crate::error::{ProcshareError, Result};
use crate::handle::Handle;
use crate::object::{header_ptr, ObjectKind, SharedObjectHeader};
use crate::util::address::Address;
use crate::value::Value;

pub struct Proxy {
    referent: Handle,
    self_weak: Weak<Proxy>,
}

impl Proxy {
    pub(crate) fn new_with_self(referent: Handle, self_weak: Weak<Proxy>) -> Proxy {
        Proxy {
            referent,
            self_weak,
        }
    }

    pub fn referent(&self) -> Handle {
        self.referent
    }

    /// An opaque address token for this proxy's referent, suitable as a
    /// map key or for logging — not a usable pointer on its own.
    pub fn address_of(&self) -> usize {
        self.referent.region as usize * 0x1_0000_0000 + self.referent.offset as usize
    }

    fn header(&self) -> Result<&SharedObjectHeader> {
        Ok(unsafe { &*header_ptr(self.referent)? })
    }

    /// Runs `f` against the raw referent under the synchronizer's
    /// enter/leave bracket. Implements the error-dominance rule: an
    /// error from `f` is preserved even if `leave` itself also errors;
    /// `leave`'s error only surfaces when `f` succeeded.
    pub fn dispatch<R>(&self, op_name: &str, f: impl FnOnce(&SharedObjectHeader) -> Result<R>) -> Result<R> {
        let header = self.header()?;
        if header.is_corrupt() {
            return Err(ProcshareError::ObjectCorrupt);
        }
        let synchronizer = crate::registry::synchronizer_for(header.type_slot);
        let token = synchronizer.enter(self.referent, header, op_name)?;
        if header.is_corrupt() {
            let _ = synchronizer.leave(header, token);
            return Err(ProcshareError::ObjectCorrupt);
        }
        let result = f(header);
        let leave_result = synchronizer.leave(header, token);
        match result {
            Ok(v) => {
                leave_result?;
                Ok(v)
            }
            Err(e) => {
                if leave_result.is_err() {
                    log::debug!("leave error swallowed behind pending enter/op error");
                }
                Err(e)
            }
        }
    }

    /// A `header`'s raw address, as the container free functions
    /// (`containers::dict::*`, `list::*`, `tuple::*`) expect it: the
    /// header sits at the front of every container's `Raw` layout, so
    /// its own address is the container's address.
    fn raw_addr(header: &SharedObjectHeader) -> Address {
        Address::from_ptr(header as *const SharedObjectHeader)
    }

    pub fn kind(&self) -> Result<ObjectKind> {
        Ok(self.header()?.kind)
    }

    // --- dict ---

    pub fn dict_length(&self) -> Result<u32> {
        self.dispatch("__len__", |h| Ok(dict::length(Self::raw_addr(h))))
    }

    pub fn dict_contains(&self, key: &Value) -> Result<bool> {
        self.dispatch("__contains__", |h| dict::contains(Self::raw_addr(h), key))
    }

    pub fn dict_get(&self, key: &Value) -> Result<Value> {
        self.dispatch("__getitem__", |h| dict::subscript(Self::raw_addr(h), key))
    }

    pub fn dict_set(&self, key: Value, value: Value) -> Result<()> {
        self.dispatch("__setitem__", |h| dict::assign(Self::raw_addr(h), key, value))
    }

    pub fn dict_del(&self, key: &Value) -> Result<()> {
        self.dispatch("__delitem__", |h| dict::delitem(Self::raw_addr(h), key))
    }

    pub fn dict_keys(&self) -> Result<Vec<Value>> {
        self.dispatch("keys", |h| dict::keys(Self::raw_addr(h)))
    }

    pub fn dict_values(&self) -> Result<Vec<Value>> {
        self.dispatch("values", |h| dict::values(Self::raw_addr(h)))
    }

    pub fn dict_items(&self) -> Result<Vec<(Value, Value)>> {
        self.dispatch("items", |h| dict::items(Self::raw_addr(h)))
    }

    pub fn dict_popitem(&self) -> Result<(Value, Value)> {
        self.dispatch("popitem", |h| dict::popitem(Self::raw_addr(h)))
    }

    pub fn dict_clear(&self) -> Result<()> {
        self.dispatch("clear", |h| dict::clear(Self::raw_addr(h)))
    }

    pub fn dict_copy(&self) -> Result<Vec<(Value, Value)>> {
        self.dispatch("copy", |h| dict::copy(Self::raw_addr(h)))
    }

    /// Iterates `other`'s keys under `other`'s own enter/leave bracket,
    /// then assigns each into `self` under `self`'s.
    pub fn dict_update(&self, other: &Proxy) -> Result<()> {
        let snapshot = other.dispatch("items", |h| dict::items(Self::raw_addr(h)))?;
        self.dispatch("update", |h| {
            for (k, v) in snapshot.iter().cloned() {
                dict::assign(Self::raw_addr(h), k, v)?;
            }
            Ok(())
        })
    }

    // --- list ---

    pub fn list_length(&self) -> Result<u32> {
        self.dispatch("__len__", |h| Ok(list::length(Self::raw_addr(h))))
    }

    pub fn list_get(&self, index: usize) -> Result<Value> {
        self.dispatch("__getitem__", |h| list::item(Self::raw_addr(h), index))
    }

    pub fn list_set(&self, index: usize, value: Value) -> Result<()> {
        self.dispatch("__setitem__", |h| list::ass_item(Self::raw_addr(h), index, value))
    }

    pub fn list_append(&self, value: Value) -> Result<()> {
        self.dispatch("append", |h| list::append(Self::raw_addr(h), value))
    }

    pub fn list_insert(&self, index: usize, value: Value) -> Result<()> {
        self.dispatch("insert", |h| list::insert(Self::raw_addr(h), index, value))
    }

    pub fn list_pop(&self, index: usize) -> Result<Value> {
        self.dispatch("pop", |h| list::pop(Self::raw_addr(h), index))
    }

    pub fn list_remove(&self, value: &Value) -> Result<()> {
        self.dispatch("remove", |h| list::remove(Self::raw_addr(h), value))
    }

    // --- tuple ---

    pub fn tuple_length(&self) -> Result<u32> {
        self.dispatch("__len__", |h| Ok(tuple::length(Self::raw_addr(h))))
    }

    pub fn tuple_get(&self, index: usize) -> Result<Value> {
        self.dispatch("__getitem__", |h| tuple::item(Self::raw_addr(h), index))
    }

    // --- kind-dispatched, every container implements these ---

    pub fn repr(&self) -> Result<String> {
        self.dispatch("__repr__", |h| match h.kind {
            ObjectKind::Dict => dict::repr(Self::raw_addr(h)),
            ObjectKind::List => list::repr(Self::raw_addr(h)),
            ObjectKind::Tuple => crate::containers::tuple_repr(Self::raw_addr(h)),
        })
    }

    pub fn hash(&self) -> Result<i64> {
        self.dispatch("__hash__", |h| match h.kind {
            ObjectKind::Dict => dict::hash(Self::raw_addr(h)),
            ObjectKind::List => Err(ProcshareError::Unhashable),
            ObjectKind::Tuple => Ok(tuple::hash(Self::raw_addr(h))),
        })
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Ok(ptr) = header_ptr(self.referent) {
            let header = unsafe { &*ptr };
            let slot = crate::globals::my_slot();
            if let Err(e) = header.clear_proxy_bit(slot) {
                log::warn!("clear_proxy_bit failed while dropping proxy: {e}");
            }
        }
        crate::registry::evict_proxy(self.referent, &self.self_weak);
    }
}
