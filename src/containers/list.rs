//! Vector-backed mutable list of value handles.
//!
//! Grounded in `original_source/SharedListAndTuple.c`'s `vector_init` /
//! `list_resize` / `ass_item`: capacity grows by 1.5x, never shrinks
//! while non-empty, and frees the backing vector entirely once the list
//! is emptied.

use crate::containers::slot::ValueSlot;
use crate::error::{ProcshareError, Result};
use crate::handle::{self, Handle};
use crate::object::{self, ObjectKind, SharedObjectHeader};
use crate::util::address::Address;
use crate::value::Value;

#[repr(C)]
pub struct Raw {
    header: SharedObjectHeader,
    vector: Handle,
    size: u32,
    capacity: u32,
}

fn raw_ptr(addr: Address) -> *mut Raw {
    addr.to_mut_ptr::<Raw>()
}

fn slots(raw: &Raw) -> Result<*mut ValueSlot> {
    if raw.vector.is_null() {
        return Ok(std::ptr::null_mut());
    }
    Ok(handle::handle_to_pointer(raw.vector)?.to_mut_ptr::<ValueSlot>())
}

/// Creates an empty shared list.
pub fn create(type_slot: u32) -> Result<Handle> {
    let heaps = crate::registry::heaps_for(type_slot);
    let (addr, _) = heaps.alloc_instance(std::mem::size_of::<Raw>())?;
    let ptr = raw_ptr(addr);
    unsafe {
        std::ptr::write(
            &mut (*ptr).header,
            SharedObjectHeader::init(ObjectKind::List, type_slot, false),
        );
        (*ptr).vector = Handle::NULL;
        (*ptr).size = 0;
        (*ptr).capacity = 0;
    }
    handle::pointer_to_handle(addr)
}

/// Constructs a shared list from an iterator, sharing each element in
/// order.
pub fn create_from<I: IntoIterator<Item = Value>>(type_slot: u32, items: I) -> Result<Handle> {
    let handle = create(type_slot)?;
    let addr = handle::handle_to_pointer(handle)?;
    for item in items {
        append(addr, item)?;
    }
    Ok(handle)
}

pub(crate) fn deinit_raw(addr: Address) -> Result<()> {
    let ptr = raw_ptr(addr);
    let raw = unsafe { &*ptr };
    if !raw.vector.is_null() {
        let slots_ptr = slots(raw)?;
        for i in 0..raw.size as usize {
            let s = unsafe { *slots_ptr.add(i) };
            object::decref_handle(s.handle).ok();
        }
        let heaps = crate::registry::heaps_for(raw.header.type_slot);
        heaps.free_data(handle::handle_to_pointer(raw.vector)?)?;
    }
    Ok(())
}

pub fn length(raw_addr: Address) -> u32 {
    unsafe { (*raw_ptr(raw_addr)).size }
}

pub fn item(raw_addr: Address, index: usize) -> Result<Value> {
    let raw = unsafe { &*raw_ptr(raw_addr) };
    if index >= raw.size as usize {
        return Err(ProcshareError::IndexOutOfRange);
    }
    let slots_ptr = slots(raw)?;
    Ok(unsafe { (*slots_ptr.add(index)).to_value() })
}

/// Replaces the value at `index`, increfing the new value and decrefing
/// the old one.
pub fn ass_item(raw_addr: Address, index: usize, value: Value) -> Result<()> {
    let raw = unsafe { &*raw_ptr(raw_addr) };
    if index >= raw.size as usize {
        return Err(ProcshareError::IndexOutOfRange);
    }
    let slots_ptr = slots(raw)?;
    let new_slot = ValueSlot::from_value(&value)?;
    let old = unsafe { *slots_ptr.add(index) };
    if let Value::Shared(h) = &value {
        object::incref_handle(*h)?;
    }
    unsafe {
        *slots_ptr.add(index) = new_slot;
    }
    object::decref_handle(old.handle)
}

fn grown_capacity(current_cap: u32, new_size: u32) -> u32 {
    let target = ((new_size as f64) * 1.5).ceil() as u32;
    current_cap.max(target).max(new_size)
}

/// Resizes the backing vector to hold exactly `new_size` live elements,
/// growing the underlying allocation (by the 1.5x policy) only when
/// `new_size` exceeds the current capacity, and freeing the vector
/// entirely once `new_size` reaches zero.
pub fn resize(raw_addr: Address, new_size: usize) -> Result<()> {
    let ptr = raw_ptr(raw_addr);
    let (old_size, old_capacity, old_vector) = unsafe { ((*ptr).size, (*ptr).capacity, (*ptr).vector) };
    let new_size = new_size as u32;

    if new_size == 0 {
        if !old_vector.is_null() {
            let slots_ptr = slots(unsafe { &*ptr })?;
            for i in 0..old_size as usize {
                let s = unsafe { *slots_ptr.add(i) };
                object::decref_handle(s.handle)?;
            }
            let heaps = unsafe { crate::registry::heaps_for((*ptr).header.type_slot) };
            heaps.free_data(handle::handle_to_pointer(old_vector)?)?;
            unsafe {
                (*ptr).vector = Handle::NULL;
                (*ptr).capacity = 0;
            }
        }
        unsafe {
            (*ptr).size = 0;
        }
        return Ok(());
    }

    if new_size > old_capacity {
        let new_capacity = grown_capacity(old_capacity, new_size);
        let heaps = unsafe { crate::registry::heaps_for((*ptr).header.type_slot) };
        let bytes = new_capacity as usize * std::mem::size_of::<ValueSlot>();
        let (new_addr, _) = heaps.alloc_data(bytes)?;
        unsafe {
            std::ptr::write_bytes(new_addr.to_mut_ptr::<u8>(), 0, bytes);
            if !old_vector.is_null() {
                let old_ptr = handle::handle_to_pointer(old_vector)?.to_ptr::<ValueSlot>();
                std::ptr::copy_nonoverlapping(
                    old_ptr,
                    new_addr.to_mut_ptr::<ValueSlot>(),
                    old_size as usize,
                );
                heaps.free_data(handle::handle_to_pointer(old_vector)?)?;
            }
            (*ptr).vector = handle::pointer_to_handle(new_addr)?;
            (*ptr).capacity = new_capacity;
        }
    } else if new_size < old_size {
        // Shrinking within the existing allocation: decref the elements
        // that fall off the end, never shrink the backing allocation
        // itself while the list stays non-empty.
        let slots_ptr = slots(unsafe { &*ptr })?;
        for i in new_size as usize..old_size as usize {
            let s = unsafe { *slots_ptr.add(i) };
            object::decref_handle(s.handle)?;
            unsafe {
                *slots_ptr.add(i) = ValueSlot::EMPTY;
            }
        }
    }

    unsafe {
        (*ptr).size = new_size;
    }
    Ok(())
}

pub fn append(raw_addr: Address, value: Value) -> Result<()> {
    let old_size = unsafe { (*raw_ptr(raw_addr)).size } as usize;
    resize(raw_addr, old_size + 1)?;
    ass_item(raw_addr, old_size, value)
}

/// Inserts `value` at `index`, shifting every later element up by one.
pub fn insert(raw_addr: Address, index: usize, value: Value) -> Result<()> {
    let old_size = unsafe { (*raw_ptr(raw_addr)).size } as usize;
    let index = index.min(old_size);
    resize(raw_addr, old_size + 1)?;
    let slots_ptr = slots(unsafe { &*raw_ptr(raw_addr) })?;
    unsafe {
        std::ptr::copy(
            slots_ptr.add(index),
            slots_ptr.add(index + 1),
            old_size - index,
        );
        *slots_ptr.add(index) = ValueSlot::EMPTY;
    }
    ass_item(raw_addr, index, value)
}

/// Removes and returns the element at `index`, shifting every later
/// element down by one.
pub fn pop(raw_addr: Address, index: usize) -> Result<Value> {
    let old_size = unsafe { (*raw_ptr(raw_addr)).size } as usize;
    if index >= old_size {
        return Err(ProcshareError::IndexOutOfRange);
    }
    let slots_ptr = slots(unsafe { &*raw_ptr(raw_addr) })?;
    let removed = unsafe { *slots_ptr.add(index) };
    object::decref_handle(removed.handle)?;
    unsafe {
        std::ptr::copy(
            slots_ptr.add(index + 1),
            slots_ptr.add(index),
            old_size - index - 1,
        );
    }
    resize(raw_addr, old_size - 1)?;
    Ok(removed.to_value())
}

/// Removes the first occurrence of a value equal to `value`.
pub fn remove(raw_addr: Address, value: &Value) -> Result<()> {
    let size = length(raw_addr) as usize;
    for i in 0..size {
        if item(raw_addr, i)?.shallow_eq(value) {
            pop(raw_addr, i)?;
            return Ok(());
        }
    }
    Err(ProcshareError::NoSuchKey)
}

/// `"[v1, v2]"`, reentrancy-guarded: a list that (transitively) contains
/// itself reprs as `"[...]"` at the point of recursion.
pub fn repr(raw_addr: Address) -> Result<String> {
    let handle = handle::pointer_to_handle(raw_addr)?;
    crate::containers::guarded_repr(handle, "[...]", || {
        let len = length(raw_addr) as usize;
        let mut parts = Vec::with_capacity(len);
        for i in 0..len {
            parts.push(crate::containers::repr_value(&item(raw_addr, i)?)?);
        }
        Ok(format!("[{}]", parts.join(", ")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grown_capacity_policy() {
        assert_eq!(grown_capacity(0, 1), 2);
        assert_eq!(grown_capacity(4, 5), 8);
        assert_eq!(grown_capacity(10, 5), 10);
    }
}
