//! Open-addressed hash map with tombstoned deletion.
//!
//! Grounded directly in `original_source/SharedDictBase.c`: same probe
//! sequence, same mutation-safe lookup (a comparison that runs arbitrary
//! code may resize or clear the very table being probed, so lookup
//! snapshots the table handle and the candidate entry's key handle and
//! restarts from scratch if either changed across the comparison), same
//! resize trigger.

use crate::containers::slot::{hash_value, ValueSlot};
use crate::error::{ProcshareError, Result};
use crate::handle::{self, Handle};
use crate::object::{self, ObjectKind, SharedObjectHeader};
use crate::util::address::Address;
use crate::value::Value;

const MIN_TABLE_SIZE: usize = 8;

#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum EntryState {
    Free = 0,
    InUse = 1,
    Deleted = 2,
}

#[repr(C)]
struct Entry {
    state: EntryState,
    hash: u64,
    key: ValueSlot,
    value: ValueSlot,
}

/// The raw, in-shared-memory layout of a shared dict: the
/// `SharedObjectHeader` first, then the dict's own fields. `table` is a
/// handle to a data-heap allocation holding `(mask+1)` `Entry`s.
#[repr(C)]
pub struct Raw {
    header: SharedObjectHeader,
    table: Handle,
    mask: u32,
    fill: u32,
    used: u32,
    /// Abuses `slot[0].hash` the way the original does for `popitem`'s
    /// scan position — kept here instead since this crate's `Entry` zero
    /// slot is not guaranteed to be the first physically probed slot
    /// anyway, and a dedicated field is clearer without changing the
    /// entry layout invariant.
    finger: u32,
}

enum ProbeOutcome {
    Equal,
    Unequal,
}

/// Creates a fresh, empty shared dict and returns a handle to it.
pub fn create(type_slot: u32) -> Result<Handle> {
    let heaps = crate::registry::heaps_for(type_slot);
    let (addr, _) = heaps.alloc_instance(std::mem::size_of::<Raw>())?;
    let ptr = addr.to_mut_ptr::<Raw>();
    unsafe {
        std::ptr::write(
            &mut (*ptr).header,
            SharedObjectHeader::init(ObjectKind::Dict, type_slot, false),
        );
        (*ptr).table = Handle::NULL;
        (*ptr).mask = 0;
        (*ptr).fill = 0;
        (*ptr).used = 0;
        (*ptr).finger = 0;
    }
    let handle = handle::pointer_to_handle(addr)?;
    alloc_table(ptr, MIN_TABLE_SIZE)?;
    Ok(handle)
}

fn alloc_table(ptr: *mut Raw, capacity: usize) -> Result<()> {
    let heaps = unsafe { crate::registry::heaps_for((*ptr).header.type_slot) };
    let bytes = capacity * std::mem::size_of::<Entry>();
    let (addr, _) = heaps.alloc_data(bytes)?;
    unsafe {
        std::ptr::write_bytes(addr.to_mut_ptr::<u8>(), 0, bytes);
        let table = handle::pointer_to_handle(addr)?;
        (*ptr).table = table;
        (*ptr).mask = (capacity - 1) as u32;
    }
    Ok(())
}

fn entries(raw: &Raw) -> Result<*mut Entry> {
    Ok(handle::handle_to_pointer(raw.table)?.to_mut_ptr::<Entry>())
}

fn raw_ptr(addr: Address) -> *mut Raw {
    addr.to_mut_ptr::<Raw>()
}

pub(crate) fn deinit_raw(addr: Address) -> Result<()> {
    let ptr = raw_ptr(addr);
    let raw = unsafe { &*ptr };
    let entries_ptr = entries(raw)?;
    for i in 0..=(raw.mask as usize) {
        let e = unsafe { &*entries_ptr.add(i) };
        if e.state == EntryState::InUse {
            object::decref_handle(e.key.handle).ok();
            object::decref_handle(e.value.handle).ok();
        }
    }
    let heaps = crate::registry::heaps_for(raw.header.type_slot);
    heaps.free_data(handle::handle_to_pointer(raw.table)?)
}

/// Core probe loop: returns the index of the slot the key belongs in
/// (either an `InUse` match, or the first `Free`/`Deleted` slot found —
/// callers distinguish by re-checking `state`), restarting from scratch
/// whenever a comparison observes the table itself changed underneath
/// it.
fn probe(raw_addr: Address, key: &Value, key_hash: u64) -> Result<usize> {
    'restart: loop {
        let raw = unsafe { &*raw_ptr(raw_addr) };
        let table_handle_snapshot = raw.table;
        let mask = raw.mask as usize;
        let entries_ptr = entries(raw)?;
        let mut perturb = key_hash;
        let mut i = (key_hash as usize) & mask;
        let mut first_free: Option<usize> = None;
        loop {
            let entry_ptr = unsafe { entries_ptr.add(i) };
            let (state, entry_hash, entry_key) =
                unsafe { ((*entry_ptr).state, (*entry_ptr).hash, (*entry_ptr).key) };
            match state {
                EntryState::Free => {
                    return Ok(first_free.unwrap_or(i));
                }
                EntryState::Deleted => {
                    if first_free.is_none() {
                        first_free = Some(i);
                    }
                }
                EntryState::InUse => {
                    if entry_hash == key_hash {
                        let outcome = compare_keys(&entry_key.to_value(), key);
                        // Mutation-safety recheck: a user comparison may
                        // have resized or reinserted into this table.
                        let raw_after = unsafe { &*raw_ptr(raw_addr) };
                        if raw_after.table != table_handle_snapshot {
                            continue 'restart;
                        }
                        let still_same_key = unsafe {
                            (*entries_ptr.add(i)).state == EntryState::InUse
                                && (*entries_ptr.add(i)).key.shallow_eq(&entry_key)
                        };
                        if !still_same_key {
                            continue 'restart;
                        }
                        if let ProbeOutcome::Equal = outcome {
                            return Ok(i);
                        }
                    }
                }
            }
            i = ((i << 2) + i + perturb as usize + 1) & mask;
            perturb >>= 5;
        }
    }
}

/// Any exception during comparison is swallowed in the original and
/// treated as "not equal"; this crate's `Value::shallow_eq` can't itself
/// fail, so `CompareError` never actually arises here, but the outcome
/// type is kept to mirror the original's three-way result.
fn compare_keys(a: &Value, b: &Value) -> ProbeOutcome {
    if a.shallow_eq(b) {
        ProbeOutcome::Equal
    } else {
        ProbeOutcome::Unequal
    }
}

pub fn length(raw_addr: Address) -> u32 {
    unsafe { (*raw_ptr(raw_addr)).used }
}

pub fn contains(raw_addr: Address, key: &Value) -> Result<bool> {
    let h = hash_value(key);
    let i = probe(raw_addr, key, h)?;
    let raw = unsafe { &*raw_ptr(raw_addr) };
    let entries_ptr = entries(raw)?;
    Ok(unsafe { (*entries_ptr.add(i)).state == EntryState::InUse })
}

pub fn subscript(raw_addr: Address, key: &Value) -> Result<Value> {
    let h = hash_value(key);
    let i = probe(raw_addr, key, h)?;
    let raw = unsafe { &*raw_ptr(raw_addr) };
    let entries_ptr = entries(raw)?;
    let entry = unsafe { &*entries_ptr.add(i) };
    if entry.state != EntryState::InUse {
        return Err(ProcshareError::NoSuchKey);
    }
    Ok(entry.value.to_value())
}

pub fn assign(raw_addr: Address, key: Value, value: Value) -> Result<()> {
    let key_hash = hash_value(&key);
    let i = probe(raw_addr, &key, key_hash)?;
    let raw = unsafe { &mut *raw_ptr(raw_addr) };
    let entries_ptr = entries(raw)?;
    let entry = unsafe { &mut *entries_ptr.add(i) };

    if entry.state == EntryState::InUse {
        let new_value_slot = ValueSlot::from_value(&value)?;
        let old_value_handle = entry.value.handle;
        entry.value = new_value_slot;
        if let Value::Shared(h) = &value {
            object::incref_handle(*h)?;
        }
        if !old_value_handle.is_null() {
            object::decref_handle(old_value_handle)?;
        }
        return Ok(());
    }

    // Encode both before mutating entry state: a `StringTooLong` failure
    // here must leave the slot exactly as it was found.
    let key_slot = ValueSlot::from_value(&key)?;
    let value_slot = ValueSlot::from_value(&value)?;
    let was_deleted = entry.state == EntryState::Deleted;
    entry.state = EntryState::InUse;
    entry.hash = key_hash;
    entry.key = key_slot;
    entry.value = value_slot;
    if let Value::Shared(h) = &key {
        object::incref_handle(*h)?;
    }
    if let Value::Shared(h) = &value {
        object::incref_handle(*h)?;
    }
    if !was_deleted {
        raw.fill += 1;
    }
    raw.used += 1;

    if (raw.fill as usize) * 3 >= (raw.mask as usize + 1) * 2 {
        resize(raw_addr, (raw.used as usize) * 2)?;
    }
    Ok(())
}

pub fn delitem(raw_addr: Address, key: &Value) -> Result<()> {
    let h = hash_value(key);
    let i = probe(raw_addr, key, h)?;
    let raw = unsafe { &mut *raw_ptr(raw_addr) };
    let entries_ptr = entries(raw)?;
    let entry = unsafe { &mut *entries_ptr.add(i) };
    if entry.state != EntryState::InUse {
        return Err(ProcshareError::NoSuchKey);
    }
    let key_handle = entry.key.handle;
    let value_handle = entry.value.handle;
    entry.state = EntryState::Deleted;
    entry.key = ValueSlot::EMPTY;
    entry.value = ValueSlot::EMPTY;
    raw.used -= 1;
    object::decref_handle(key_handle)?;
    object::decref_handle(value_handle)?;
    Ok(())
}

fn next_pow2_at_least(n: usize) -> usize {
    let mut size = MIN_TABLE_SIZE;
    while size < n {
        size <<= 1;
    }
    size
}

/// Reinserts every `InUse` entry into a fresh table of at least
/// `min_capacity` slots. Entries are reference-neutral: handles move,
/// refcounts don't change.
fn resize(raw_addr: Address, min_capacity: usize) -> Result<()> {
    let new_capacity = next_pow2_at_least(min_capacity.max(MIN_TABLE_SIZE));
    let old_table;
    let old_mask;
    {
        let raw = unsafe { &*raw_ptr(raw_addr) };
        old_table = raw.table;
        old_mask = raw.mask as usize;
    }
    let old_entries = handle::handle_to_pointer(old_table)?.to_ptr::<Entry>();

    {
        let ptr = raw_ptr(raw_addr);
        alloc_table(ptr, new_capacity)?;
        unsafe {
            (*ptr).fill = 0;
            (*ptr).used = 0;
        }
    }

    for i in 0..=old_mask {
        let e = unsafe { &*old_entries.add(i) };
        if e.state == EntryState::InUse {
            reinsert(raw_addr, e.hash, e.key, e.value)?;
        }
    }

    let heaps = unsafe { crate::registry::heaps_for((*raw_ptr(raw_addr)).header.type_slot) };
    heaps.free_data(handle::handle_to_pointer(old_table)?)
}

fn reinsert(raw_addr: Address, hash: u64, key: ValueSlot, value: ValueSlot) -> Result<()> {
    let raw = unsafe { &mut *raw_ptr(raw_addr) };
    let mask = raw.mask as usize;
    let entries_ptr = entries(raw)?;
    let mut perturb = hash;
    let mut i = (hash as usize) & mask;
    loop {
        let entry = unsafe { &mut *entries_ptr.add(i) };
        if entry.state == EntryState::Free {
            entry.state = EntryState::InUse;
            entry.hash = hash;
            entry.key = key;
            entry.value = value;
            raw.fill += 1;
            raw.used += 1;
            return Ok(());
        }
        i = ((i << 2) + i + perturb as usize + 1) & mask;
        perturb >>= 5;
    }
}

/// Materializes keys/values/items. Snapshots `used` before allocating the
/// result buffer; if a concurrent participant resized the dict mid
/// construction (detected by the table handle changing), retries from
/// scratch rather than returning a torn view.
pub fn keys(raw_addr: Address) -> Result<Vec<Value>> {
    loop {
        let (table_snapshot, mask, used) = {
            let raw = unsafe { &*raw_ptr(raw_addr) };
            (raw.table, raw.mask as usize, raw.used as usize)
        };
        let mut out = Vec::with_capacity(used);
        let entries_ptr = handle::handle_to_pointer(table_snapshot)?.to_ptr::<Entry>();
        for i in 0..=mask {
            let e = unsafe { &*entries_ptr.add(i) };
            if e.state == EntryState::InUse {
                out.push(e.key.to_value());
            }
        }
        let raw_now = unsafe { &*raw_ptr(raw_addr) };
        if raw_now.table == table_snapshot {
            return Ok(out);
        }
        // table was resized mid-scan; retry.
    }
}

pub fn values(raw_addr: Address) -> Result<Vec<Value>> {
    loop {
        let (table_snapshot, mask) = {
            let raw = unsafe { &*raw_ptr(raw_addr) };
            (raw.table, raw.mask as usize)
        };
        let mut out = Vec::new();
        let entries_ptr = handle::handle_to_pointer(table_snapshot)?.to_ptr::<Entry>();
        for i in 0..=mask {
            let e = unsafe { &*entries_ptr.add(i) };
            if e.state == EntryState::InUse {
                out.push(e.value.to_value());
            }
        }
        let raw_now = unsafe { &*raw_ptr(raw_addr) };
        if raw_now.table == table_snapshot {
            return Ok(out);
        }
    }
}

pub fn items(raw_addr: Address) -> Result<Vec<(Value, Value)>> {
    loop {
        let (table_snapshot, mask) = {
            let raw = unsafe { &*raw_ptr(raw_addr) };
            (raw.table, raw.mask as usize)
        };
        let mut out = Vec::new();
        let entries_ptr = handle::handle_to_pointer(table_snapshot)?.to_ptr::<Entry>();
        for i in 0..=mask {
            let e = unsafe { &*entries_ptr.add(i) };
            if e.state == EntryState::InUse {
                out.push((e.key.to_value(), e.value.to_value()));
            }
        }
        let raw_now = unsafe { &*raw_ptr(raw_addr) };
        if raw_now.table == table_snapshot {
            return Ok(out);
        }
    }
}

/// Removes and returns one `(key, value)` pair, scanning from a
/// persistent "finger" position so repeated `popitem` calls don't always
/// restart from slot zero.
pub fn popitem(raw_addr: Address) -> Result<(Value, Value)> {
    let raw = unsafe { &mut *raw_ptr(raw_addr) };
    if raw.used == 0 {
        return Err(ProcshareError::NoSuchKey);
    }
    let mask = raw.mask as usize;
    let entries_ptr = entries(raw)?;
    let start = raw.finger as usize & mask;
    for offset in 0..=mask {
        let i = (start + offset) & mask;
        let entry = unsafe { &mut *entries_ptr.add(i) };
        if entry.state == EntryState::InUse {
            let key = entry.key.to_value();
            let value = entry.value.to_value();
            entry.state = EntryState::Deleted;
            let key_handle = entry.key.handle;
            let value_handle = entry.value.handle;
            entry.key = ValueSlot::EMPTY;
            entry.value = ValueSlot::EMPTY;
            raw.used -= 1;
            raw.finger = ((i + 1) & mask) as u32;
            object::decref_handle(key_handle)?;
            object::decref_handle(value_handle)?;
            return Ok((key, value));
        }
    }
    Err(ProcshareError::HashTableCorrupt)
}

pub fn clear(raw_addr: Address) -> Result<()> {
    let old_table;
    {
        let raw = unsafe { &*raw_ptr(raw_addr) };
        old_table = raw.table;
    }
    let old_entries = handle::handle_to_pointer(old_table)?.to_ptr::<Entry>();
    let old_mask = unsafe { (*raw_ptr(raw_addr)).mask as usize };
    {
        let ptr = raw_ptr(raw_addr);
        alloc_table(ptr, MIN_TABLE_SIZE)?;
        unsafe {
            (*ptr).fill = 0;
            (*ptr).used = 0;
            (*ptr).finger = 0;
        }
    }
    for i in 0..=old_mask {
        let e = unsafe { &*old_entries.add(i) };
        if e.state == EntryState::InUse {
            object::decref_handle(e.key.handle).ok();
            object::decref_handle(e.value.handle).ok();
        }
    }
    let heaps = unsafe { crate::registry::heaps_for((*raw_ptr(raw_addr)).header.type_slot) };
    heaps.free_data(handle::handle_to_pointer(old_table)?)
}

/// Iterates `other`'s keys and assigns each into `raw_addr`, the same
/// way a caller looping `for k in other: self[k] = other[k]` would.
pub fn update(raw_addr: Address, other_addr: Address) -> Result<()> {
    for (k, v) in items(other_addr)? {
        assign(raw_addr, k, v)?;
    }
    Ok(())
}

/// Snapshots every `(key, value)` pair into a plain, non-shared
/// collection — a Rust caller can consume the result directly without
/// going through the proxy layer again, unlike a fresh shared dict.
pub fn copy(raw_addr: Address) -> Result<Vec<(Value, Value)>> {
    items(raw_addr)
}

/// `"{k1: v1, k2: v2}"`, reentrancy-guarded: a dict that (transitively)
/// contains itself reprs as `"{...}"` at the point of recursion.
pub fn repr(raw_addr: Address) -> Result<String> {
    let handle = handle::pointer_to_handle(raw_addr)?;
    crate::containers::guarded_repr(handle, "{...}", || {
        let mut parts = Vec::new();
        for (k, v) in items(raw_addr)? {
            parts.push(format!(
                "{}: {}",
                crate::containers::repr_value(&k)?,
                crate::containers::repr_value(&v)?
            ));
        }
        Ok(format!("{{{}}}", parts.join(", ")))
    })
}

/// Dicts are mutable, so like the original they're unhashable.
pub fn hash(_raw_addr: Address) -> Result<i64> {
    Err(ProcshareError::Unhashable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_slot_string_roundtrip() {
        let v = Value::Str("hello".to_string());
        let slot = ValueSlot::from_value(&v).unwrap();
        assert_eq!(slot.to_value(), v);
    }

    #[test]
    fn test_next_pow2_at_least() {
        assert_eq!(next_pow2_at_least(1), MIN_TABLE_SIZE);
        assert_eq!(next_pow2_at_least(MIN_TABLE_SIZE), MIN_TABLE_SIZE);
        assert_eq!(next_pow2_at_least(MIN_TABLE_SIZE + 1), MIN_TABLE_SIZE * 2);
    }

    #[test]
    fn test_resize_trigger_threshold() {
        // fill*3 >= (mask+1)*2, for an 8-slot table that's fill >= 6.
        let mask = (MIN_TABLE_SIZE - 1) as usize;
        assert!(5 * 3 < (mask + 1) * 2);
        assert!(6 * 3 >= (mask + 1) * 2);
    }
}
