//! Routes a shared object's allocations to the instance/data heaps of its
//! registered type.
//!
//! Every shareable type contributes a pair of heaps: one backing object
//! headers (`instance heap`), one backing auxiliary payloads like a
//! dict's table or a list's vector (`data heap`). Keeping the pair
//! explicit on the type's registry entry, rather than looked up through a
//! meta-type attribute, is this crate's replacement for the allocator
//! polymorphism the original relies on (see the crate's design notes).

use std::sync::Arc;

use crate::error::Result;
use crate::heap::Heap;
use crate::util::address::Address;

#[derive(Clone)]
pub struct HeapPair {
    pub instance: Arc<Heap>,
    pub data: Arc<Heap>,
}

impl HeapPair {
    pub fn create() -> Result<HeapPair> {
        Ok(HeapPair {
            instance: Arc::new(Heap::create()?),
            data: Arc::new(Heap::create()?),
        })
    }

    /// Allocates `bytes` worth of object header + payload on the
    /// instance heap.
    pub fn alloc_instance(&self, bytes: usize) -> Result<(Address, usize)> {
        self.instance.alloc(bytes)
    }

    pub fn free_instance(&self, ptr: Address) -> Result<()> {
        self.instance.free(ptr)
    }

    /// Allocates auxiliary data (a dict table, a list vector, ...) on the
    /// data heap.
    pub fn alloc_data(&self, bytes: usize) -> Result<(Address, usize)> {
        self.data.alloc(bytes)
    }

    pub fn realloc_data(&self, ptr: Address, bytes: usize) -> Result<(Address, usize)> {
        self.data.realloc(ptr, bytes)
    }

    pub fn free_data(&self, ptr: Address) -> Result<()> {
        self.data.free(ptr)
    }
}
