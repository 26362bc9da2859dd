//! Region-partitioned slab allocator with per-size free lists.
//!
//! A `Heap` subdivides a sequence of equally-sized *pages* (each its own
//! OS region) into `NOF_ALLOC_SIZES` power-of-two size classes. An
//! allocation request larger than the biggest class bypasses the slab
//! entirely and gets a dedicated region; this keeps the common small
//! allocation path lock-granular (one lock per class, one lock per page)
//! while never failing on oversized requests.

pub mod alloc_bridge;

use crate::error::Result;
use crate::handle::{self, Handle};
use crate::options::{MAX_ALLOC_SIZE, MIN_ALLOC_SIZE, NOF_ALLOC_SIZES, PAGE_SIZE};
use crate::sync::lock::Lock;
use crate::util::address::Address;

#[repr(C)]
struct PageHeader {
    next_page: Handle,
    lock: Lock,
    total_units: u32,
    free_units: u32,
    unit_size: u32,
    /// Byte offset (from the start of the page's region, header
    /// included) of the first free unit; `0` terminates the list since no
    /// unit ever starts inside the header.
    free_list_head: u32,
}

impl PageHeader {
    fn payload_start() -> usize {
        let header_size = std::mem::size_of::<PageHeader>();
        // Round up so the first unit starts at a unit-size boundary.
        header_size
    }
}

#[repr(C)]
struct HeapClass {
    lock: Lock,
    head_page: std::cell::UnsafeCell<Handle>,
    tail_page: std::cell::UnsafeCell<Handle>,
}

// SAFETY: `head_page`/`tail_page` are only ever mutated while holding
// `lock`, the same discipline `SharedObjectHeader::srefcnt` follows
// under its own `reflock`.
unsafe impl Send for HeapClass {}
unsafe impl Sync for HeapClass {}

impl HeapClass {
    fn head_page(&self) -> Handle {
        unsafe { *self.head_page.get() }
    }

    fn tail_page(&self) -> Handle {
        unsafe { *self.tail_page.get() }
    }
}

#[repr(C)]
struct HeapRootRaw {
    classes: [HeapClass; NOF_ALLOC_SIZES],
}

fn class_size(i: usize) -> usize {
    MIN_ALLOC_SIZE << i
}

fn class_for(size: usize) -> Option<usize> {
    (0..NOF_ALLOC_SIZES).find(|&i| size <= class_size(i))
}

/// A single slab heap, independently lockable per size class. Two of
/// these back every registered shareable type: one for object headers
/// (`instance heap`), one for their auxiliary payloads (`data heap`) —
/// see [`alloc_bridge`].
pub struct Heap {
    root_handle: Handle,
}

impl Heap {
    /// Allocates a fresh, empty heap in its own region.
    pub fn create() -> Result<Heap> {
        let size = std::mem::size_of::<HeapRootRaw>();
        let region_index = crate::globals::region_new(size)?;
        let handle = Handle {
            region: region_index,
            offset: 0,
        };
        let ptr = handle::handle_to_pointer(handle)?.to_mut_ptr::<HeapRootRaw>();
        unsafe {
            std::ptr::write_bytes(ptr, 0, 1);
            for class in (*ptr).classes.iter_mut() {
                *class.head_page.get_mut() = Handle::NULL;
                *class.tail_page.get_mut() = Handle::NULL;
            }
        }
        Ok(Heap {
            root_handle: handle,
        })
    }

    /// Reattaches a heap previously created by another participant.
    pub fn from_handle(root_handle: Handle) -> Heap {
        Heap { root_handle }
    }

    pub fn handle(&self) -> Handle {
        self.root_handle
    }

    fn root(&self) -> Result<*mut HeapRootRaw> {
        Ok(handle::handle_to_pointer(self.root_handle)?.to_mut_ptr::<HeapRootRaw>())
    }

    /// Allocates at least `size` bytes. Returns the address and the
    /// actual granted size (always `class_size(i)` for slab allocations,
    /// or the region-rounded size for bypass allocations).
    pub fn alloc(&self, size: usize) -> Result<(Address, usize)> {
        match class_for(size) {
            Some(i) => self.alloc_in_class(i),
            None => {
                // Bypass: a dedicated region, addressed at offset 0 so
                // `free` can recognize it (see `free` below).
                let region_index = crate::globals::region_new(size)?;
                let rh = crate::globals::region_handle(region_index)?;
                let addr = handle::handle_to_pointer(Handle {
                    region: region_index,
                    offset: 0,
                })?;
                Ok((addr, rh.size))
            }
        }
    }

    fn alloc_in_class(&self, class_index: usize) -> Result<(Address, usize)> {
        let root = self.root()?;
        let semset = crate::globals::semset()?;
        let self_slot = crate::globals::my_slot();
        let unit_size = class_size(class_index);
        loop {
            let class = unsafe { &(*root).classes[class_index] };
            class.lock.acquire(self_slot, semset, Handle::NULL)?;
            let mut page_handle = class.head_page();
            let mut found: Option<Handle> = None;
            while !page_handle.is_null() {
                let page_ptr = handle::handle_to_pointer(page_handle)?.to_mut_ptr::<PageHeader>();
                let free_units = unsafe { (*page_ptr).free_units };
                if free_units > 0 {
                    found = Some(page_handle);
                    break;
                }
                page_handle = unsafe { (*page_ptr).next_page };
            }
            let page_handle = match found {
                Some(h) => h,
                None => {
                    let new_page = self.new_page(unit_size)?;
                    // SAFETY: protected by class.lock, held above.
                    unsafe {
                        if class.head_page().is_null() {
                            *class.head_page.get() = new_page;
                        } else {
                            let tail_ptr = handle::handle_to_pointer(class.tail_page())?
                                .to_mut_ptr::<PageHeader>();
                            (*tail_ptr).next_page = new_page;
                        }
                        *class.tail_page.get() = new_page;
                    }
                    new_page
                }
            };
            class.lock.release(self_slot, semset)?;

            match self.alloc_unit(page_handle, unit_size)? {
                Some(addr) => return Ok((addr, unit_size)),
                // Another participant raced us for the last free unit on
                // the page we found; loop and try again.
                None => continue,
            }
        }
    }

    fn new_page(&self, unit_size: usize) -> Result<Handle> {
        let region_index = crate::globals::region_new(PAGE_SIZE)?;
        let handle = Handle {
            region: region_index,
            offset: 0,
        };
        let ptr = handle::handle_to_pointer(handle)?.to_mut_ptr::<PageHeader>();
        let payload_start = PageHeader::payload_start();
        let total_units = ((PAGE_SIZE - payload_start) / unit_size) as u32;
        unsafe {
            (*ptr).next_page = Handle::NULL;
            (*ptr).lock = Lock::new();
            (*ptr).total_units = total_units;
            (*ptr).free_units = total_units;
            (*ptr).unit_size = unit_size as u32;
            // Thread every unit into the free list, terminated by 0.
            let mut prev_offset: u32 = 0;
            for i in (0..total_units).rev() {
                let unit_offset = payload_start as u32 + i * unit_size as u32;
                let unit_ptr = (ptr as *mut u8).add(unit_offset as usize) as *mut u32;
                *unit_ptr = prev_offset;
                prev_offset = unit_offset;
            }
            (*ptr).free_list_head = prev_offset;
        }
        Ok(handle)
    }

    fn alloc_unit(&self, page_handle: Handle, unit_size: usize) -> Result<Option<Address>> {
        let page_ptr = handle::handle_to_pointer(page_handle)?.to_mut_ptr::<PageHeader>();
        let semset = crate::globals::semset()?;
        let self_slot = crate::globals::my_slot();
        unsafe {
            (*page_ptr).lock.acquire(self_slot, semset, page_handle)?;
            let head = (*page_ptr).free_list_head;
            let result = if head == 0 {
                None
            } else {
                let unit_ptr = (page_ptr as *mut u8).add(head as usize) as *mut u32;
                (*page_ptr).free_list_head = *unit_ptr;
                (*page_ptr).free_units -= 1;
                debug_assert_eq!((*page_ptr).unit_size as usize, unit_size);
                Some(Address::from_mut_ptr(unit_ptr as *mut u8))
            };
            (*page_ptr).lock.release(self_slot, semset)?;
            Ok(result)
        }
    }

    /// Resizes an allocation in place when possible, otherwise allocates,
    /// copies, and frees the original.
    pub fn realloc(&self, ptr: Address, new_size: usize) -> Result<(Address, usize)> {
        let h = handle::pointer_to_handle(ptr)?;
        if h.offset == 0 {
            // Whole-region bypass allocation: grow only by replacing it.
            let old_size = crate::globals::region_handle(h.region)?.size;
            if old_size >= new_size {
                return Ok((ptr, old_size));
            }
            let (new_ptr, granted) = self.alloc(new_size)?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr.to_ptr::<u8>(),
                    new_ptr.to_mut_ptr::<u8>(),
                    old_size.min(new_size),
                );
            }
            self.free(ptr)?;
            return Ok((new_ptr, granted));
        }
        let page_ptr = Address::from_usize(ptr.as_usize() - h.offset as usize)
            .to_mut_ptr::<PageHeader>();
        let cur_size = unsafe { (*page_ptr).unit_size as usize };
        let keep_in_place =
            cur_size >= new_size && (cur_size / 4 < MIN_ALLOC_SIZE || cur_size / 4 < new_size);
        if keep_in_place {
            return Ok((ptr, cur_size));
        }
        let (new_ptr, granted) = self.alloc(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.to_ptr::<u8>(),
                new_ptr.to_mut_ptr::<u8>(),
                cur_size.min(new_size),
            );
        }
        self.free(ptr)?;
        Ok((new_ptr, granted))
    }

    /// Frees a previous allocation. Pages are never returned to the heap
    /// root once created; only their units are recycled. Freeing the
    /// empty page itself is a known limitation shared with the original
    /// implementation (see the crate's design notes) to avoid racing a
    /// concurrent allocator that just took the class lock.
    pub fn free(&self, ptr: Address) -> Result<()> {
        let h = handle::pointer_to_handle(ptr)?;
        if h.offset == 0 {
            crate::globals::region_destroy(h.region)?;
            return Ok(());
        }
        let page_addr = Address::from_usize(ptr.as_usize() - h.offset as usize);
        let page_ptr = page_addr.to_mut_ptr::<PageHeader>();
        let semset = crate::globals::semset()?;
        let self_slot = crate::globals::my_slot();
        let page_handle = Handle {
            region: h.region,
            offset: 0,
        };
        unsafe {
            (*page_ptr).lock.acquire(self_slot, semset, page_handle)?;
            let unit_ptr = ptr.to_mut_ptr::<u32>();
            let unit_offset = (ptr.as_usize() - page_addr.as_usize()) as u32;
            *unit_ptr = (*page_ptr).free_list_head;
            (*page_ptr).free_list_head = unit_offset;
            (*page_ptr).free_units += 1;
            (*page_ptr).lock.release(self_slot, semset)?;
        }
        Ok(())
    }
}

/// Internal sanity check used by class-index selection tests below and by
/// `alloc_bridge`: asserts the slab never advertises a class larger than
/// `MAX_ALLOC_SIZE`.
fn _assert_class_bounds() {
    debug_assert_eq!(class_size(NOF_ALLOC_SIZES - 1), MAX_ALLOC_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_for_picks_smallest_fit() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(MIN_ALLOC_SIZE), Some(0));
        assert_eq!(class_for(MIN_ALLOC_SIZE + 1), Some(1));
        assert_eq!(class_for(MAX_ALLOC_SIZE), Some(NOF_ALLOC_SIZES - 1));
        assert_eq!(class_for(MAX_ALLOC_SIZE + 1), None);
    }

    #[test]
    fn test_alloc_free_round_trip() {
        crate::globals::globals_init().unwrap();
        crate::globals::get_or_assign_slot(std::process::id() as i32).unwrap();
        let heap = Heap::create().unwrap();
        let (addr, size) = heap.alloc(100).unwrap();
        assert!(size >= 100);
        unsafe {
            *addr.to_mut_ptr::<u8>() = 0x42;
        }
        heap.free(addr).unwrap();
        let (addr2, _) = heap.alloc(100).unwrap();
        // Should recycle the freed unit from the same page.
        assert_eq!(addr2, addr);
    }

    #[test]
    fn test_bypass_allocation_for_oversized_request() {
        crate::globals::globals_init().unwrap();
        crate::globals::get_or_assign_slot((std::process::id() as i32) + 1).unwrap();
        let heap = Heap::create().unwrap();
        let big = MAX_ALLOC_SIZE + 1024;
        let (addr, size) = heap.alloc(big).unwrap();
        assert!(size >= big);
        heap.free(addr).unwrap();
    }
}
