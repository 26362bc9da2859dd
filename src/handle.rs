//! Position-independent pointers.
//!
//! Two participants may attach the same region at different virtual
//! addresses, so a bare pointer is only meaningful within the participant
//! that computed it. A `Handle` — a `(region_index, offset)` pair — is
//! meaningful everywhere; translating between the two happens on every
//! boundary crossing via a per-participant attach table.

use std::cell::RefCell;

use crate::error::{ProcshareError, Result};
use crate::options::MAX_REGIONS;
use crate::util::address::Address;

/// A position-independent reference to a byte within some region.
/// `region == -1` is the null handle, mirroring the original's
/// `SharedMemHandle` field widths exactly.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(C)]
pub struct Handle {
    pub region: i32,
    pub offset: u32,
}

impl Handle {
    pub const NULL: Handle = Handle {
        region: -1,
        offset: 0,
    };

    pub fn is_null(self) -> bool {
        self.region < 0
    }
}

impl Default for Handle {
    fn default() -> Handle {
        Handle::NULL
    }
}

/// One row of the per-participant attach table: the `[start, end]`
/// interval a region occupies in *this* participant's address space, plus
/// the BST links used for O(log R) reverse lookup.
#[derive(Copy, Clone)]
struct AttachRow {
    region_index: i32,
    start: usize,
    end: usize,
    left: i32,
    right: i32,
}

impl AttachRow {
    const EMPTY: AttachRow = AttachRow {
        region_index: -1,
        start: 0,
        end: 0,
        left: -1,
        right: -1,
    };
}

struct AttachTable {
    rows: [AttachRow; MAX_REGIONS],
    root: i32,
}

impl AttachTable {
    fn new() -> AttachTable {
        AttachTable {
            rows: [AttachRow::EMPTY; MAX_REGIONS],
            root: -1,
        }
    }

    fn is_attached(&self, region_index: i32) -> bool {
        (region_index as usize) < MAX_REGIONS && self.rows[region_index as usize].region_index >= 0
    }

    /// Rebuilds the BST as a weight-balanced tree over the occupied rows,
    /// directly grounded in the original's `optimal_tree`/`build_tree`:
    /// collect occupied indices, sort by `start` (tie-break `end`), then
    /// recursively take the median of each half as the subtree root.
    fn rebuild(&mut self) {
        let mut occupied: Vec<usize> = (0..MAX_REGIONS)
            .filter(|&i| self.rows[i].region_index >= 0)
            .collect();
        occupied.sort_by(|&a, &b| {
            let ra = &self.rows[a];
            let rb = &self.rows[b];
            ra.start.cmp(&rb.start).then(ra.end.cmp(&rb.end))
        });
        for &i in &occupied {
            self.rows[i].left = -1;
            self.rows[i].right = -1;
        }
        self.root = Self::build_tree(&occupied, &mut self.rows);
    }

    fn build_tree(sorted: &[usize], rows: &mut [AttachRow; MAX_REGIONS]) -> i32 {
        if sorted.is_empty() {
            return -1;
        }
        let mid = sorted.len() / 2;
        let root_idx = sorted[mid];
        rows[root_idx].left = Self::build_tree(&sorted[..mid], rows);
        rows[root_idx].right = Self::build_tree(&sorted[mid + 1..], rows);
        root_idx as i32
    }

    fn find_by_address(&self, addr: usize) -> Option<i32> {
        let mut cur = self.root;
        while cur >= 0 {
            let row = &self.rows[cur as usize];
            if addr < row.start {
                cur = row.left;
            } else if addr > row.end {
                cur = row.right;
            } else {
                return Some(row.region_index);
            }
        }
        None
    }
}

thread_local! {
    static ATTACH_TABLE: RefCell<AttachTable> = RefCell::new(AttachTable::new());
}

/// Looks up the region's handle via `Globals::regtable`, attaching it
/// with the region layer if this participant hasn't seen it before, and
/// returns the participant-local interval it now occupies.
fn ensure_attached(region_index: i32) -> Result<()> {
    let already = ATTACH_TABLE.with(|t| t.borrow().is_attached(region_index));
    if already {
        return Ok(());
    }
    let rh = crate::globals::region_handle(region_index)?;
    let addr = crate::region::region_attach(&rh)?;
    let start = addr.as_usize();
    let end = start + rh.size - 1;
    ATTACH_TABLE.with(|t| {
        let mut t = t.borrow_mut();
        t.rows[region_index as usize] = AttachRow {
            region_index,
            start,
            end,
            left: -1,
            right: -1,
        };
        t.rebuild();
    });
    Ok(())
}

/// Translates a handle to a participant-local pointer, attaching the
/// region lazily on first use.
pub fn handle_to_pointer(h: Handle) -> Result<Address> {
    if h.is_null() {
        return Ok(Address::ZERO);
    }
    ensure_attached(h.region)?;
    ATTACH_TABLE.with(|t| {
        let t = t.borrow();
        let row = &t.rows[h.region as usize];
        Ok(Address::from_usize(row.start + h.offset as usize))
    })
}

/// Translates a participant-local pointer back to a handle by descending
/// the attach-interval BST.
pub fn pointer_to_handle(p: Address) -> Result<Handle> {
    if p.is_zero() {
        return Ok(Handle::NULL);
    }
    let addr = p.as_usize();
    ATTACH_TABLE.with(|t| {
        let t = t.borrow();
        match t.find_by_address(addr) {
            Some(region_index) => {
                let row = &t.rows[region_index as usize];
                Ok(Handle {
                    region: region_index,
                    offset: (addr - row.start) as u32,
                })
            }
            None => Err(ProcshareError::ReverseMappingFailed),
        }
    })
}

/// Marks a region as detached in this participant's attach table, e.g.
/// after `region_destroy`. Rebuilds the tree so stale intervals are never
/// consulted again.
pub fn forget_region(region_index: i32) {
    ATTACH_TABLE.with(|t| {
        let mut t = t.borrow_mut();
        if (region_index as usize) < MAX_REGIONS {
            t.rows[region_index as usize] = AttachRow::EMPTY;
            t.rebuild();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle_roundtrip() {
        assert_eq!(handle_to_pointer(Handle::NULL).unwrap(), Address::ZERO);
        assert_eq!(pointer_to_handle(Address::ZERO).unwrap(), Handle::NULL);
    }

    #[test]
    fn test_build_tree_is_balanced_median() {
        let sorted: Vec<usize> = vec![0, 1, 2, 3, 4];
        let mut rows = [AttachRow::EMPTY; MAX_REGIONS];
        for (n, &i) in sorted.iter().enumerate() {
            rows[i].start = n * 100;
            rows[i].end = n * 100 + 50;
            rows[i].region_index = i as i32;
        }
        let root = AttachTable::build_tree(&sorted, &mut rows);
        assert_eq!(root, 2);
    }
}
