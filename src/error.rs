//! The error taxonomy for the procshare runtime.
//!
//! Errors are grouped the way the design doc groups them: resource
//! exhaustion, integrity violations, usage errors, and interruption. A
//! single enum is used rather than per-component error types because
//! almost every public operation can fail for reasons spanning several
//! components (e.g. a dict `assign` can fail because the heap is out of
//! memory *or* because a handle could not be reverse-mapped).

use std::fmt;

#[derive(Debug)]
pub enum ProcshareError {
    /// The OS refused to create a shared-memory region.
    RegionCreationFailed(std::io::Error),
    /// `Globals::regtable` has no free slot left.
    TooManyRegions,
    /// `Globals::proctable` has no free slot left.
    TooManyParticipants,
    /// A slab or region allocation failed.
    AllocationFailed,
    /// No slot was available in a fixed-size table (process, region, etc).
    NoHandleSlot,
    /// `pointer_to_handle` found no attached region containing the address.
    ReverseMappingFailed,
    /// `Lock::release` was called by a participant that isn't the owner.
    NonOwnerRelease,
    /// A hash-map probe visited every slot without finding a free one.
    HashTableCorrupt,
    /// `share()` was called on a type with no registered shared/proxy pair.
    NotShareable,
    /// Dict subscript/delitem on a key that isn't present.
    NoSuchKey,
    /// Attribute lookup failed on a proxy.
    NoSuchAttribute,
    /// `hash()` was called on an unhashable shared container (e.g. dict, list).
    Unhashable,
    /// A blocking semaphore operation was interrupted and could not be
    /// restarted (this is only raised after internal EINTR retries are
    /// exhausted via a hard OS error).
    Interrupted,
    /// The shared object has been flagged `is_corrupt`; this is permanent.
    ObjectCorrupt,
    /// Index out of range for list/tuple operations.
    IndexOutOfRange,
    /// A `Value::Str` exceeded the inline string capacity a container
    /// entry can hold.
    StringTooLong,
    /// The underlying OS primitive (mmap, semget, ...) failed.
    Os(std::io::Error),
}

impl fmt::Display for ProcshareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcshareError::RegionCreationFailed(e) => {
                write!(f, "failed to create shared memory region: {e}")
            }
            ProcshareError::TooManyRegions => write!(f, "no free region table slot"),
            ProcshareError::TooManyParticipants => write!(f, "no free participant slot"),
            ProcshareError::AllocationFailed => write!(f, "shared allocation failed"),
            ProcshareError::NoHandleSlot => write!(f, "no free handle slot"),
            ProcshareError::ReverseMappingFailed => {
                write!(f, "reverse memory handle mapping failed")
            }
            ProcshareError::NonOwnerRelease => {
                write!(f, "lock release attempted by non-owner")
            }
            ProcshareError::HashTableCorrupt => write!(f, "hash table probe found no free slot"),
            ProcshareError::NotShareable => write!(f, "type is not shareable"),
            ProcshareError::NoSuchKey => write!(f, "no such key"),
            ProcshareError::NoSuchAttribute => write!(f, "no such attribute"),
            ProcshareError::Unhashable => write!(f, "unhashable type"),
            ProcshareError::Interrupted => write!(f, "operation interrupted"),
            ProcshareError::ObjectCorrupt => write!(f, "shared object may be corrupt"),
            ProcshareError::IndexOutOfRange => write!(f, "index out of range"),
            ProcshareError::StringTooLong => write!(f, "string value exceeds inline capacity"),
            ProcshareError::Os(e) => write!(f, "OS error: {e}"),
        }
    }
}

impl std::error::Error for ProcshareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcshareError::RegionCreationFailed(e) | ProcshareError::Os(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcshareError>;
