//! procshare: an inter-process shared-object runtime.
//!
//! Cooperating processes descended from a common ancestor (via `fork`)
//! share dicts, lists and tuples through regions of memory mapped into
//! every participant. Objects are reference-counted across process
//! boundaries (`srefcnt` for references from other shared objects, a
//! proxy bitmap for references held by live participants) and freed the
//! moment both drop to zero, in whichever process notices first.
//!
//! Logically, this crate has these parts:
//! * [Regions](region/index.html) and [handles](handle/index.html): the
//!   position-independent addressing scheme every shared structure is
//!   built on.
//! * [`globals`]: the root record — participant table, region table,
//!   sleep table — every participant attaches directly.
//! * [Synchronization primitives](sync/index.html): `Spinlock`, `Bitmap`,
//!   `SemSet`, and the reentrant blocking `Lock` built from them.
//! * [`heap`]: the slab allocator backing every registered type's
//!   instances and auxiliary data.
//! * [`object`], [`proxy`], [`monitor`]: the shared-object header,
//!   per-participant proxy handle, and pluggable synchronization policy.
//! * [Containers](containers/index.html): `dict`, `list`, `tuple`.
//! * [`registry`], [`participant`]: type registration and process
//!   lifecycle (join, fork, leave).

pub mod build_info;
pub mod containers;
pub mod error;
pub mod globals;
pub mod handle;
pub mod heap;
pub mod monitor;
pub mod object;
pub mod options;
pub mod participant;
pub mod proxy;
pub mod region;
pub mod registry;
mod sync;
pub mod util;
pub mod value;

use std::any::TypeId;
use std::sync::Arc;

pub use error::{ProcshareError, Result};
pub use proxy::Proxy;
pub use value::Value;

use crate::monitor::Synchronizer;
use crate::object::ObjectKind;

/// The data a [`Shareable`] type decomposes into at `share` time.
pub enum ShareablePayload {
    Dict(Vec<(Value, Value)>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
}

/// A type that can be copied into shared memory as one of the three
/// container kinds. This crate's replacement for the original's ambient
/// host-language object model: instead of any object being shareable by
/// virtue of a meta-type attribute, a Rust type opts in explicitly by
/// implementing this trait and registering itself with [`register_type`].
pub trait Shareable: 'static {
    fn kind() -> ObjectKind;
    fn into_payload(self) -> ShareablePayload;
}

/// Registers `T` as shareable using the default [`monitor::Monitor`]
/// synchronizer. Safe to call more than once for the same `T` — later
/// calls are no-ops, since re-registration would change the meaning of
/// `type_slot`s already written into existing shared objects.
pub fn register_type<T: Shareable>() -> Result<()> {
    registry::register_type::<T>(T::kind(), None).map(|_| ())
}

/// As [`register_type`], but installs a custom [`Synchronizer`] instead
/// of the default `Monitor`.
pub fn register_type_with_synchronizer<T: Shareable>(
    synchronizer: Arc<dyn Synchronizer>,
) -> Result<()> {
    registry::register_type::<T>(T::kind(), Some(synchronizer)).map(|_| ())
}

/// Copies `value` into shared memory and returns a proxy to it. `T` must
/// already be registered via [`register_type`] — this fails with
/// `NotShareable` otherwise, the hard-error treatment this crate chooses
/// over silently installing a default synchronizer at share time.
pub fn share<T: Shareable>(value: T) -> Result<Arc<Proxy>> {
    let slot = registry::slot_for::<T>()?;
    let handle = match value.into_payload() {
        ShareablePayload::Dict(items) => {
            let h = containers::dict::create(slot)?;
            let addr = handle::handle_to_pointer(h)?;
            for (k, v) in items {
                containers::dict::assign(addr, k, v)?;
            }
            h
        }
        ShareablePayload::List(items) => containers::list::create_from(slot, items)?,
        ShareablePayload::Tuple(items) => containers::tuple::create_from(slot, items)?,
    };
    registry::make_proxy(handle)
}

/// An opaque token identifying a proxy's referent, suitable for logging
/// or as a map key — not a dereferenceable pointer.
pub fn address_of(proxy: &Proxy) -> usize {
    proxy.address_of()
}

/// Joins the shared group (creating `Globals` if this is the first
/// participant in the process tree).
pub fn init() -> Result<()> {
    participant::init()
}

/// Call in a freshly `fork`ed child before touching any shared object.
pub fn init_child() -> Result<()> {
    participant::init_child()
}

/// Reports that participant `pid` died without running its own teardown,
/// so its process-table slot and proxy bits can be reclaimed.
pub fn child_died(pid: i32, signal: i32, exited: bool, core_dumped: bool) -> Result<()> {
    participant::child_died(pid, signal, exited, core_dumped)
}

/// Hook for installing a custom allocator for `type_id`'s instance/data
/// heaps in place of the default slab `Heap`. Left unresolved at the
/// design level (see DESIGN.md): this crate's heap pairs are fixed at
/// `register_type` time, so this is currently a no-op that always
/// succeeds rather than a real override point.
pub fn override_allocation(_type_id: TypeId) -> Result<()> {
    Ok(())
}

/// Whether `type_id` has installed custom attribute-override behavior
/// (the original's per-meta-type `__getattr__`/`__setattr__` hook). This
/// crate has no such mechanism — every registered type gets the same
/// dict/list/tuple semantics — so this always returns `false`.
pub fn overrides_attributes(_type_id: TypeId) -> bool {
    false
}
