//! Shared container kinds: dict, list, tuple.
//!
//! Each submodule owns its `Raw` shared-memory layout and a set of free
//! functions operating on an [`crate::util::address::Address`] pointing
//! at one. [`crate::proxy::Proxy::dispatch`] is how a proxy calls into
//! them under synchronization; the per-container methods on `Proxy`
//! (`Proxy::dict_set`, `Proxy::list_append`, `Proxy::tuple_get`, ...) are
//! the intended entry points for embedders, wrapping these free
//! functions in `dispatch` so callers never have to hand-roll the
//! enter/leave bracket themselves.

use crate::error::Result;
use crate::handle::Handle;
use crate::object::ObjectKind;
use crate::util::address::Address;
use crate::value::Value;

pub mod dict;
pub mod list;
pub(crate) mod slot;
pub mod tuple;

std::thread_local! {
    static REPR_STACK: std::cell::RefCell<Vec<Handle>> = const { std::cell::RefCell::new(Vec::new()) };
}

/// Runs `f` to build `handle`'s representation, substituting `on_cycle`
/// instead of calling `f` if `handle` is already being repr'd higher up
/// the same call stack — the reentrancy guard spec.md §4.11/§4.12
/// require so a self-referential dict/list reprs as `"{...}"`/`"[...]"`
/// instead of recursing forever.
pub(crate) fn guarded_repr(
    handle: Handle,
    on_cycle: &str,
    f: impl FnOnce() -> Result<String>,
) -> Result<String> {
    let already_on_stack = REPR_STACK.with(|s| s.borrow().contains(&handle));
    if already_on_stack {
        return Ok(on_cycle.to_string());
    }
    REPR_STACK.with(|s| s.borrow_mut().push(handle));
    let result = f();
    REPR_STACK.with(|s| {
        s.borrow_mut().pop();
    });
    result
}

/// Renders one container element the way dict/list `repr` embed it:
/// strings quoted, shared handles recursed into by kind (cycle-guarded
/// via [`guarded_repr`]).
pub(crate) fn repr_value(v: &Value) -> Result<String> {
    match v {
        Value::None => Ok("None".to_string()),
        Value::Bool(b) => Ok(if *b { "True" } else { "False" }.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Str(s) => Ok(format!("{s:?}")),
        Value::Shared(h) => repr_handle(*h),
    }
}

fn repr_handle(h: Handle) -> Result<String> {
    let ptr = crate::object::header_ptr(h)?;
    let kind = unsafe { (*ptr).kind };
    let addr = crate::handle::handle_to_pointer(h)?;
    match kind {
        ObjectKind::Dict => dict::repr(addr),
        ObjectKind::List => list::repr(addr),
        ObjectKind::Tuple => tuple_repr(addr),
    }
}

/// Tuples are immutable and built in one shot (no `ass_item`), so unlike
/// dict/list they can't be made to directly contain themselves — no
/// reentrancy guard needed here.
pub(crate) fn tuple_repr(addr: Address) -> Result<String> {
    let len = tuple::length(addr) as usize;
    let mut parts = Vec::with_capacity(len);
    for i in 0..len {
        parts.push(repr_value(&tuple::item(addr, i)?)?);
    }
    match len {
        1 => Ok(format!("({},)", parts[0])),
        _ => Ok(format!("({})", parts.join(", "))),
    }
}
