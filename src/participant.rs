//! Process lifecycle: joining, forking, and leaving the shared group.
//!
//! A "participant" is any process that has called [`init`]. The first
//! participant in a process tree creates `Globals`; every process it
//! later `fork`s inherits the mapping automatically (it's ordinary
//! shared memory) and only needs [`init_child`] to register its own
//! process-table slot and resynchronize the proxies it inherited.

use crate::error::Result;

/// Joins the shared group: creates `Globals` if this is the first
/// participant in the process tree, otherwise just takes a process-table
/// slot. Idempotent for a process that calls it more than once.
pub fn init() -> Result<()> {
    crate::util::logger::try_init();
    crate::globals::globals_init()?;
    crate::globals::get_or_assign_slot(std::process::id() as i32)?;
    Ok(())
}

/// Call this in the child immediately after `fork()`, before touching any
/// shared object. Takes this process its own process-table slot and
/// re-sets the proxy bit for every proxy object inherited from the
/// parent (the bitmap itself is shared memory snapshotted at fork time,
/// so the child's own bit is not set on anything it inherited).
pub fn init_child() -> Result<()> {
    crate::globals::get_or_assign_slot(std::process::id() as i32)?;
    crate::registry::resync_proxy_bits_after_fork()
}

/// Call this when a child participant is known to have died abnormally
/// (caught via `waitpid`/a `SIGCHLD` handler) rather than having run its
/// own teardown. Frees the process-table slot so it can be reassigned.
///
/// Known limitation (see DESIGN.md): this does *not* sweep the dead
/// pid's proxy bit off every shared object it held a proxy to. Doing so
/// would need a registry of every live shared object to walk, which this
/// crate doesn't maintain (each type's instance heap only tracks
/// free/used allocation units, not which units are live objects of what
/// kind). A shared object the dead participant held a proxy to is left
/// with a stale bit set until whatever process notices the object is
/// otherwise unreferenced clears it through some other path (e.g. a
/// sibling's own `Drop` on the same referent, if one exists). `exited`/
/// `core_dumped` are accepted for parity with the original's
/// `child_died` signature.
pub fn child_died(pid: i32, _signal: i32, _exited: bool, _core_dumped: bool) -> Result<()> {
    let last = crate::globals::free_slot(pid)?;
    if last {
        crate::globals::globals_cleanup();
    }
    Ok(())
}

/// Leaves the shared group. If this was the last participant, destroys
/// every remaining region and `Globals` itself.
pub fn teardown() -> Result<()> {
    let last = crate::globals::free_slot(std::process::id() as i32)?;
    if last {
        crate::globals::globals_cleanup();
    }
    Ok(())
}
