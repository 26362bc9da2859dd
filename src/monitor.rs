//! The default synchronization manager.
//!
//! A `Synchronizer` mediates every operation a proxy performs against its
//! referent: `enter` is called before the operation runs, `leave` after.
//! `Monitor` is the plain case — acquire the object's lock, release it —
//! but the trait exists so a registered type can install something more
//! elaborate (read/write separation, upgrade/downgrade) without touching
//! `Proxy`'s dispatch path.

use crate::error::Result;
use crate::handle::Handle;
use crate::object::SharedObjectHeader;

/// Opaque state threaded from `enter` to the matching `leave`. `Monitor`
/// doesn't need one, but a synchronizer with e.g. reader/writer mode
/// would stash its acquired mode here.
pub struct SyncToken {
    pub locked: bool,
}

pub trait Synchronizer: Send + Sync {
    /// Called before an operation runs against `header`'s referent. May
    /// block. `referent` is the handle `header` lives at, recorded in the
    /// sleep table if this blocks; `op_name` is the operation about to be
    /// performed (method name, attribute name, ...); the default `Monitor`
    /// ignores it.
    fn enter(&self, referent: Handle, header: &SharedObjectHeader, op_name: &str) -> Result<SyncToken>;

    /// Called after the operation completes (or fails). Must not itself
    /// fail in a way that masks an error already pending from `enter` or
    /// the operation — see `proxy::Proxy::dispatch`'s error-dominance
    /// handling.
    fn leave(&self, header: &SharedObjectHeader, token: SyncToken) -> Result<()>;
}

pub struct Monitor;

impl Synchronizer for Monitor {
    fn enter(&self, referent: Handle, header: &SharedObjectHeader, _op_name: &str) -> Result<SyncToken> {
        if header.no_synch {
            return Ok(SyncToken { locked: false });
        }
        let semset = crate::globals::semset()?;
        header.lock.acquire(crate::globals::my_slot(), semset, referent)?;
        Ok(SyncToken { locked: true })
    }

    fn leave(&self, header: &SharedObjectHeader, token: SyncToken) -> Result<()> {
        if !token.locked {
            return Ok(());
        }
        let semset = crate::globals::semset()?;
        header.lock.release(crate::globals::my_slot(), semset)
    }
}
