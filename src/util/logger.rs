//! Logger bootstrap.
//!
//! procshare logs through the `log` facade everywhere. By default it wires
//! up `env_logger` so a binary that does nothing else still gets output
//! controlled by `RUST_LOG`. A host process that already runs its own
//! `log` implementation can disable the `builtin_env_logger` feature and
//! `try_init` becomes a no-op.

pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );
            match result {
                Ok(()) => {
                    log::debug!("procshare initialized the logger.");
                }
                Err(e) => {
                    log::debug!("procshare failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            log::debug!(
                "procshare didn't initialize the built-in env_logger. The Cargo feature \"builtin_env_logger\" is not enabled."
            );
        }
    }
}
