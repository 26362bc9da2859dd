//! Build-time provenance, generated by `build.rs` via the `built` crate.

mod raw {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Crate version such as `0.1.0`.
pub const PKG_VERSION: &str = raw::PKG_VERSION;

/// Comma-separated features enabled for this build.
pub const FEATURES: &str = raw::FEATURES_STR;

lazy_static::lazy_static! {
    /// The commit procshare was built from, or `"unknown-git-version"` when
    /// built outside a git checkout.
    pub static ref GIT_VERSION: &'static str = &GIT_VERSION_STRING;

    static ref GIT_VERSION_STRING: String = match raw::GIT_COMMIT_HASH {
        Some(hash) => format!("{hash}{}", if raw::GIT_DIRTY.unwrap_or(false) { "-dirty" } else { "" }),
        None => "unknown-git-version".to_string(),
    };
}
