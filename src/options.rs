//! Compile-time defaults and their runtime-tunable overrides.
//!
//! Mirrors the teacher's `util::options` split between named constants and
//! an `Options` struct read from the environment: the constants are the
//! values used when nothing else is configured, `Options` lets an embedder
//! override them without recompiling.

use std::env;
use std::str::FromStr;

/// Width of the process table, the proxy bitmap, and every SemSet.
pub const MAX_PROCESSES: usize = 128;
/// Width of the region table in `Globals`.
pub const MAX_REGIONS: usize = 500;
/// Number of power-of-two size classes in a `SharedHeap`.
pub const NOF_ALLOC_SIZES: usize = 10;
/// Smallest allocation unit handed out by a `SharedHeap`.
pub const MIN_ALLOC_SIZE: usize = 64;
/// Largest allocation unit handed out by a `SharedHeap` before bypassing
/// the slab and allocating a dedicated region.
pub const MAX_ALLOC_SIZE: usize = MIN_ALLOC_SIZE << (NOF_ALLOC_SIZES - 1);
/// Size of a freshly created heap page.
pub const PAGE_SIZE: usize = MAX_ALLOC_SIZE * 16;
/// How many System V semaphores live in one underlying semaphore set.
/// Kept well under `SEMMSL` on common Linux configurations.
pub const SYSV_SETS_PER_SEMSET: usize = 16;

/// Runtime-tunable copies of the constants above, read from the
/// environment so an embedder can raise limits without a rebuild.
#[derive(Copy, Clone, Debug)]
pub struct Options {
    pub max_processes: usize,
    pub max_regions: usize,
    pub nof_alloc_sizes: usize,
    pub min_alloc_size: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            max_processes: MAX_PROCESSES,
            max_regions: MAX_REGIONS,
            nof_alloc_sizes: NOF_ALLOC_SIZES,
            min_alloc_size: MIN_ALLOC_SIZE,
        }
    }
}

impl Options {
    /// Reads `PROCSHARE_MAX_PROCESSES`, `PROCSHARE_MAX_REGIONS`,
    /// `PROCSHARE_NOF_ALLOC_SIZES` and `PROCSHARE_MIN_ALLOC_SIZE`,
    /// falling back to the compiled-in defaults for anything unset or
    /// unparsable. Unparsable values are logged and ignored rather than
    /// treated as a hard error, matching the teacher's
    /// `read_env_var_settings` tolerance.
    pub fn from_env() -> Options {
        let mut opts = Options::default();
        Self::apply_env("PROCSHARE_MAX_PROCESSES", &mut opts.max_processes);
        Self::apply_env("PROCSHARE_MAX_REGIONS", &mut opts.max_regions);
        Self::apply_env("PROCSHARE_NOF_ALLOC_SIZES", &mut opts.nof_alloc_sizes);
        Self::apply_env("PROCSHARE_MIN_ALLOC_SIZE", &mut opts.min_alloc_size);
        opts
    }

    fn apply_env<T: FromStr>(key: &str, slot: &mut T) {
        if let Ok(raw) = env::var(key) {
            match raw.parse::<T>() {
                Ok(v) => *slot = v,
                Err(_) => log::warn!("ignoring unparsable {key}={raw:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let opts = Options::default();
        assert_eq!(opts.max_processes, MAX_PROCESSES);
        assert_eq!(opts.max_regions, MAX_REGIONS);
        assert_eq!(opts.nof_alloc_sizes, NOF_ALLOC_SIZES);
        assert_eq!(opts.min_alloc_size, MIN_ALLOC_SIZE);
    }

    #[test]
    fn test_max_alloc_size_is_power_of_two_scaled() {
        assert_eq!(MAX_ALLOC_SIZE, MIN_ALLOC_SIZE * (1 << (NOF_ALLOC_SIZES - 1)));
    }
}
