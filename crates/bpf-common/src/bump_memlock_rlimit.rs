use anyhow::{Context, Result};
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};

/// Lifts the memlock rlimit, so that eBPF maps can be created on kernels
/// older than 5.11, where maps are still accounted against it.
pub fn bump_memlock_rlimit() -> Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
        .context("Failed to remove the memlock rlimit")
}
