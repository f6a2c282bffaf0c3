//! Kernel plumbing shared by every tracer: loading eBPF objects, attaching
//! their programs, reading their events and managing the BPF file system.

pub mod bpf_fs;
pub mod events;
pub mod kernel;
pub mod parsing;
pub mod program;
pub mod trace_pipe;

mod bump_memlock_rlimit;

pub use bump_memlock_rlimit::bump_memlock_rlimit;
pub use events::EventSource;
pub use kernel::AyaKernel;
pub use program::{
    Closer, Collection, CollectionSpec, ConstValue, Constants, Kernel, ProgramError,
};

pub use aya;

/// Logs `err` with its whole chain of sources.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

/// Like [`log_error`], for failures the caller recovers from.
pub fn log_warning<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::warn!("{}: {:?}", msg, anyhow::Error::from(err));
}

pub use nix::unistd::Pid;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[path = "platform/linux-x86_64.rs"]
pub mod platform;

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
#[path = "platform/linux-aarch64.rs"]
pub mod platform;

#[cfg(all(target_os = "linux", target_arch = "riscv64"))]
#[path = "platform/linux-riscv64.rs"]
pub mod platform;
