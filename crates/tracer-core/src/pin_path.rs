//! BPF file system where all the tracers pin their maps, so that maps with
//! the same name are shared between independently loaded objects.
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bpf_common::{
    Kernel, Pid,
    bpf_fs::{self, BpfFsError},
};

pub struct PinPath {
    path: PathBuf,
    kernel: Arc<dyn Kernel>,
    released: AtomicBool,
}

impl PinPath {
    /// Creates `base_dir/<pid>` and mounts a BPF file system on it.
    pub fn mount(kernel: Arc<dyn Kernel>, base_dir: &Path, pid: Pid) -> Result<Self, BpfFsError> {
        let path = base_dir.join(pid.to_string());
        log::debug!("Mounting BPF map pinning path {}", path.display());
        bpf_fs::create_pin_dir(&path)?;
        if let Err(err) = kernel.mount_bpf_fs(&path) {
            if let Err(err) = bpf_fs::remove_pin_dir(&path) {
                bpf_common::log_warning("removing pin path", err);
            }
            return Err(err);
        }
        Ok(Self {
            path,
            kernel,
            released: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmounts and removes the pin path. Only the first call has effect,
    /// failures are logged.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            log::warn!("BPF pin path {} already released", self.path.display());
            return;
        }
        log::debug!("Unmounting BPF map pinning path {}", self.path.display());
        match self.kernel.unmount_bpf_fs(&self.path) {
            Ok(()) => log::debug!("Unmounted {}", self.path.display()),
            Err(err) => bpf_common::log_warning(
                "can't unmount pinned root. Try unmounting and removing it manually",
                err,
            ),
        }
        match bpf_fs::remove_pin_dir(&self.path) {
            Ok(()) => log::debug!("Removed {}", self.path.display()),
            Err(err) => bpf_common::log_warning(
                "can't remove pinned root. Try removing it manually",
                err,
            ),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Releases the pin path when dropped, unless [`PinPathGuard::keep`] was
/// called.
pub struct PinPathGuard {
    pin_path: Arc<PinPath>,
    armed: bool,
}

impl PinPathGuard {
    pub fn new(pin_path: PinPath) -> Self {
        Self {
            pin_path: Arc::new(pin_path),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        self.pin_path.path()
    }

    /// Hand over the pin path, which will be released by the new owner.
    pub fn keep(mut self) -> Arc<PinPath> {
        self.armed = false;
        self.pin_path.clone()
    }
}

impl Drop for PinPathGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pin_path.release();
        }
    }
}
