//! Mounting and unmounting of the BPF file system used to pin maps.
use std::{
    fs::{self, DirBuilder, File},
    io::{self, BufReader},
    os::unix::fs::DirBuilderExt,
    path::Path,
};

use sys_mount::{Mount, UnmountFlags, unmount};
use thiserror::Error;

use crate::parsing::mountinfo::{MOUNTINFO_PATH, mount_fs_type};

const BPF: &str = "bpf";

#[derive(Error, Debug)]
pub enum BpfFsError {
    #[error("creating directory {path}")]
    CreateDir {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("removing directory {path}")]
    RemoveDir {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("reading /proc/self/mountinfo")]
    MountInfo(#[source] io::Error),
    #[error("{path} is already mounted with file system type {fs_type}")]
    OtherFileSystem { path: String, fs_type: String },
    #[error("mounting BPF file system in {path}")]
    Mount {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("unmounting {path}")]
    Unmount {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Mount a BPF file system on `path`. Nothing is done if it's already there.
pub fn mount_bpf_fs(path: &Path) -> Result<(), BpfFsError> {
    match current_fs_type(path)? {
        Some(fs_type) if fs_type == BPF => {
            log::debug!("BPF file system already mounted in {}", path.display());
            return Ok(());
        }
        Some(fs_type) => {
            return Err(BpfFsError::OtherFileSystem {
                path: path.display().to_string(),
                fs_type,
            });
        }
        None => {}
    }

    log::debug!("Mount BPF file system in {}", path.display());
    Mount::builder()
        .fstype(BPF)
        .mount(BPF, path)
        .map_err(|source| BpfFsError::Mount {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}

/// Forcefully unmount the file system mounted on `path`.
pub fn unmount_bpf_fs(path: &Path) -> Result<(), BpfFsError> {
    unmount(path, UnmountFlags::FORCE).map_err(|source| BpfFsError::Unmount {
        path: path.display().to_string(),
        source,
    })
}

/// Create `path` and its missing parents, accessible only by the owner.
pub fn create_pin_dir(path: &Path) -> Result<(), BpfFsError> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|source| BpfFsError::CreateDir {
            path: path.display().to_string(),
            source,
        })
}

/// Remove `path` and everything below it.
pub fn remove_pin_dir(path: &Path) -> Result<(), BpfFsError> {
    fs::remove_dir_all(path).map_err(|source| BpfFsError::RemoveDir {
        path: path.display().to_string(),
        source,
    })
}

fn current_fs_type(path: &Path) -> Result<Option<String>, BpfFsError> {
    let file = File::open(MOUNTINFO_PATH).map_err(BpfFsError::MountInfo)?;
    Ok(mount_fs_type(BufReader::new(file), path))
}
