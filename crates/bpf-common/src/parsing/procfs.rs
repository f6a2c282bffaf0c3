//! Utility functions used to extract data from procfs

use nix::unistd::Pid;
use procfs::{ProcError, net::TcpState, process::Process};
use std::{
    collections::HashSet,
    fs, io,
    net::SocketAddr,
    path::PathBuf,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading failed {path}")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("reading network tables")]
    NetTables(#[from] ProcError),
}

/// Path which always points to the executable image of a process, also when
/// the process lives in a different mount namespace.
pub fn process_exe_link(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/exe"))
}

/// Returns the path of the executable image of a given process.
pub fn get_process_image(pid: Pid) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/exe"))
}

/// Return where a link is pointing to.
fn read_link(path: &str) -> Result<PathBuf, ProcfsError> {
    fs::read_link(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.to_string(),
    })
}

/// Returns the pids of all the processes currently running.
pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    let entries = fs::read_dir("/proc").map_err(|source| ProcfsError::ReadFile {
        source,
        path: "/proc".to_string(),
    })?;
    Ok(entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .map(Pid::from_raw)
        .collect())
}

/// Returns the inodes of the TCP sockets listening on `port`, both IPv4 and
/// IPv6, in the network namespace of a given process.
pub fn get_process_listening_inodes(pid: Pid, port: u16) -> Result<HashSet<u64>, ProcfsError> {
    let net_error = |err| net_tables_error(pid, err);
    let process = Process::new(pid.as_raw()).map_err(net_error)?;
    let mut entries = process.tcp().map_err(net_error)?;
    // IPv6 may be disabled in the namespace.
    entries.extend(process.tcp6().unwrap_or_default());
    Ok(listening_inodes(
        entries
            .into_iter()
            .map(|entry| (entry.state, entry.local_address, entry.inode)),
        port,
    ))
}

fn listening_inodes(
    entries: impl IntoIterator<Item = (TcpState, SocketAddr, u64)>,
    port: u16,
) -> HashSet<u64> {
    entries
        .into_iter()
        .filter(|(state, local, _)| *state == TcpState::Listen && local.port() == port)
        .map(|(_, _, inode)| inode)
        .collect()
}

/// Processes exiting during the scan are reported like any other unreadable
/// procfs file.
fn net_tables_error(pid: Pid, err: ProcError) -> ProcfsError {
    match err {
        ProcError::NotFound(_) | ProcError::PermissionDenied(_) => ProcfsError::ReadFile {
            source: io::Error::other(err),
            path: format!("/proc/{pid}/net/tcp"),
        },
        err => ProcfsError::NetTables(err),
    }
}

/// Returns the inodes of the sockets opened by a given process.
pub fn get_process_socket_inodes(pid: Pid) -> Result<HashSet<u64>, ProcfsError> {
    let path = format!("/proc/{pid}/fd");
    let entries = fs::read_dir(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(entries
        .filter_map(Result::ok)
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .filter_map(|target| socket_inode(&target.to_string_lossy()))
        .collect())
}

/// Parses the inode out of a `socket:[<inode>]` fd link.
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
