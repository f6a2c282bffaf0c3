//! Discovery of the process to instrument.
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
};

use bpf_common::{
    Pid,
    parsing::procfs::{self, ProcfsError},
};
use regex::Regex;

use crate::error::ResolutionError;

/// A resolved target process and its executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableInfo {
    pub pid: Pid,
    /// `/proc/<pid>/exe`, valid also when the process runs in a container.
    pub exe_path: PathBuf,
    /// Executable path as seen by the target process.
    pub cmd_exe_path: PathBuf,
}

impl ExecutableInfo {
    pub fn new(pid: Pid, cmd_exe_path: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            exe_path: procfs::process_exe_link(pid),
            cmd_exe_path: cmd_exe_path.into(),
        }
    }

    /// Name under which the target is reported downstream.
    pub fn service_name(&self) -> ServiceName {
        ServiceName::from_path(&self.cmd_exe_path)
    }
}

/// Identifier of the instrumented service: the executable file name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What identifies the target process.
#[derive(Debug, Clone)]
pub enum Criteria {
    /// Executable path matches the regular expression.
    Exec(Regex),
    /// Process owns a socket listening on the port.
    Port(u16),
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criteria::Exec(regex) => write!(f, "executable {regex}"),
            Criteria::Port(port) => write!(f, "port {port}"),
        }
    }
}

/// OS level process lookup.
pub trait ProcessFinder: Send + Sync {
    /// Returns a running process matching `criteria` whose pid is not in
    /// `excluded`, or `None` when there isn't any.
    fn find(
        &self,
        criteria: &Criteria,
        excluded: &HashSet<Pid>,
    ) -> Result<Option<ExecutableInfo>, ResolutionError>;
}

/// Finds processes by scanning procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsFinder;

impl ProcessFinder for ProcfsFinder {
    fn find(
        &self,
        criteria: &Criteria,
        excluded: &HashSet<Pid>,
    ) -> Result<Option<ExecutableInfo>, ResolutionError> {
        let myself = Pid::this();
        let mut pids = procfs::get_running_processes()?;
        pids.sort_by_key(|pid| pid.as_raw());
        for pid in pids {
            if pid == myself || excluded.contains(&pid) {
                continue;
            }
            // Processes may exit while we scan, or belong to other users.
            let Some(image) = ignore_vanished(procfs::get_process_image(pid))? else {
                continue;
            };
            let matches = match criteria {
                Criteria::Exec(regex) => regex.is_match(&image.to_string_lossy()),
                Criteria::Port(port) => owns_listening_socket(pid, *port)?,
            };
            if matches {
                return Ok(Some(ExecutableInfo::new(pid, image)));
            }
        }
        Ok(None)
    }
}

/// Listening sockets are looked up in the network namespace of `pid`, which
/// may differ from the agent's one.
fn owns_listening_socket(pid: Pid, port: u16) -> Result<bool, ProcfsError> {
    let Some(sockets) = ignore_vanished(procfs::get_process_socket_inodes(pid))? else {
        return Ok(false);
    };
    if sockets.is_empty() {
        return Ok(false);
    }
    let listening = ignore_vanished(procfs::get_process_listening_inodes(pid, port))?;
    Ok(listening.is_some_and(|listening| !listening.is_disjoint(&sockets)))
}

fn ignore_vanished<T>(result: Result<T, ProcfsError>) -> Result<Option<T>, ProcfsError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ProcfsError::ReadFile { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}
