use std::io;

use bpf_common::{ProgramError, bpf_fs::BpfFsError, parsing::procfs::ProcfsError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("no running process matches {criteria}")]
    NotFound { criteria: String },
    #[error("reading process information")]
    Procfs(#[from] ProcfsError),
    #[error("target resolution cancelled")]
    Cancelled,
    #[error("no valid target found after rejecting {attempts} candidates")]
    RetriesExhausted { attempts: usize },
}

/// Hard failure reading an executable. A binary which is not written in Go
/// is not an error.
#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("reading executable {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("parsing executable {path}")]
    Parse {
        path: String,
        #[source]
        source: elf::ParseError,
    },
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("resolving target")]
    Resolution(#[from] ResolutionError),
    #[error("inspecting target executable")]
    Inspection(#[from] InspectionError),
    #[error("no instrumentable function found")]
    NoInstrumentableFunction,
    #[error("removing memlock limit")]
    Memlock(#[source] anyhow::Error),
    #[error("preparing BPF pin path")]
    Mount(#[from] BpfFsError),
    #[error("loading eBPF object for tracer {tracer}")]
    Load {
        tracer: &'static str,
        #[source]
        source: ProgramError,
    },
    #[error("rewriting constants for tracer {tracer}")]
    Constants {
        tracer: &'static str,
        #[source]
        source: ProgramError,
    },
    #[error("loading tracer {tracer} into the kernel")]
    KernelLoad {
        tracer: &'static str,
        #[source]
        source: ProgramError,
    },
    #[error("attaching tracer {tracer}")]
    Attach {
        tracer: &'static str,
        #[source]
        source: ProgramError,
    },
}

impl SetupError {
    /// Kernel verifier output, if a program was rejected by it.
    pub fn verifier_log(&self) -> Option<&str> {
        match self {
            SetupError::Load { source, .. }
            | SetupError::KernelLoad { source, .. }
            | SetupError::Attach { source, .. } => source.verifier_log(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_log_is_exposed() {
        let err = SetupError::KernelLoad {
            tracer: "nethttp",
            source: ProgramError::ProgramLoadError {
                program: "uprobe_ServeHTTP".to_string(),
                verifier_log: Some("invalid indirect read from stack".to_string()),
                program_error: "permission denied".into(),
            },
        };
        assert_eq!(err.verifier_log(), Some("invalid indirect read from stack"));
        assert_eq!(SetupError::NoInstrumentableFunction.verifier_log(), None);
    }
}
