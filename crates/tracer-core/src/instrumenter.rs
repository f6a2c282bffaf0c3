//! Loads a tracer into the kernel and attaches its programs.
use std::path::Path;

use bpf_common::{Collection, Kernel, ProgramError};

use crate::{
    error::SetupError,
    exec::ExecutableInfo,
    filter::PartialCoverage,
    goexec::OffsetTable,
    tracer::{ProbeMap, Tracer},
};

pub(crate) struct Instrumenter<'a> {
    pub kernel: &'a dyn Kernel,
    pub pin_path: &'a Path,
    pub exe: &'a ExecutableInfo,
    pub offsets: Option<&'a OffsetTable>,
}

impl Instrumenter<'_> {
    /// Load, configure and attach `tracer`. On success the tracer owns its
    /// kernel objects. On failure everything attached so far is dropped,
    /// which detaches it.
    ///
    /// Returns the return probes which couldn't be placed.
    pub fn instrument(&self, tracer: &mut dyn Tracer) -> Result<Option<PartialCoverage>, SetupError> {
        let name = tracer.name();
        log::debug!("[{name}] loading eBPF object");
        let mut spec = tracer
            .load()
            .map_err(|source| SetupError::Load { tracer: name, source })?;

        log::debug!("[{name}] rewriting constants");
        spec.rewrite_constants(tracer.constants(self.exe, self.offsets))
            .map_err(|source| SetupError::Constants { tracer: name, source })?;

        log::debug!("[{name}] loading into the kernel");
        let mut collection = self
            .kernel
            .load(&spec, self.pin_path)
            .map_err(|source| SetupError::KernelLoad { tracer: name, source })?;

        let attach_err = |source| SetupError::Attach { tracer: name, source };
        let missing_returns = self
            .goprobes(collection.as_mut(), &tracer.go_probes())
            .map_err(attach_err)?;
        self.kprobes(collection.as_mut(), &tracer.kprobes())
            .map_err(attach_err)?;
        for program in tracer.socket_filters() {
            log::debug!("[{name}] attaching socket filter {program}");
            let closer = collection
                .attach_socket_filter(program)
                .map_err(attach_err)?;
            tracer.add_closer(vec![closer]);
        }
        tracer.object_sink().assign(collection);

        if missing_returns.is_empty() {
            return Ok(None);
        }
        log::warn!(
            "[{name}] partial coverage, no return sites found for: {}",
            missing_returns.join(", ")
        );
        Ok(Some(PartialCoverage {
            tracer: name,
            missing: missing_returns,
        }))
    }

    /// Go functions are probed at their entry and at each of their return
    /// instructions. Functions missing from the offset table are skipped.
    fn goprobes(
        &self,
        collection: &mut dyn Collection,
        probes: &ProbeMap,
    ) -> Result<Vec<String>, ProgramError> {
        let Some(offsets) = self.offsets else {
            return Ok(Vec::new());
        };
        let mut missing_returns = Vec::new();
        for (function, programs) in probes {
            let Some(func) = offsets.funcs.get(*function) else {
                continue;
            };
            if let Some(start) = programs.start {
                log::debug!("attaching {start} to {function} at {:#x}", func.start);
                collection.attach_uprobe(start, &self.exe.exe_path, func.start)?;
            }
            if let Some(end) = programs.end {
                if func.returns.is_empty() {
                    missing_returns.push(format!("{function} (return)"));
                }
                for offset in &func.returns {
                    log::debug!("attaching {end} to {function} return at {offset:#x}");
                    collection.attach_uprobe(end, &self.exe.exe_path, *offset)?;
                }
            }
        }
        Ok(missing_returns)
    }

    fn kprobes(&self, collection: &mut dyn Collection, probes: &ProbeMap) -> Result<(), ProgramError> {
        for (symbol, programs) in probes {
            if let Some(start) = programs.start {
                log::debug!("attaching kprobe {start} to {symbol}");
                collection.attach_kprobe(start, symbol)?;
            }
            if let Some(end) = programs.end {
                log::debug!("attaching kretprobe {end} to {symbol}");
                collection.attach_kprobe(end, symbol)?;
            }
        }
        Ok(())
    }
}

/// Verifier rejections come with the kernel log explaining them, which is
/// printed verbatim.
pub(crate) fn print_verifier_error_info(err: &SetupError) {
    if let Some(log) = err.verifier_log() {
        eprintln!("Error Log:\n {log}");
    }
}
