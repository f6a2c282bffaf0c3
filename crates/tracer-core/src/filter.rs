//! Selection of the tracers which can work on the inspected target.
use std::collections::HashSet;

use crate::{error::SetupError, goexec::OffsetTable, tracer::Tracer};

/// Instrumentation a tracer asked for but won't get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialCoverage {
    pub tracer: &'static str,
    pub missing: Vec<String>,
}

/// Go functions of all the tracers, without duplicates, in first seen order.
/// The executable is inspected once for all of them.
pub fn all_function_names(tracers: &[Box<dyn Tracer>]) -> Vec<String> {
    let mut seen = HashSet::new();
    tracers
        .iter()
        .flat_map(|tracer| tracer.go_probes())
        .filter(|(name, _)| seen.insert(*name))
        .map(|(name, _)| name.to_string())
        .collect()
}

pub struct Selection {
    pub tracers: Vec<Box<dyn Tracer>>,
    pub coverage: Vec<PartialCoverage>,
}

/// Keeps the tracers whose required functions were all found. Without Go
/// offsets, or when running system wide, only `fallback` is used.
pub fn select_tracers(
    tracers: Vec<Box<dyn Tracer>>,
    fallback: Box<dyn Tracer>,
    offsets: Option<&OffsetTable>,
    system_wide: bool,
) -> Result<Selection, SetupError> {
    let offsets = match offsets {
        Some(offsets) if !system_wide => offsets,
        _ => {
            return Ok(Selection {
                tracers: vec![fallback],
                coverage: Vec::new(),
            });
        }
    };

    let mut coverage = Vec::new();
    let selected: Vec<Box<dyn Tracer>> = tracers
        .into_iter()
        .filter(|tracer| {
            let probes = tracer.go_probes();
            let missing_required = probes
                .iter()
                .find(|(name, programs)| programs.required && !offsets.contains(name));
            if let Some((name, _)) = missing_required {
                log::debug!("[{}] disabled: {name} not found", tracer.name());
                return false;
            }
            let missing: Vec<String> = probes
                .iter()
                .filter(|(name, _)| !offsets.contains(name))
                .map(|(name, _)| name.to_string())
                .collect();
            if !missing.is_empty() {
                log::warn!(
                    "[{}] partial coverage, functions not found: {}",
                    tracer.name(),
                    missing.join(", ")
                );
                coverage.push(PartialCoverage {
                    tracer: tracer.name(),
                    missing,
                });
            }
            true
        })
        .collect();

    if selected.is_empty() {
        return Err(SetupError::NoInstrumentableFunction);
    }
    Ok(Selection {
        tracers: selected,
        coverage,
    })
}
