//! Setup of the eBPF tracers for a target process: resolution of the target,
//! inspection of its executable, selection of the applicable tracers and
//! their all-or-nothing attachment.

pub mod config;
pub mod error;
pub mod exec;
pub mod filter;
pub mod forward;
pub mod goexec;
pub mod output;
pub mod pin_path;
pub mod provider;
pub mod resolver;
pub mod shutdown;
pub mod tracer;

mod instrumenter;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{ConfigError, ConfigMap, RetryPolicy, TracerConfig};
pub use error::{InspectionError, ResolutionError, SetupError};
pub use exec::{ExecutableInfo, ServiceName};
pub use filter::PartialCoverage;
pub use goexec::{FuncOffsets, OffsetTable};
pub use output::{Batch, OutputQueue, Record};
pub use provider::{Environment, ProviderOutput, StartFn, TracerSet, tracer_provider};
pub use shutdown::{ShutdownSender, ShutdownSignal};
pub use tracer::{FunctionPrograms, ObjectSink, ProbeMap, Tracer};
