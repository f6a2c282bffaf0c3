//! Tracers of Go HTTP servers and clients built on `net/http`.
//!
//! The eBPF object probes the request handler entry and exit, reading the
//! request fields at the offsets given by the `*_ptr_pos` constants.
use async_trait::async_trait;
use bpf_common::{CollectionSpec, ConstValue, Constants, ProgramError};
use tracer_core::{
    ExecutableInfo, FunctionPrograms, ObjectSink, OffsetTable, OutputQueue, ProbeMap,
    ShutdownSignal, Tracer, TracerConfig,
    forward::{self, BatchConfig},
    goexec::field_constants,
};

mod gin;

pub use gin::GinTracer;

pub const TRACER_NAME: &str = "nethttp";

const ARTIFACT: &str = "nethttp";
const EVENTS_MAP: &str = "events";
/// Size of the `http_request_trace` records of the events ring buffer.
const RECORD_SIZE: usize = 496;

/// `net/http` layout of Go 1.20 on 64 bit targets.
const FIELD_DEFAULTS: [(&str, u64); 8] = [
    ("method_ptr_pos", 0),
    ("url_ptr_pos", 16),
    ("req_header_ptr_pos", 56),
    ("content_length_ptr_pos", 88),
    ("host_ptr_pos", 128),
    ("remoteaddr_ptr_pos", 176),
    ("path_ptr_pos", 56),
    ("status_ptr_pos", 120),
];

/// Go functions probed by the `net/http` object.
mod funcs {
    pub const SERVE_HTTP: &str = "net/http.HandlerFunc.ServeHTTP";
    pub const WRITE_HEADER: &str = "net/http.(*response).WriteHeader";
    pub const ROUND_TRIP: &str = "net/http.(*Transport).roundTrip";
}

pub struct HttpTracer {
    config: TracerConfig,
    objects: ObjectSink,
}

impl HttpTracer {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            config: config.clone(),
            objects: ObjectSink::default(),
        }
    }

    fn load_artifact(&self, name: &str) -> Result<CollectionSpec, ProgramError> {
        let path = self.config.artifact_path(ARTIFACT);
        log::debug!("[{name}] reading {}", path.display());
        CollectionSpec::read(name, &path)
    }

    fn http_constants(&self, offsets: Option<&OffsetTable>) -> Constants {
        let mut constants = field_constants(offsets, &FIELD_DEFAULTS);
        constants.insert(
            "wakeup_data_bytes".to_string(),
            ConstValue::U32(self.config.wakeup_data_bytes(RECORD_SIZE)),
        );
        constants
    }

    async fn forward(
        self,
        name: &'static str,
        shutdown: ShutdownSignal,
        output: OutputQueue,
    ) {
        let batch = BatchConfig::from(&self.config);
        forward::run_ring_buffer(name, self.objects, EVENTS_MAP, batch, shutdown, output).await
    }
}

#[async_trait]
impl Tracer for HttpTracer {
    fn name(&self) -> &'static str {
        TRACER_NAME
    }

    fn load(&self) -> Result<CollectionSpec, ProgramError> {
        self.load_artifact(TRACER_NAME)
    }

    fn constants(&self, _exe: &ExecutableInfo, offsets: Option<&OffsetTable>) -> Constants {
        self.http_constants(offsets)
    }

    fn object_sink(&mut self) -> &mut ObjectSink {
        &mut self.objects
    }

    fn go_probes(&self) -> ProbeMap {
        vec![
            (
                funcs::SERVE_HTTP,
                FunctionPrograms::required("uprobe_ServeHTTP", "uprobe_ServeHTTP_return"),
            ),
            (
                funcs::WRITE_HEADER,
                FunctionPrograms {
                    required: true,
                    ..Default::default()
                }
                .start("uprobe_WriteHeader"),
            ),
            (
                funcs::ROUND_TRIP,
                FunctionPrograms::optional("uprobe_roundTrip", "uprobe_roundTrip_return"),
            ),
        ]
    }

    async fn run(self: Box<Self>, shutdown: ShutdownSignal, output: OutputQueue) {
        (*self).forward(TRACER_NAME, shutdown, output).await
    }
}
