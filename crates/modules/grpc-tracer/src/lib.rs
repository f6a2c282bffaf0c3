//! Tracer of Go gRPC servers and clients built on `google.golang.org/grpc`.
use async_trait::async_trait;
use bpf_common::{CollectionSpec, ConstValue, Constants, ProgramError};
use tracer_core::{
    ExecutableInfo, FunctionPrograms, ObjectSink, OffsetTable, OutputQueue, ProbeMap,
    ShutdownSignal, Tracer, TracerConfig,
    forward::{self, BatchConfig},
    goexec::field_constants,
};

pub const TRACER_NAME: &str = "grpc";

const EVENTS_MAP: &str = "events";
/// Size of the `grpc_request_trace` records of the events ring buffer.
const RECORD_SIZE: usize = 352;

const HANDLE_STREAM: &str = "google.golang.org/grpc.(*Server).handleStream";
const WRITE_STATUS: &str = "google.golang.org/grpc/internal/transport.(*http2Server).WriteStatus";
const CLIENT_INVOKE: &str = "google.golang.org/grpc.(*ClientConn).Invoke";

const FIELD_DEFAULTS: [(&str, u64); 9] = [
    ("grpc_stream_st_ptr_pos", 8),
    ("grpc_stream_method_ptr_pos", 80),
    ("grpc_status_s_pos", 0),
    ("grpc_status_code_ptr_pos", 40),
    ("grpc_st_remoteaddr_ptr_pos", 72),
    ("grpc_st_localaddr_ptr_pos", 56),
    ("tcp_addr_port_ptr_pos", 24),
    ("tcp_addr_ip_ptr_pos", 0),
    ("grpc_client_target_ptr_pos", 24),
];

pub struct GrpcTracer {
    config: TracerConfig,
    objects: ObjectSink,
}

impl GrpcTracer {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            config: config.clone(),
            objects: ObjectSink::default(),
        }
    }
}

#[async_trait]
impl Tracer for GrpcTracer {
    fn name(&self) -> &'static str {
        TRACER_NAME
    }

    fn load(&self) -> Result<CollectionSpec, ProgramError> {
        CollectionSpec::read(TRACER_NAME, &self.config.artifact_path(TRACER_NAME))
    }

    fn constants(&self, _exe: &ExecutableInfo, offsets: Option<&OffsetTable>) -> Constants {
        let mut constants = field_constants(offsets, &FIELD_DEFAULTS);
        constants.insert(
            "wakeup_data_bytes".to_string(),
            ConstValue::U32(self.config.wakeup_data_bytes(RECORD_SIZE)),
        );
        constants
    }

    fn object_sink(&mut self) -> &mut ObjectSink {
        &mut self.objects
    }

    fn go_probes(&self) -> ProbeMap {
        vec![
            (
                HANDLE_STREAM,
                FunctionPrograms::required(
                    "uprobe_server_handleStream",
                    "uprobe_server_handleStream_return",
                ),
            ),
            (
                WRITE_STATUS,
                FunctionPrograms {
                    required: true,
                    ..Default::default()
                }
                .start("uprobe_transport_writeStatus"),
            ),
            (
                CLIENT_INVOKE,
                FunctionPrograms::optional(
                    "uprobe_ClientConn_Invoke",
                    "uprobe_ClientConn_Invoke_return",
                ),
            ),
        ]
    }

    async fn run(self: Box<Self>, shutdown: ShutdownSignal, output: OutputQueue) {
        let batch = BatchConfig::from(&self.config);
        forward::run_ring_buffer(TRACER_NAME, self.objects, EVENTS_MAP, batch, shutdown, output)
            .await
    }
}
