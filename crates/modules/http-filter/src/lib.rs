//! Language agnostic HTTP tracer.
//!
//! Kernel probes follow the lifetime of TCP connections while a socket
//! filter parses HTTP traffic on them. It is the only tracer used when the
//! target isn't a Go program or when instrumenting the whole system.
use async_trait::async_trait;
use bpf_common::{CollectionSpec, ConstValue, Constants, ProgramError};
use tracer_core::{
    ExecutableInfo, FunctionPrograms, ObjectSink, OffsetTable, OutputQueue, ProbeMap,
    ShutdownSignal, Tracer, TracerConfig,
    forward::{self, BatchConfig},
};

pub const TRACER_NAME: &str = "httpfltr";

const EVENTS_MAP: &str = "events";
/// Size of `http_info_t`.
const RECORD_SIZE: usize = 248;

pub struct HttpFilter {
    config: TracerConfig,
    objects: ObjectSink,
}

impl HttpFilter {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            config: config.clone(),
            objects: ObjectSink::default(),
        }
    }
}

#[async_trait]
impl Tracer for HttpFilter {
    fn name(&self) -> &'static str {
        TRACER_NAME
    }

    fn load(&self) -> Result<CollectionSpec, ProgramError> {
        CollectionSpec::read(TRACER_NAME, &self.config.artifact_path(TRACER_NAME))
    }

    fn constants(&self, _exe: &ExecutableInfo, _offsets: Option<&OffsetTable>) -> Constants {
        Constants::from([(
            "wakeup_data_bytes".to_string(),
            ConstValue::U32(self.config.wakeup_data_bytes(RECORD_SIZE)),
        )])
    }

    fn object_sink(&mut self) -> &mut ObjectSink {
        &mut self.objects
    }

    fn kprobes(&self) -> ProbeMap {
        let entry = |program| FunctionPrograms::default().start(program);
        let exit = |program| FunctionPrograms::default().end(program);
        vec![
            // accept and connect capture the socket information
            ("sys_accept4", exit("kretprobe_sys_accept4")),
            ("sock_alloc", exit("kretprobe_sock_alloc")),
            ("tcp_rcv_established", entry("kprobe_tcp_rcv_established")),
            ("sys_connect", exit("kretprobe_sys_connect")),
            ("tcp_connect", entry("kprobe_tcp_connect")),
            // send and receive see the request and response payloads
            ("tcp_sendmsg", entry("kprobe_tcp_sendmsg")),
            (
                "tcp_recvmsg",
                entry("kprobe_tcp_recvmsg").end("kretprobe_tcp_recvmsg"),
            ),
            ("sys_exit", entry("kprobe_sys_exit")),
        ]
    }

    fn socket_filters(&self) -> Vec<&'static str> {
        vec!["socket__http_filter"]
    }

    async fn run(self: Box<Self>, shutdown: ShutdownSignal, output: OutputQueue) {
        let batch = BatchConfig::from(&self.config);
        forward::run_ring_buffer(TRACER_NAME, self.objects, EVENTS_MAP, batch, shutdown, output)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tracer_core::test_utils::FakeKernel;

    use super::*;

    #[test]
    fn no_go_functions() {
        let filter = HttpFilter::new(&TracerConfig::default());
        assert!(filter.go_probes().is_empty());
        assert_eq!(filter.socket_filters(), vec!["socket__http_filter"]);
    }

    #[test]
    fn recvmsg_is_probed_on_entry_and_exit() {
        let kprobes = HttpFilter::new(&TracerConfig::default()).kprobes();
        let (_, recvmsg) = kprobes
            .iter()
            .find(|(symbol, _)| *symbol == "tcp_recvmsg")
            .unwrap();
        assert_eq!(recvmsg.start, Some("kprobe_tcp_recvmsg"));
        assert_eq!(recvmsg.end, Some("kretprobe_tcp_recvmsg"));
        assert!(kprobes.iter().all(|(_, programs)| !programs.required));
    }

    #[test]
    fn wakeup_uses_http_info_size() {
        let config = TracerConfig {
            wakeup_len: 4,
            ..Default::default()
        };
        let exe = ExecutableInfo::new(bpf_common::Pid::from_raw(1), "/usr/bin/nginx");
        assert_eq!(
            HttpFilter::new(&config).constants(&exe, None)["wakeup_data_bytes"],
            ConstValue::U32(992)
        );
    }

    #[tokio::test]
    async fn pending_events_are_flushed_on_shutdown() {
        let kernel = FakeKernel::default();
        kernel.push_ring_events(EVENTS_MAP, vec![Bytes::from_static(b"GET / HTTP/1.1")]);
        let config = TracerConfig {
            batch_length: 10,
            batch_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let mut filter = Box::new(HttpFilter::new(&config));
        filter.object_sink().assign(kernel.collection(TRACER_NAME));

        let (queue, mut rx) = OutputQueue::new();
        let (tx, shutdown) = ShutdownSignal::new();
        let task = tokio::spawn(filter.run(shutdown, queue));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_signal();
        task.await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].tracer, TRACER_NAME);
    }
}
