//! Tracer of goroutine creation and termination, used to follow requests
//! across goroutines.
use async_trait::async_trait;
use bpf_common::{CollectionSpec, ConstValue, Constants, ProgramError};
use tracer_core::{
    ExecutableInfo, FunctionPrograms, ObjectSink, OffsetTable, OutputQueue, ProbeMap,
    ShutdownSignal, Tracer, TracerConfig,
    forward::{self, BatchConfig},
};

pub const TRACER_NAME: &str = "goruntime";

const EVENTS_MAP: &str = "events";
const RECORD_SIZE: usize = 32;

pub struct GoRuntimeTracer {
    config: TracerConfig,
    objects: ObjectSink,
}

impl GoRuntimeTracer {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            config: config.clone(),
            objects: ObjectSink::default(),
        }
    }
}

#[async_trait]
impl Tracer for GoRuntimeTracer {
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

    // Neither function is required: the tracer only enriches the others.
    fn go_probes(&self) -> ProbeMap {
        vec![
            (
                "runtime.newproc1",
                FunctionPrograms::optional("uprobe_proc_newproc1", "uprobe_proc_newproc1_ret"),
            ),
            (
                "runtime.goexit1",
                FunctionPrograms::default().start("uprobe_proc_goexit1"),
            ),
        ]
    }

    async fn run(self: Box<Self>, shutdown: ShutdownSignal, output: OutputQueue) {
        let batch = BatchConfig::from(&self.config);
        forward::run_ring_buffer(TRACER_NAME, self.objects, EVENTS_MAP, batch, shutdown, output)
            .await
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::Pid;
    use tracer_core::test_utils::FakeKernel;

    use super::*;

    #[test]
    fn runtime_probes() {
        let probes = GoRuntimeTracer::new(&TracerConfig::default()).go_probes();
        assert!(probes.iter().all(|(name, programs)| {
            name.starts_with("runtime.") && !programs.required
        }));
    }

    #[test]
    fn wakeup_threshold() {
        let config = TracerConfig {
            wakeup_len: 8,
            ..Default::default()
        };
        let exe = ExecutableInfo::new(Pid::from_raw(3), "/srv/app");
        let constants = GoRuntimeTracer::new(&config).constants(&exe, None);
        assert_eq!(constants.len(), 1);
        assert_eq!(constants["wakeup_data_bytes"], ConstValue::U32(256));
    }

    #[tokio::test]
    async fn missing_ring_buffer_still_stops_on_shutdown() {
        let kernel = FakeKernel::default();
        let mut tracer = Box::new(GoRuntimeTracer::new(&TracerConfig::default()));
        tracer.object_sink().assign(kernel.collection(TRACER_NAME));

        let (queue, _rx) = OutputQueue::new();
        let (tx, shutdown) = ShutdownSignal::new();
        let task = tokio::spawn(tracer.run(shutdown, queue));
        tx.send_signal();
        task.await.unwrap();
    }
}
