use async_trait::async_trait;
use bpf_common::{CollectionSpec, Constants, ProgramError};
use tracer_core::{
    ExecutableInfo, FunctionPrograms, ObjectSink, OffsetTable, OutputQueue, ProbeMap,
    ShutdownSignal, Tracer, TracerConfig,
};

use crate::HttpTracer;

pub const TRACER_NAME: &str = "gin";

const HANDLE_HTTP_REQUEST: &str = "github.com/gin-gonic/gin.(*Engine).handleHTTPRequest";

/// Gin routes requests without going through `ServeHTTP` handlers, so its
/// engine entry point is probed with the `net/http` programs.
pub struct GinTracer {
    inner: HttpTracer,
}

impl GinTracer {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            inner: HttpTracer::new(config),
        }
    }
}

#[async_trait]
impl Tracer for GinTracer {
    fn name(&self) -> &'static str {
        TRACER_NAME
    }

    fn load(&self) -> Result<CollectionSpec, ProgramError> {
        self.inner.load_artifact(TRACER_NAME)
    }

    fn constants(&self, _exe: &ExecutableInfo, offsets: Option<&OffsetTable>) -> Constants {
        self.inner.http_constants(offsets)
    }

    fn object_sink(&mut self) -> &mut ObjectSink {
        self.inner.object_sink()
    }

    fn go_probes(&self) -> ProbeMap {
        vec![(
            HANDLE_HTTP_REQUEST,
            FunctionPrograms::required("uprobe_ServeHTTP", "uprobe_ServeHTTP_return"),
        )]
    }

    async fn run(self: Box<Self>, shutdown: ShutdownSignal, output: OutputQueue) {
        let Self { inner } = *self;
        inner.forward(TRACER_NAME, shutdown, output).await
    }
}

#[cfg(test)]
mod tests {
    use tracer_core::test_utils::offsets;

    use super::*;

    #[test]
    fn probes_the_engine_with_http_programs() {
        let tracer = GinTracer::new(&TracerConfig::default());
        let probes = tracer.go_probes();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].0, HANDLE_HTTP_REQUEST);
        assert!(probes[0].1.required);
        assert_eq!(probes[0].1.start, Some("uprobe_ServeHTTP"));
    }

    #[test]
    fn shares_http_constants() {
        let config = TracerConfig::default();
        let exe = ExecutableInfo::new(bpf_common::Pid::from_raw(7), "/srv/gin");
        let table = offsets(&[HANDLE_HTTP_REQUEST]);
        assert_eq!(
            GinTracer::new(&config).constants(&exe, Some(&table)),
            HttpTracer::new(&config).constants(&exe, Some(&table))
        );
    }
}
