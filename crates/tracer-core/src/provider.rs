//! Setup of all the tracers for a target, producing the tasks to run them.
use std::sync::Arc;

use bpf_common::{AyaKernel, Kernel, Pid, trace_pipe};
use futures::{FutureExt, future::BoxFuture};

use crate::{
    config::TracerConfig,
    error::SetupError,
    exec::{ProcessFinder, ProcfsFinder, ServiceName},
    filter::{self, PartialCoverage},
    goexec::{GoElfInspector, OffsetInspector},
    instrumenter::{Instrumenter, print_verifier_error_info},
    output::OutputQueue,
    pin_path::{PinPath, PinPathGuard},
    resolver,
    shutdown::ShutdownSignal,
    tracer::Tracer,
};

/// A task to be spawned by the caller. Every task runs until the shutdown
/// signal is received.
pub type StartFn = Box<dyn FnOnce(ShutdownSignal, OutputQueue) -> BoxFuture<'static, ()> + Send>;

/// The system the agent runs on.
pub struct Environment {
    pub kernel: Arc<dyn Kernel>,
    pub finder: Box<dyn ProcessFinder>,
    pub inspector: Box<dyn OffsetInspector>,
    /// Pin paths are keyed by the agent pid.
    pub pid: Pid,
}

impl Environment {
    pub fn system() -> Self {
        Self {
            kernel: Arc::new(AyaKernel),
            finder: Box::new(ProcfsFinder),
            inspector: Box::new(GoElfInspector),
            pid: Pid::this(),
        }
    }
}

/// The available tracers. `fallback` replaces all the others when the
/// target can't be inspected.
pub struct TracerSet {
    pub go: Vec<Box<dyn Tracer>>,
    pub fallback: Box<dyn Tracer>,
}

pub struct ProviderOutput {
    /// The pin path teardown task first, then one task per tracer.
    pub tasks: Vec<StartFn>,
    pub service: ServiceName,
    pub coverage: Vec<PartialCoverage>,
}

/// Resolve the target, select the tracers which apply to it and attach
/// them. Either every selected tracer is attached or none is, and the pin
/// path is released on failure.
pub async fn tracer_provider(
    config: &TracerConfig,
    tracers: TracerSet,
    env: &Environment,
    mut shutdown: ShutdownSignal,
) -> Result<ProviderOutput, SetupError> {
    let functions = filter::all_function_names(&tracers.go);
    let resolved = resolver::resolve(
        config,
        &functions,
        env.finder.as_ref(),
        env.inspector.as_ref(),
        &mut shutdown,
    )
    .await?;

    let selection = filter::select_tracers(
        tracers.go,
        tracers.fallback,
        resolved.offsets.as_ref(),
        config.system_wide,
    )?;
    let mut coverage = selection.coverage;
    let mut selected = selection.tracers;
    let names: Vec<&str> = selected.iter().map(|t| t.name()).collect();
    log::info!("Selected tracers: {}", names.join(", "));

    env.kernel.remove_memlock().map_err(SetupError::Memlock)?;
    let guard = PinPathGuard::new(PinPath::mount(
        env.kernel.clone(),
        &config.bpf_base_dir,
        env.pid,
    )?);

    if config.system_wide {
        log::info!("system wide instrumentation");
    }

    let instrumenter = Instrumenter {
        kernel: env.kernel.as_ref(),
        pin_path: guard.path(),
        exe: &resolved.exe,
        offsets: resolved.offsets.as_ref(),
    };
    match attach_all(&instrumenter, &mut selected) {
        Ok(gaps) => coverage.extend(gaps),
        Err(err) => {
            print_verifier_error_info(&err);
            // Detach everything, then release the pin path with `guard`.
            drop(selected);
            return Err(err);
        }
    }
    let pin_path = guard.keep();

    let trace_pipe = config.bpf_debug.then(trace_pipe::start);
    let mut tasks: Vec<StartFn> = vec![Box::new(
        move |mut shutdown: ShutdownSignal, _output: OutputQueue| {
            async move {
                shutdown.recv().await;
                drop(trace_pipe);
                pin_path.release();
            }
            .boxed()
        },
    )];
    tasks.extend(selected.into_iter().map(|tracer| {
        Box::new(move |shutdown: ShutdownSignal, output: OutputQueue| tracer.run(shutdown, output))
            as StartFn
    }));

    Ok(ProviderOutput {
        tasks,
        service: resolved.service,
        coverage,
    })
}

fn attach_all(
    instrumenter: &Instrumenter<'_>,
    tracers: &mut [Box<dyn Tracer>],
) -> Result<Vec<PartialCoverage>, SetupError> {
    let mut gaps = Vec::new();
    for tracer in tracers {
        gaps.extend(instrumenter.instrument(tracer.as_mut())?);
    }
    Ok(gaps)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use regex::Regex;

    use super::*;
    use crate::{
        config::RetryPolicy,
        error::ResolutionError,
        exec::ExecutableInfo,
        goexec::OffsetTable,
        test_utils::{
            Attachment, FailAt, FakeFinder, FakeInspector, FakeKernel, FakeTracer, offsets,
            temp_dir,
        },
        tracer::FunctionPrograms,
    };

    const AGENT_PID: i32 = 4242;
    const HTTP_FUNC: &str = "net/http.handler";
    const GRPC_FUNC: &str = "google.golang.org/grpc.(*Server).handleStream";

    fn env(kernel: &FakeKernel, finder: FakeFinder, inspector: FakeInspector) -> Environment {
        Environment {
            kernel: kernel.arc(),
            finder: Box::new(finder),
            inspector: Box::new(inspector),
            pid: Pid::from_raw(AGENT_PID),
        }
    }

    fn exec_config(base: &Path) -> TracerConfig {
        TracerConfig {
            exec: Some(Regex::new("myapp").unwrap()),
            bpf_base_dir: base.to_path_buf(),
            ..Default::default()
        }
    }

    fn myapp() -> FakeFinder {
        FakeFinder::new([ExecutableInfo::new(Pid::from_raw(100), "/opt/myapp")])
    }

    fn nethttp() -> FakeTracer {
        FakeTracer::new("nethttp")
            .go_probe(
                HTTP_FUNC,
                FunctionPrograms::required("uprobe_ServeHTTP", "uprobe_ServeHTTP_return"),
            )
            .constant("wakeup_data_bytes", 0u32)
            .event(b"GET /")
    }

    fn grpc() -> FakeTracer {
        FakeTracer::new("grpc").go_probe(
            GRPC_FUNC,
            FunctionPrograms::required("uprobe_server_handleStream", "uprobe_server_handleStream_return"),
        )
    }

    fn httpfltr() -> Box<dyn Tracer> {
        Box::new(
            FakeTracer::new("httpfltr")
                .kprobe("tcp_connect", FunctionPrograms::default().start("kprobe_tcp_connect"))
                .kprobe("sys_accept4", FunctionPrograms::default().end("kretprobe_sys_accept4"))
                .socket_filter("socket__http_filter"),
        )
    }

    fn tracer_set(go: Vec<FakeTracer>) -> TracerSet {
        TracerSet {
            go: go.into_iter().map(|t| Box::new(t) as Box<dyn Tracer>).collect(),
            fallback: httpfltr(),
        }
    }

    fn pin_path(base: &Path) -> PathBuf {
        base.join(AGENT_PID.to_string())
    }

    fn loaded(kernel: &FakeKernel) -> Vec<String> {
        kernel.state().loads.iter().map(|(name, ..)| name.clone()).collect()
    }

    fn assert_nothing_left(kernel: &FakeKernel, base: &Path) {
        assert_eq!(kernel.live_attachments(), 0);
        assert!(kernel.state().mounted.is_empty());
        assert!(!pin_path(base).exists());
    }

    async fn provide(
        config: &TracerConfig,
        tracers: TracerSet,
        env: &Environment,
    ) -> Result<ProviderOutput, SetupError> {
        let (_tx, shutdown) = ShutdownSignal::new();
        tracer_provider(config, tracers, env, shutdown).await
    }

    #[tokio::test]
    async fn go_http_target() {
        let base = temp_dir("provider_http");
        let kernel = FakeKernel::default();
        let inspector = FakeInspector::default().with(100, offsets(&[HTTP_FUNC, "runtime.gcStart"]));
        let env = env(&kernel, myapp(), inspector);
        let output = provide(&exec_config(&base), tracer_set(vec![nethttp(), grpc()]), &env)
            .await
            .unwrap();

        assert_eq!(output.tasks.len(), 2);
        assert_eq!(output.service.as_str(), "myapp");
        assert!(output.coverage.is_empty());
        assert_eq!(loaded(&kernel), vec!["nethttp"]);
        assert_eq!(kernel.state().loads[0].2, pin_path(&base));
        assert_eq!(
            kernel.attachments(),
            vec![
                Attachment::Uprobe {
                    program: "uprobe_ServeHTTP".to_string(),
                    target: PathBuf::from("/proc/100/exe"),
                    offset: 0x1000,
                },
                Attachment::Uprobe {
                    program: "uprobe_ServeHTTP_return".to_string(),
                    target: PathBuf::from("/proc/100/exe"),
                    offset: 0x1040,
                },
            ]
        );
        assert!(kernel.is_mounted(&pin_path(&base)));
    }

    #[tokio::test]
    async fn tasks_run_until_shutdown_then_release_pin_path() {
        let base = temp_dir("provider_run");
        let kernel = FakeKernel::default();
        let inspector = FakeInspector::default().with(100, offsets(&[HTTP_FUNC]));
        let env = env(&kernel, myapp(), inspector);
        let output = provide(&exec_config(&base), tracer_set(vec![nethttp()]), &env)
            .await
            .unwrap();

        let (queue, mut rx) = OutputQueue::new();
        let (tx, shutdown) = ShutdownSignal::new();
        let handles: Vec<_> = output
            .tasks
            .into_iter()
            .map(|task| tokio::spawn(task(shutdown.clone(), queue.clone())))
            .collect();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].tracer, "nethttp");
        assert_eq!(batch[0].payload.as_ref(), b"GET /");
        assert_eq!(kernel.live_attachments(), 2);

        tx.send_signal();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_nothing_left(&kernel, &base);
        assert_eq!(kernel.state().unmounts, 1);
    }

    #[tokio::test]
    async fn go_proxy_on_port_is_skipped() {
        let base = temp_dir("provider_port");
        let kernel = FakeKernel::default();
        let finder = FakeFinder::new([
            ExecutableInfo::new(Pid::from_raw(10), "/usr/bin/proxy"),
            ExecutableInfo::new(Pid::from_raw(20), "/srv/backend"),
        ]);
        let inspector = FakeInspector::default()
            .with(10, offsets(&["runtime.main"]))
            .with(20, offsets(&[HTTP_FUNC]));
        let env = env(&kernel, finder, inspector);
        let config = TracerConfig {
            port: Some(8080),
            bpf_base_dir: base.clone(),
            retry: RetryPolicy::unbounded(std::time::Duration::ZERO),
            ..Default::default()
        };
        let output = provide(&config, tracer_set(vec![nethttp(), grpc()]), &env)
            .await
            .unwrap();
        assert_eq!(output.service.as_str(), "backend");
        assert_eq!(loaded(&kernel), vec!["nethttp"]);
    }

    #[tokio::test]
    async fn system_wide_attaches_only_the_fallback() {
        let base = temp_dir("provider_system_wide");
        let kernel = FakeKernel::default();
        let inspector = FakeInspector::default().with(100, offsets(&[HTTP_FUNC, GRPC_FUNC]));
        let env = env(&kernel, myapp(), inspector);
        let config = TracerConfig {
            system_wide: true,
            ..exec_config(&base)
        };
        let output = provide(&config, tracer_set(vec![nethttp(), grpc()]), &env)
            .await
            .unwrap();
        assert_eq!(output.tasks.len(), 2);
        assert_eq!(loaded(&kernel), vec!["httpfltr"]);
        assert_eq!(
            kernel.attachments(),
            vec![
                Attachment::Kprobe {
                    program: "kprobe_tcp_connect".to_string(),
                    symbol: "tcp_connect".to_string(),
                },
                Attachment::Kprobe {
                    program: "kretprobe_sys_accept4".to_string(),
                    symbol: "sys_accept4".to_string(),
                },
                Attachment::SocketFilter {
                    program: "socket__http_filter".to_string(),
                },
            ]
        );
        assert_eq!(kernel.live_attachments(), 3);
    }

    #[tokio::test]
    async fn not_go_attaches_only_the_fallback() {
        let base = temp_dir("provider_not_go");
        let kernel = FakeKernel::default();
        let env = env(&kernel, myapp(), FakeInspector::default());
        provide(&exec_config(&base), tracer_set(vec![nethttp(), grpc()]), &env)
            .await
            .unwrap();
        assert_eq!(loaded(&kernel), vec!["httpfltr"]);
    }

    #[tokio::test]
    async fn no_instrumentable_function() {
        let base = temp_dir("provider_none");
        let kernel = FakeKernel::default();
        let inspector = FakeInspector::default().with(100, offsets(&["runtime.main"]));
        let env = env(&kernel, myapp(), inspector);
        let err = provide(&exec_config(&base), tracer_set(vec![nethttp(), grpc()]), &env)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::NoInstrumentableFunction));
        assert!(loaded(&kernel).is_empty());
        assert_nothing_left(&kernel, &base);
    }

    #[tokio::test]
    async fn target_not_found() {
        let base = temp_dir("provider_not_found");
        let kernel = FakeKernel::default();
        let env = env(&kernel, FakeFinder::default(), FakeInspector::default());
        let err = provide(&exec_config(&base), tracer_set(vec![nethttp()]), &env)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SetupError::Resolution(ResolutionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn any_failure_leaves_nothing_attached() {
        struct Case {
            kernel: FakeKernel,
            grpc: FakeTracer,
            check: fn(&SetupError) -> bool,
        }
        let cases = [
            Case {
                kernel: FakeKernel::default(),
                grpc: grpc().failing_load(),
                check: |err| matches!(err, SetupError::Load { tracer: "grpc", .. }),
            },
            Case {
                kernel: FakeKernel::default(),
                grpc: grpc().unknown_constant("go_version"),
                check: |err| matches!(err, SetupError::Constants { tracer: "grpc", .. }),
            },
            Case {
                kernel: FakeKernel::failing(FailAt::KernelLoad("grpc")),
                grpc: grpc(),
                check: |err| {
                    matches!(err, SetupError::KernelLoad { tracer: "grpc", .. })
                        && err.verifier_log() == Some("R2 min value is negative")
                },
            },
            Case {
                kernel: FakeKernel::failing(FailAt::Attach("uprobe_server_handleStream")),
                grpc: grpc(),
                check: |err| matches!(err, SetupError::Attach { tracer: "grpc", .. }),
            },
            Case {
                kernel: FakeKernel::failing(FailAt::Attach("uprobe_server_handleStream_return")),
                grpc: grpc(),
                check: |err| matches!(err, SetupError::Attach { tracer: "grpc", .. }),
            },
        ];
        for case in cases {
            let base = temp_dir("provider_atomic");
            let inspector = FakeInspector::default().with(100, offsets(&[HTTP_FUNC, GRPC_FUNC]));
            let env = env(&case.kernel, myapp(), inspector);
            let err = provide(&exec_config(&base), tracer_set(vec![nethttp(), case.grpc]), &env)
                .await
                .err()
                .unwrap();
            assert!((case.check)(&err), "unexpected error {err:?}");
            assert_nothing_left(&case.kernel, &base);
            assert_eq!(case.kernel.state().unmounts, 1);
        }
    }

    #[tokio::test]
    async fn fallback_socket_filter_failure() {
        let base = temp_dir("provider_filter");
        let kernel = FakeKernel::failing(FailAt::Attach("socket__http_filter"));
        let env = env(&kernel, myapp(), FakeInspector::default());
        let err = provide(&exec_config(&base), tracer_set(vec![]), &env)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::Attach { tracer: "httpfltr", .. }));
        assert_nothing_left(&kernel, &base);
    }

    #[tokio::test]
    async fn memlock_and_mount_failures() {
        let base = temp_dir("provider_memlock");
        let kernel = FakeKernel::failing(FailAt::Memlock);
        let env_memlock = env(&kernel, myapp(), FakeInspector::default());
        let err = provide(&exec_config(&base), tracer_set(vec![]), &env_memlock)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::Memlock(_)));
        assert_nothing_left(&kernel, &base);

        let kernel = FakeKernel::failing(FailAt::Mount);
        let env_mount = env(&kernel, myapp(), FakeInspector::default());
        let err = provide(&exec_config(&base), tracer_set(vec![]), &env_mount)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::Mount(_)));
        assert!(loaded(&kernel).is_empty());
        assert!(!pin_path(&base).exists());
    }

    #[tokio::test]
    async fn partial_coverage_is_reported() {
        let base = temp_dir("provider_partial");
        let kernel = FakeKernel::default();
        let mut table: OffsetTable = offsets(&[HTTP_FUNC]);
        // No return site found for the handler.
        table.funcs.get_mut(HTTP_FUNC).unwrap().returns.clear();
        let inspector = FakeInspector::default().with(100, table);
        let env = env(&kernel, myapp(), inspector);
        let tracer = nethttp().go_probe(
            "net/http.(*response).WriteHeader",
            FunctionPrograms::optional("uprobe_WriteHeader", "uprobe_WriteHeader_return"),
        );
        let output = provide(&exec_config(&base), tracer_set(vec![tracer]), &env)
            .await
            .unwrap();
        assert_eq!(
            output.coverage,
            vec![
                PartialCoverage {
                    tracer: "nethttp",
                    missing: vec!["net/http.(*response).WriteHeader".to_string()],
                },
                PartialCoverage {
                    tracer: "nethttp",
                    missing: vec![format!("{HTTP_FUNC} (return)")],
                },
            ]
        );
        assert_eq!(kernel.live_attachments(), 1);
    }
}
