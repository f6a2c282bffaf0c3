//! Finds the process to instrument and inspects its executable.
use std::collections::HashSet;

use bpf_common::Pid;

use crate::{
    config::{RetryPolicy, TracerConfig},
    error::{ResolutionError, SetupError},
    exec::{Criteria, ExecutableInfo, ProcessFinder, ServiceName},
    goexec::{Inspection, OffsetInspector, OffsetTable},
    shutdown::ShutdownSignal,
};

/// Prefix of the Go runtime functions. A Go process exposing only these is a
/// proxy in front of the real target.
pub const RUNTIME_NAMESPACE: &str = "runtime.";

/// The accepted target.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub exe: ExecutableInfo,
    /// `None` when only generic instrumentation is possible.
    pub offsets: Option<OffsetTable>,
    pub service: ServiceName,
}

/// Looks up the target process described by `config` and, unless running
/// system wide, the instrumentation points of `functions` in its executable.
pub async fn resolve(
    config: &TracerConfig,
    functions: &[String],
    finder: &dyn ProcessFinder,
    inspector: &dyn OffsetInspector,
    shutdown: &mut ShutdownSignal,
) -> Result<Resolved, SetupError> {
    if let Some(port) = config.port {
        return resolve_port(port, config, functions, finder, inspector, shutdown).await;
    }
    let Some(exec) = &config.exec else {
        return Err(ResolutionError::NotFound {
            criteria: "empty configuration".to_string(),
        }
        .into());
    };
    let criteria = Criteria::Exec(exec.clone());
    let exe = finder
        .find(&criteria, &HashSet::new())?
        .ok_or_else(|| ResolutionError::NotFound {
            criteria: criteria.to_string(),
        })?;
    log::info!(
        "Instrumenting process {} ({})",
        exe.pid,
        exe.cmd_exe_path.display()
    );

    let offsets = if config.system_wide {
        None
    } else {
        inspect(inspector, &exe, functions)?
    };
    Ok(Resolved {
        service: exe.service_name(),
        exe,
        offsets,
    })
}

/// The process owning a port may be a Go reverse proxy. Candidates
/// exposing only Go runtime functions are skipped until a real application
/// shows up.
async fn resolve_port(
    port: u16,
    config: &TracerConfig,
    functions: &[String],
    finder: &dyn ProcessFinder,
    inspector: &dyn OffsetInspector,
    shutdown: &mut ShutdownSignal,
) -> Result<Resolved, SetupError> {
    let criteria = Criteria::Port(port);
    let mut rejected: HashSet<Pid> = HashSet::new();
    loop {
        if shutdown.is_shutdown() {
            return Err(ResolutionError::Cancelled.into());
        }
        let exe = finder
            .find(&criteria, &rejected)?
            .ok_or_else(|| ResolutionError::NotFound {
                criteria: criteria.to_string(),
            })?;

        let offsets = if config.system_wide {
            None
        } else {
            inspect(inspector, &exe, functions)?
        };
        if offsets.as_ref().is_none_or(is_application) {
            log::info!(
                "Instrumenting process {} ({}) listening on port {port}",
                exe.pid,
                exe.cmd_exe_path.display()
            );
            return Ok(Resolved {
                service: exe.service_name(),
                exe,
                offsets,
            });
        }

        log::warn!(
            "Process {} ({}) only exposes Go runtime functions, skipping it as a proxy",
            exe.pid,
            exe.cmd_exe_path.display()
        );
        rejected.insert(exe.pid);
        wait_retry(&config.retry, rejected.len(), shutdown).await?;
    }
}

fn is_application(offsets: &OffsetTable) -> bool {
    offsets
        .funcs
        .keys()
        .any(|name| !name.starts_with(RUNTIME_NAMESPACE))
}

async fn wait_retry(
    policy: &RetryPolicy,
    attempts: usize,
    shutdown: &mut ShutdownSignal,
) -> Result<(), ResolutionError> {
    if !policy.allows(attempts) {
        return Err(ResolutionError::RetriesExhausted { attempts });
    }
    tokio::select! {
        _ = shutdown.recv() => Err(ResolutionError::Cancelled),
        _ = tokio::time::sleep(policy.interval) => Ok(()),
    }
}

fn inspect(
    inspector: &dyn OffsetInspector,
    exe: &ExecutableInfo,
    functions: &[String],
) -> Result<Option<OffsetTable>, SetupError> {
    match inspector.inspect(exe, functions)? {
        Inspection::Found(offsets) => Ok(Some(offsets)),
        Inspection::NotApplicable(reason) => {
            log::info!("Go support not detected. Using only generic instrumentation. ({reason})");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use regex::Regex;

    use super::*;
    use crate::test_utils::{FakeFinder, FakeInspector, offsets};

    fn port_config() -> TracerConfig {
        TracerConfig {
            port: Some(8080),
            retry: RetryPolicy::unbounded(Duration::ZERO),
            ..Default::default()
        }
    }

    fn exe(pid: i32, path: &str) -> ExecutableInfo {
        ExecutableInfo::new(Pid::from_raw(pid), path)
    }

    fn functions() -> Vec<String> {
        vec!["net/http.HandlerFunc.ServeHTTP".to_string()]
    }

    #[tokio::test]
    async fn proxy_is_skipped() {
        let finder = FakeFinder::new([exe(10, "/usr/bin/proxy"), exe(20, "/srv/api")]);
        let inspector = FakeInspector::default()
            .with(10, offsets(&["runtime.main"]))
            .with(20, offsets(&["net/http.HandlerFunc.ServeHTTP"]));
        let (_tx, mut shutdown) = ShutdownSignal::new();
        let resolved = resolve(&port_config(), &functions(), &finder, &inspector, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(resolved.exe.pid, Pid::from_raw(20));
        assert_eq!(resolved.service.as_str(), "api");
        assert!(resolved.offsets.unwrap().contains("net/http.HandlerFunc.ServeHTTP"));
        assert_eq!(finder.excluded_history(), vec![vec![], vec![10]]);
    }

    #[tokio::test]
    async fn non_go_candidate_is_accepted() {
        let finder = FakeFinder::new([exe(10, "/usr/sbin/nginx"), exe(20, "/srv/api")]);
        let inspector = FakeInspector::default();
        let (_tx, mut shutdown) = ShutdownSignal::new();
        let resolved = resolve(&port_config(), &functions(), &finder, &inspector, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(resolved.exe.pid, Pid::from_raw(10));
        assert!(resolved.offsets.is_none());
    }

    #[tokio::test]
    async fn only_proxies() {
        let finder = FakeFinder::new([exe(10, "/usr/bin/proxy"), exe(11, "/usr/bin/proxy")]);
        let inspector = FakeInspector::default()
            .with(10, offsets(&["runtime.main"]))
            .with(11, offsets(&["runtime.main", "runtime.newproc1"]));
        let (_tx, mut shutdown) = ShutdownSignal::new();
        let err = resolve(&port_config(), &functions(), &finder, &inspector, &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SetupError::Resolution(ResolutionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn retries_are_capped() {
        let finder = FakeFinder::new([exe(10, "/a"), exe(11, "/b"), exe(12, "/c")]);
        let inspector = FakeInspector::default()
            .with(10, offsets(&["runtime.main"]))
            .with(11, offsets(&["runtime.main"]))
            .with(12, offsets(&["runtime.main"]));
        let mut config = port_config();
        config.retry.max_attempts = Some(2);
        let (_tx, mut shutdown) = ShutdownSignal::new();
        let err = resolve(&config, &functions(), &finder, &inspector, &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SetupError::Resolution(ResolutionError::RetriesExhausted { attempts: 2 })
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_the_search() {
        let finder = FakeFinder::new([exe(10, "/a"), exe(11, "/b")]);
        let inspector = FakeInspector::default().with(10, offsets(&["runtime.main"]));
        let mut config = port_config();
        config.retry.interval = Duration::from_secs(3600);
        let (tx, mut shutdown) = ShutdownSignal::new();
        let functions = functions();
        let search = resolve(&config, &functions, &finder, &inspector, &mut shutdown);
        tx.send_signal();
        let err = search.await.unwrap_err();
        assert!(matches!(
            err,
            SetupError::Resolution(ResolutionError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn system_wide_port_skips_inspection() {
        let finder = FakeFinder::new([exe(10, "/usr/bin/proxy")]);
        let inspector = FakeInspector::default().with(10, offsets(&["runtime.main"]));
        let mut config = port_config();
        config.system_wide = true;
        let (_tx, mut shutdown) = ShutdownSignal::new();
        let resolved = resolve(&config, &functions(), &finder, &inspector, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(resolved.exe.pid, Pid::from_raw(10));
        assert!(resolved.offsets.is_none());
        assert!(inspector.requests().is_empty());
    }

    #[tokio::test]
    async fn resolve_by_name() {
        let finder = FakeFinder::new([exe(30, "/opt/myapp")]);
        let inspector = FakeInspector::default().with(30, offsets(&["net/http.HandlerFunc.ServeHTTP"]));
        let config = TracerConfig {
            exec: Some(Regex::new("myapp").unwrap()),
            ..Default::default()
        };
        let (_tx, mut shutdown) = ShutdownSignal::new();
        let resolved = resolve(&config, &functions(), &finder, &inspector, &mut shutdown)
            .await
            .unwrap();
        assert_eq!(resolved.service.as_str(), "myapp");
        assert!(resolved.offsets.is_some());
        assert_eq!(inspector.requests(), vec![functions()]);
    }

    #[tokio::test]
    async fn name_not_found() {
        let finder = FakeFinder::new([]);
        let inspector = FakeInspector::default();
        let config = TracerConfig {
            exec: Some(Regex::new("myapp").unwrap()),
            ..Default::default()
        };
        let (_tx, mut shutdown) = ShutdownSignal::new();
        let err = resolve(&config, &functions(), &finder, &inspector, &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SetupError::Resolution(ResolutionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn inspection_errors_are_fatal() {
        let finder = FakeFinder::new([exe(10, "/a")]);
        let inspector = FakeInspector::default().failing();
        let (_tx, mut shutdown) = ShutdownSignal::new();
        let err = resolve(&port_config(), &functions(), &finder, &inspector, &mut shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::Inspection(_)));
    }
}
