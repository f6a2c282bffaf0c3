//! eBPF auto-instrumentation agent.
//!
//! The agent finds a target process, by executable path or listening port,
//! and attaches to it the eBPF tracers which apply: Go tracers when the
//! target is a Go binary exposing the functions they probe, a generic
//! kernel tracer otherwise. Captured events are forwarded in batches to the
//! output queue until the agent is stopped.
//!
//! ## Feature flags
//!
//! - `default`: Enables `full`.
//! - `full`: Enables every Go tracer listed below.
//! - `http-tracer`: `net/http` and Gin servers.
//! - `grpc-tracer`: gRPC servers and clients.
//! - `goruntime-tracer`: goroutine lifecycle.
//!
//! The generic HTTP tracer is always available.

use anyhow::{Context, Result, ensure};
use nix::unistd::geteuid;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tracer_core::{
    Batch, Environment, ResolutionError, ServiceName, SetupError, ShutdownSignal, Tracer,
    TracerConfig, TracerSet, tracer_provider,
};

use crate::cli::AgentOpts;

pub mod cli;
pub mod config;
pub mod utils;

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}

/// Every tracer compiled into the agent.
pub fn tracers(config: &TracerConfig) -> TracerSet {
    #[allow(unused_mut)]
    let mut go: Vec<Box<dyn Tracer>> = Vec::new();
    #[cfg(feature = "http-tracer")]
    {
        go.push(Box::new(http_tracer::HttpTracer::new(config)));
        go.push(Box::new(http_tracer::GinTracer::new(config)));
    }
    #[cfg(feature = "grpc-tracer")]
    go.push(Box::new(grpc_tracer::GrpcTracer::new(config)));
    #[cfg(feature = "goruntime-tracer")]
    go.push(Box::new(goruntime_tracer::GoRuntimeTracer::new(config)));

    TracerSet {
        go,
        fallback: Box::new(http_filter::HttpFilter::new(config)),
    }
}

/// Set up the tracers and run them until SIGINT or SIGTERM.
pub async fn run_agent(options: &AgentOpts) -> Result<()> {
    log::trace!("Agent options: {:?}", options);

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    let config = config::load_config(options)?;
    let (sender, shutdown) = ShutdownSignal::new();
    let signals = tokio::spawn(async move {
        if let Err(err) = wait_termination().await {
            log::error!("Failed to listen for signals: {err}");
        }
        sender.send_signal();
    });

    let provided = match tracer_provider(
        &config,
        tracers(&config),
        &Environment::system(),
        shutdown.clone(),
    )
    .await
    {
        Ok(provided) => provided,
        Err(SetupError::Resolution(ResolutionError::Cancelled)) => {
            log::info!("Stopped before a target was found");
            return Ok(());
        }
        Err(err) => {
            signals.abort();
            return Err(err).context("Failed to instrument the target");
        }
    };
    for gap in &provided.coverage {
        log::warn!("[{}] not instrumented: {}", gap.tracer, gap.missing.join(", "));
    }

    let (queue, rx) = tracer_core::OutputQueue::new();
    let tasks: Vec<_> = provided
        .tasks
        .into_iter()
        .map(|start| tokio::spawn(start(shutdown.clone(), queue.clone())))
        .collect();
    // The consumer stops once every task dropped its queue handle.
    drop(queue);
    let consumer = tokio::spawn(consume_batches(provided.service, rx));

    for task in tasks {
        task.await.context("Tracer task failed")?;
    }
    consumer.await.context("Output consumer failed")?;
    signals.await.context("Signal handler failed")?;

    log::info!("Terminated");
    Ok(())
}

async fn wait_termination() -> Result<()> {
    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
    }
    log::info!("Terminating tracers...");
    Ok(())
}

/// Events are decoded and exported downstream of the agent, which only
/// accounts for them.
async fn consume_batches(service: ServiceName, mut rx: mpsc::Receiver<Batch>) {
    let mut total = 0usize;
    while let Some(batch) = rx.recv().await {
        total += batch.len();
        if let Some(record) = batch.first() {
            log::debug!(
                "[{service}] {} records from {}, {total} so far",
                batch.len(),
                record.tracer
            );
        }
    }
    log::info!("[{service}] {total} records captured");
}
