//! Event loop shared by the tracers: read raw records from a kernel event
//! source and forward them in batches.
use std::time::Duration;

use bpf_common::{EventSource, log_error, log_warning};
use tokio::time::MissedTickBehavior;

use crate::{
    config::TracerConfig,
    output::{Batch, OutputQueue, Record},
    shutdown::ShutdownSignal,
    tracer::ObjectSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// A batch is sent as soon as it holds this many records.
    pub length: usize,
    /// Partial batches are sent with this period.
    pub timeout: Duration,
}

impl From<&TracerConfig> for BatchConfig {
    fn from(config: &TracerConfig) -> Self {
        Self {
            length: config.batch_length.max(1),
            timeout: config.batch_timeout,
        }
    }
}

struct Batcher<'a> {
    tracer: &'static str,
    length: usize,
    pending: Batch,
    output: &'a OutputQueue,
}

impl Batcher<'_> {
    async fn push(&mut self, payload: bytes::Bytes, shutdown: &mut ShutdownSignal) {
        self.pending.push(Record {
            tracer: self.tracer,
            payload,
        });
        if self.pending.len() >= self.length {
            self.flush(shutdown).await;
        }
    }

    /// Sends the pending records. A full queue is waited on until shutdown,
    /// then the records are dropped.
    async fn flush(&mut self, shutdown: &mut ShutdownSignal) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.length));
        let len = batch.len();
        tokio::select! {
            biased;
            sent = self.output.send(batch) => if let Err(err) = sent {
                log::warn!("[{}] dropping events: {err}", self.tracer);
            },
            _ = shutdown.recv() => {
                log::warn!("[{}] output queue full on shutdown, dropping {len} events", self.tracer);
            }
        }
    }
}

/// Forward records from `source` to `output` until `shutdown` is received.
/// Read errors are logged and don't stop the loop.
pub async fn forward_events(
    tracer: &'static str,
    source: &mut dyn EventSource,
    batch: BatchConfig,
    shutdown: &mut ShutdownSignal,
    output: &OutputQueue,
) {
    let mut batcher = Batcher {
        tracer,
        length: batch.length.max(1),
        pending: Vec::with_capacity(batch.length),
        output,
    };
    // Intervals can't have a zero period.
    let period = batch.timeout.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => batcher.flush(shutdown).await,
            records = source.next_records() => match records {
                Ok(records) => {
                    for payload in records {
                        batcher.push(payload, shutdown).await;
                    }
                }
                Err(err) => log_warning(&format!("[{tracer}] reading events"), err),
            },
        }
    }
    batcher.flush(shutdown).await;
    log::debug!("[{tracer}] stopped forwarding events");
}

/// `run` implementation for tracers publishing their events on a single
/// ring buffer: forward it until shutdown, then release the kernel objects.
pub async fn run_ring_buffer(
    tracer: &'static str,
    mut objects: ObjectSink,
    map: &str,
    batch: BatchConfig,
    mut shutdown: ShutdownSignal,
    output: OutputQueue,
) {
    match objects.ring_buffer(map) {
        Ok(mut source) => {
            forward_events(tracer, source.as_mut(), batch, &mut shutdown, &output).await
        }
        Err(err) => {
            log_error(&format!("[{tracer}] opening ring buffer {map}"), err);
            shutdown.recv().await;
        }
    }
    objects.close(tracer);
}
