//! Queue shared by every tracer to hand captured events to the rest of the
//! pipeline.
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

const BUFFER_SIZE: usize = 1000;

/// A raw event captured by a tracer. Decoding happens downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub tracer: &'static str,
    pub payload: Bytes,
}

pub type Batch = Vec<Record>;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("output queue is closed")]
    Closed,
}

#[derive(Clone)]
pub struct OutputQueue {
    tx: mpsc::Sender<Batch>,
}

impl OutputQueue {
    pub fn new() -> (Self, mpsc::Receiver<Batch>) {
        Self::with_capacity(BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Batch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Waits for space in the queue. Empty batches are dropped.
    pub async fn send(&self, batch: Batch) -> Result<(), OutputError> {
        if batch.is_empty() {
            return Ok(());
        }
        log::trace!("sending batch of {} records", batch.len());
        self.tx.send(batch).await.map_err(|_| OutputError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_batches_are_skipped() {
        let (queue, mut rx) = OutputQueue::new();
        queue.send(Vec::new()).await.unwrap();
        let record = Record {
            tracer: "nethttp",
            payload: Bytes::from_static(b"GET /"),
        };
        queue.send(vec![record.clone()]).await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![record]));
    }

    #[tokio::test]
    async fn closed_queue() {
        let (queue, rx) = OutputQueue::new();
        drop(rx);
        let record = Record {
            tracer: "nethttp",
            payload: Bytes::new(),
        };
        assert!(matches!(
            queue.send(vec![record]).await,
            Err(OutputError::Closed)
        ));
    }
}
