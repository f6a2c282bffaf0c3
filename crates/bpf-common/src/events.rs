//! Sources of raw events produced by eBPF programs.
use async_trait::async_trait;
use aya::maps::{MapData, RingBuf};
use bytes::Bytes;
use tokio::io::unix::AsyncFd;

use crate::ProgramError;

/// A kernel-side event source, read by the tracers `run` loop.
#[async_trait]
pub trait EventSource: Send {
    /// Waits for at least one record to be available and returns all the
    /// records which can be read without blocking.
    async fn next_records(&mut self) -> Result<Vec<Bytes>, ProgramError>;
}

/// Reads a BPF_MAP_TYPE_RINGBUF map.
pub struct RingBufSource {
    fd: AsyncFd<RingBuf<MapData>>,
}

impl RingBufSource {
    pub fn new(ring_buf: RingBuf<MapData>) -> Result<Self, ProgramError> {
        let fd = AsyncFd::new(ring_buf).map_err(ProgramError::RingBuffer)?;
        Ok(Self { fd })
    }
}

#[async_trait]
impl EventSource for RingBufSource {
    async fn next_records(&mut self) -> Result<Vec<Bytes>, ProgramError> {
        let mut guard = self
            .fd
            .readable_mut()
            .await
            .map_err(ProgramError::RingBuffer)?;
        let ring_buf = guard.get_inner_mut();
        let mut records = Vec::new();
        while let Some(item) = ring_buf.next() {
            // An empty record means the producer overflowed the ring.
            if item.is_empty() {
                log::warn!("ring buffer overflow detected");
                continue;
            }
            records.push(Bytes::copy_from_slice(&item));
        }
        guard.clear_ready();
        Ok(records)
    }
}
