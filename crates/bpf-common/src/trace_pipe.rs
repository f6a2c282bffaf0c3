//! eBPF programs built in debug mode log with `bpf_printk`. This module
//! forwards those messages from tracefs to [`log::debug`] while the returned
//! [`StopHandle`] is alive.

use std::os::unix::prelude::AsRawFd;

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio_fd::AsyncFd;

const PATH: &str = "/sys/kernel/debug/tracing/trace_pipe";

/// Forwarding stops when this is dropped.
pub struct StopHandle(#[allow(unused)] oneshot::Sender<()>);

pub fn start() -> StopHandle {
    let (tx, mut rx) = oneshot::channel();
    tokio::spawn(async move {
        // The file must outlive the async fd, which doesn't own the descriptor.
        let Some((mut async_fd, _file)) = open_trace_pipe().await else {
            return;
        };
        log::info!("Forwarding eBPF debug output from {PATH}");
        let mut buf = BytesMut::with_capacity(512);
        loop {
            let read = tokio::select! {
                read = async_fd.read_buf(&mut buf) => read,
                _ = &mut rx => return,
            };
            if let Err(err) = read {
                log::warn!("Error reading from {PATH}: {err:?}");
                return;
            }
            if let Some(last_newline) = buf.iter().rposition(|&c| c == b'\n') {
                let lines = buf.split_to(last_newline + 1);
                print_lines(&lines);
            }
        }
    });
    StopHandle(tx)
}

/// tokio::fs::File reads on a blocking thread, which would keep the runtime
/// alive on shutdown. Reading through a non-blocking fd avoids that.
async fn open_trace_pipe() -> Option<(AsyncFd, File)> {
    let file = match File::open(PATH).await {
        Ok(file) => file,
        Err(err) => {
            log::warn!("Error opening {PATH}: {err:?}");
            return None;
        }
    };
    match AsyncFd::try_from(file.as_raw_fd()) {
        Ok(async_fd) => Some((async_fd, file)),
        Err(err) => {
            log::warn!("Error opening {PATH} as non-blocking: {err:?}");
            None
        }
    }
}

fn print_lines(buf: &[u8]) {
    buf.split(|c| *c == b'\n')
        .filter(|line| !line.is_empty())
        .for_each(|line| log::debug!(target: "trace_pipe", "{}", format_msg(line)));
}

fn format_msg(line: &[u8]) -> String {
    match std::str::from_utf8(line) {
        Ok(msg) => msg.replace("bpf_trace_printk: ", "").trim().to_string(),
        Err(_) => format!("{line:?}"),
    }
}
