//! Captured stdout/stderr of the weavelet, relayed as log entries.
//!
//! Each stream has its own reader task. Lines from both go through one
//! unbounded channel to a single delivery task, so the handler sees every
//! line exactly once and per-stream order is preserved. Nothing is dropped or
//! truncated; a slow handler only grows the channel.

use crate::control::messages::{LogEntry, LogLevel, WeaveletIdentity, STDERR_COMPONENT, STDOUT_COMPONENT};
use crate::envelope::handler::EnvelopeHandler;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn component(self) -> &'static str {
        match self {
            LogStream::Stdout => STDOUT_COMPONENT,
            LogStream::Stderr => STDERR_COMPONENT,
        }
    }

    pub fn level(self) -> LogLevel {
        match self {
            LogStream::Stdout => LogLevel::Info,
            LogStream::Stderr => LogLevel::Error,
        }
    }
}

/// One line as read from a captured stream, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    pub stream: LogStream,
    pub text: String,
}

/// Called with the first line of each stream.
pub type FirstLineHook = Arc<dyn Fn(&CapturedLine) + Send + Sync>;

fn trim_line_ending(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

/// Read `reader` line by line until EOF, forwarding every line.
///
/// A final line without a terminator is still forwarded. Returns the number
/// of lines read.
pub async fn read_lines<R>(
    stream: LogStream,
    reader: R,
    tx: mpsc::UnboundedSender<CapturedLine>,
    on_first_line: FirstLineHook,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0u64;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(count);
        }
        trim_line_ending(&mut buf);
        let line = CapturedLine {
            stream,
            text: String::from_utf8_lossy(&buf).into_owned(),
        };
        if count == 0 {
            on_first_line(&line);
        }
        count += 1;
        // Delivery side may be gone; keep draining so the child never blocks on a full pipe.
        let _ = tx.send(line);
    }
}

/// Spawn a reader task for one captured stream.
pub fn spawn_reader<R>(
    stream: LogStream,
    reader: R,
    tx: mpsc::UnboundedSender<CapturedLine>,
    on_first_line: FirstLineHook,
) -> JoinHandle<io::Result<u64>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = read_lines(stream, reader, tx, on_first_line).await;
        match &result {
            Ok(lines) => tracing::trace!(?stream, lines, "captured stream closed"),
            Err(e) => tracing::warn!(?stream, error = %e, "captured stream read failed"),
        }
        result
    })
}

/// Attribution stamped on every relayed line.
#[derive(Debug, Clone)]
pub struct LogAttribution {
    pub identity: WeaveletIdentity,
    pub pid: Option<u32>,
}

impl LogAttribution {
    pub fn entry(&self, line: CapturedLine) -> LogEntry {
        LogEntry::new(&self.identity, line.stream.component(), line.stream.level(), line.text)
            .with_pid(self.pid)
    }
}

/// Hand every captured line to the handler, in order, until all senders are gone.
pub async fn deliver(
    mut rx: mpsc::UnboundedReceiver<CapturedLine>,
    handler: Arc<dyn EnvelopeHandler>,
    attribution: LogAttribution,
) -> u64 {
    let mut delivered = 0u64;
    while let Some(line) = rx.recv().await {
        handler.recv_log_entry(attribution.entry(line)).await;
        delivered += 1;
    }
    delivered
}
