//! Background readers draining container output into log files.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::logfile::LogFile;
use crate::runtime::OutputStream;

/// Observable state of a service's output reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamerState {
    /// Reading output.
    Running,
    /// The output stream ended (container stopped or was removed).
    Closed,
    /// Reading (or attaching) failed; output is unobserved until the next
    /// convergence pass attaches again.
    Failed(String),
}

impl StreamerState {
    pub fn is_running(&self) -> bool {
        matches!(self, StreamerState::Running)
    }
}

/// Handle to a running (or finished) log streamer.
pub struct StreamerHandle {
    container_id: String,
    state: watch::Receiver<StreamerState>,
    task: Option<JoinHandle<()>>,
}

impl StreamerHandle {
    /// A handle for a streamer that never started because attaching failed.
    pub fn failed(container_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let (_, state) = watch::channel(StreamerState::Failed(reason.into()));
        Self {
            container_id: container_id.into(),
            state,
            task: None,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn state(&self) -> StreamerState {
        self.state.borrow().clone()
    }

    /// Wait until the reader has stopped and return its final state.
    pub async fn stopped(&self) -> StreamerState {
        let mut state = self.state.clone();
        // A dropped sender means the task is gone; the last value is final.
        let _ = state.wait_for(|s| !s.is_running()).await;
        let last = state.borrow().clone();
        last
    }

    /// Stop reading. Used when a fresh attachment replaces this one.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Drop for StreamerHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Reassembles lines from raw output chunks.
///
/// Chunks are split at arbitrary byte boundaries, so bytes after the last
/// newline are held back until the rest of the line arrives. NUL padding is
/// dropped and each line is trimmed; blank lines are skipped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend(chunk.iter().copied().filter(|b| *b != 0));

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(clean_line)
            .collect()
    }

    /// The unterminated tail, once the stream has ended.
    pub fn finish(self) -> Option<String> {
        clean_line(&self.pending)
    }
}

fn clean_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Spawn a reader that copies `output` into `log` and the debug log.
pub fn spawn(
    service: &str,
    container_id: &str,
    mut output: OutputStream,
    log: Arc<LogFile>,
) -> StreamerHandle {
    let (tx, state) = watch::channel(StreamerState::Running);
    let service = service.to_string();

    let task = tokio::spawn(async move {
        let mut lines = LineBuffer::new();
        let final_state = loop {
            match output.next().await {
                Some(Ok(chunk)) => {
                    for line in lines.push(&chunk) {
                        write_line(&service, &log, &line).await;
                    }
                }
                Some(Err(e)) => {
                    error!(service = %service, error = %e, "Failed to read output");
                    break StreamerState::Failed(e.to_string());
                }
                None => {
                    debug!(service = %service, "Output stream closed");
                    break StreamerState::Closed;
                }
            }
        };
        if let Some(line) = lines.finish() {
            write_line(&service, &log, &line).await;
        }
        let _ = tx.send(final_state);
    });

    StreamerHandle {
        container_id: container_id.to_string(),
        state,
        task: Some(task),
    }
}

async fn write_line(service: &str, log: &LogFile, line: &str) {
    debug!(service = %service, "{}", line);
    if let Err(e) = log.write_line(line).await {
        warn!(service = %service, path = %log.path().display(), error = %e, "Failed to write service log");
    }
}
