//! One-off commands inside service containers.

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::runtime::OutputStream;

/// Handle to a command whose output is being drained in the background.
///
/// Dropping the handle does not cancel the drain.
#[derive(Debug)]
pub struct CommandHandle {
    task: JoinHandle<Vec<String>>,
}

impl CommandHandle {
    /// Wait for the output to be drained and return the logged lines.
    pub async fn wait(self) -> Vec<String> {
        self.task.await.unwrap_or_default()
    }
}

/// Non-blank, trimmed lines of `output`.
pub fn output_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn spawn_drain(service: &str, cmd: &[String], mut output: OutputStream) -> CommandHandle {
    let service = service.to_string();
    let command = cmd.join(" ");

    let task = tokio::spawn(async move {
        let mut buf = Vec::new();
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(e) => {
                    error!(service = %service, command = %command, error = %e, "Failed to read command output");
                    return Vec::new();
                }
            }
        }

        let lines = output_lines(&String::from_utf8_lossy(&buf));
        for line in &lines {
            debug!(service = %service, command = %command, "{}", line);
        }
        lines
    });

    CommandHandle { task }
}
