use std::fmt;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::{OrchestratorError, Result};

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of container output, tagged with its service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub service: String,
    pub stream: LogStream,
    pub line: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.service, self.line)
    }
}

/// Spawn `cmd` and forward its stdout and stderr line by line.
///
/// The channel closes once both streams end. Keep the returned child alive
/// (or kill it) to control a `--follow` stream.
pub fn stream_lines(
    mut cmd: Command,
    service: &str,
) -> Result<(Child, mpsc::UnboundedReceiver<LogLine>)> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| OrchestratorError::Runtime(format!("failed to spawn log stream: {e}")))?;

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward(stdout, service.to_string(), LogStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward(stderr, service.to_string(), LogStream::Stderr, tx);
    }
    Ok((child, rx))
}

fn forward<R>(reader: R, service: String, stream: LogStream, tx: mpsc::UnboundedSender<LogLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            let sent = tx.send(LogLine {
                service: service.clone(),
                stream,
                line,
            });
            if sent.is_err() {
                break;
            }
        }
    });
}
