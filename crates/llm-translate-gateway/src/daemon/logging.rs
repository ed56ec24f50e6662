use std::{
    collections::VecDeque,
    fs,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{error, info, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One human-readable status line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusLine {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

/// Fire-and-forget sink for status lines.
///
/// Sending never blocks; lines are mirrored to `tracing` and, when a writer is
/// attached, appended as JSON records to the status log.
#[derive(Clone, Debug, Default)]
pub struct LogSink {
    tx: Option<mpsc::UnboundedSender<StatusLine>>,
}

impl LogSink {
    /// Sink that only mirrors to `tracing`.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Sink whose lines are delivered to the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink backed by an append-only file written from a background task.
    pub async fn spawn_file(path: PathBuf, truncate: bool) -> Result<(Self, LogWriterHandle)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        if truncate {
            tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("failed to truncate log file {}", path.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open log file {}", path.display()))?;

        let (sink, rx) = Self::channel();
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_writer(file, rx, close_rx));
        Ok((sink, LogWriterHandle { close: close_tx, task }))
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message.into());
    }

    fn emit(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!(target: "status", "{message}"),
            LogLevel::Warn => warn!(target: "status", "{message}"),
            LogLevel::Error => error!(target: "status", "{message}"),
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(StatusLine { level, message });
        }
    }
}

/// Owner of the status-log writer task.
#[derive(Debug)]
pub struct LogWriterHandle {
    close: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl LogWriterHandle {
    /// Flush queued lines and stop the writer.
    pub async fn shutdown(self) {
        let _ = self.close.send(());
        let _ = self.task.await;
    }
}

async fn run_writer(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<StatusLine>,
    mut close: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => write_entry(&mut file, line).await,
                None => break,
            },
            _ = &mut close => {
                while let Ok(line) = rx.try_recv() {
                    write_entry(&mut file, line).await;
                }
                break;
            }
        }
    }
    let _ = file.flush().await;
}

async fn write_entry(file: &mut tokio::fs::File, line: StatusLine) {
    let entry = LogEntry { timestamp: now_timestamp(), level: line.level, message: line.message };
    let Ok(mut buffer) = serde_json::to_vec(&entry) else {
        return;
    };
    buffer.push(b'\n');
    if let Err(err) = file.write_all(&buffer).await {
        warn!(error = %err, "failed to write status log record");
    }
}

/// Read the last `count` records of a status log; unparsable lines are skipped.
pub fn read_tail(path: &Path, count: usize) -> io::Result<Vec<LogEntry>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut tail = VecDeque::with_capacity(count);
    for line in BufReader::new(file).lines() {
        let Ok(entry) = serde_json::from_str::<LogEntry>(&line?) else {
            continue;
        };
        if tail.len() == count {
            tail.pop_front();
        }
        if count > 0 {
            tail.push_back(entry);
        }
    }
    Ok(tail.into())
}

fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_lines_in_order() {
        let (sink, mut rx) = LogSink::channel();
        sink.info("first");
        sink.error("second");
        assert_eq!(rx.recv().await.unwrap().message, "first");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.level, LogLevel::Error);
        assert_eq!(second.message, "second");
    }

    #[tokio::test]
    async fn file_sink_flushes_on_shutdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/status.log");
        let (sink, writer) = LogSink::spawn_file(path.clone(), true).await.unwrap();
        for i in 0..5 {
            sink.info(format!("line {i}"));
        }
        writer.shutdown().await;

        let tail = read_tail(&path, 2).unwrap();
        let messages: Vec<_> = tail.iter().map(|entry| entry.message.as_str()).collect();
        assert_eq!(messages, ["line 3", "line 4"]);
    }

    #[test]
    fn disabled_sink_accepts_lines() {
        LogSink::disabled().warn("nobody listens");
    }
}
