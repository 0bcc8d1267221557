use std::{io::Write, path::Path};

use chrono::Utc;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{InitError, RollingFileAppender, Rotation},
};

/// A sink for server events
///
/// logging is fire and forget, an implementation must never block
/// or fail the request that produced the event.
pub trait EventLog: Send + Sync {
    fn log(&self, event: &str);
}

#[derive(thiserror::Error, Debug)]
pub enum EventLogError {
    #[error("event log path has no file name: {0}")]
    NoFileName(String),

    #[error("{0}")]
    Init(#[from] InitError),
}

/// Appends timestamped events to a file from a background worker
///
/// events are dropped rather than waited on when the worker falls behind.
/// pending events are flushed when the log is dropped.
pub struct FileEventLog {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

impl FileEventLog {
    pub fn open(path: &Path) -> Result<Self, EventLogError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| EventLogError::NoFileName(path.display().to_string()))?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(file_name.to_string_lossy())
            .build(dir)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        Ok(Self {
            writer,
            _guard: guard,
        })
    }
}

impl EventLog for FileEventLog {
    fn log(&self, event: &str) {
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), event);
        // the writer is a cheap handle onto the worker's queue
        if let Err(err) = self.writer.clone().write_all(line.as_bytes()) {
            tracing::debug!("failed to queue event: {}", err);
        }
    }
}
