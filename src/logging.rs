//! Structured logging for framepipe.
//!
//! Two layers:
//! - a global `tracing` subscriber with `RUST_LOG` filter support, stderr
//!   output, and JSON format when `RUST_LOG_FORMAT=json`;
//! - a per-run log funnel: every pipeline stage writes structured records
//!   into one bounded channel, drained by a single thread that fans out to
//!   the run's log file and to `tracing`. Workers never touch the sinks
//!   directly, so lines are never interleaved.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use chrono::Local;
use crossbeam_channel::{bounded, Sender};

use crate::error::FpResult;

/// Initialize the global tracing subscriber.
///
/// Call once at program startup; subsequent calls are no-ops.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("framepipe=info"));

    let is_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if is_json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug)]
enum FunnelMessage {
    Record {
        level: LogLevel,
        origin: String,
        message: String,
    },
    /// Drain barrier: everything sent before this message is on disk when
    /// the acknowledgement fires.
    Flush(std::sync::mpsc::Sender<()>),
    /// Stop the drainer even if live senders remain (a stuck stage thread
    /// must not keep the funnel open forever).
    Shutdown,
}

/// Cloneable handle that stages and workers log through.
#[derive(Clone)]
pub struct LogSender {
    tx: Sender<FunnelMessage>,
    debug: bool,
}

impl LogSender {
    fn send(&self, level: LogLevel, origin: &str, message: String) {
        if level == LogLevel::Debug && !self.debug {
            return;
        }
        // A closed funnel means the run is tearing down; drop the line.
        let _ = self.tx.send(FunnelMessage::Record {
            level,
            origin: origin.to_owned(),
            message,
        });
    }

    pub fn debug(&self, origin: &str, message: impl Into<String>) {
        self.send(LogLevel::Debug, origin, message.into());
    }

    pub fn info(&self, origin: &str, message: impl Into<String>) {
        self.send(LogLevel::Info, origin, message.into());
    }

    pub fn warn(&self, origin: &str, message: impl Into<String>) {
        self.send(LogLevel::Warn, origin, message.into());
    }

    pub fn error(&self, origin: &str, message: impl Into<String>) {
        self.send(LogLevel::Error, origin, message.into());
    }
}

impl std::fmt::Debug for LogSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSender").finish_non_exhaustive()
    }
}

/// The per-run log funnel. Owns the drainer thread and the log file path.
pub struct LogFunnel {
    tx: Option<Sender<FunnelMessage>>,
    drainer: Option<JoinHandle<()>>,
    path: PathBuf,
    debug: bool,
}

impl LogFunnel {
    /// Create the funnel and its log file (truncating any previous one).
    pub fn create(path: &Path, debug: bool) -> FpResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let (tx, rx) = bounded::<FunnelMessage>(1024);
        let drainer = std::thread::Builder::new()
            .name("log-funnel".to_owned())
            .spawn(move || {
                let mut sink = BufWriter::new(file);
                for message in rx {
                    match message {
                        FunnelMessage::Record {
                            level,
                            origin,
                            message,
                        } => {
                            let stamp = Local::now().format("%H:%M:%S");
                            let _ = writeln!(
                                sink,
                                "{stamp} {} {origin}: {message}",
                                level.as_str()
                            );
                            match level {
                                LogLevel::Debug => {
                                    tracing::debug!(origin = %origin, "{message}");
                                }
                                LogLevel::Info => {
                                    tracing::info!(origin = %origin, "{message}");
                                }
                                LogLevel::Warn => {
                                    tracing::warn!(origin = %origin, "{message}");
                                }
                                LogLevel::Error => {
                                    tracing::error!(origin = %origin, "{message}");
                                }
                            }
                        }
                        FunnelMessage::Flush(ack) => {
                            let _ = sink.flush();
                            let _ = ack.send(());
                        }
                        FunnelMessage::Shutdown => break,
                    }
                }
                let _ = sink.flush();
            })?;
        Ok(Self {
            tx: Some(tx),
            drainer: Some(drainer),
            path: path.to_path_buf(),
            debug,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn sender(&self) -> LogSender {
        let tx = match &self.tx {
            Some(tx) => tx.clone(),
            // After close: a disconnected handle that drops every record.
            None => bounded(1).0,
        };
        LogSender {
            tx,
            debug: self.debug,
        }
    }

    /// Block until every record sent so far has been written to the file.
    pub fn sync(&self) {
        if let Some(tx) = &self.tx {
            let (ack_tx, ack_rx) = std::sync::mpsc::channel();
            if tx.send(FunnelMessage::Flush(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    /// Stop the drainer. Records queued so far are written out; anything a
    /// still-live sender submits afterwards is dropped.
    pub fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(FunnelMessage::Shutdown);
        }
        if let Some(drainer) = self.drainer.take() {
            let _ = drainer.join();
        }
    }
}

impl Drop for LogFunnel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }

    #[test]
    fn funnel_writes_records_in_send_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.log");
        let mut funnel = LogFunnel::create(&path, false).expect("funnel");
        let log = funnel.sender();
        log.info("runner", "run start");
        log.warn("segmentation", "slow frame");
        log.debug("runner", "suppressed without debug");
        funnel.sync();

        let text = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("INFO runner: run start"));
        assert!(lines[1].contains("WARN segmentation: slow frame"));

        drop(log);
        funnel.close();
    }

    #[test]
    fn debug_records_pass_in_debug_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.log");
        let mut funnel = LogFunnel::create(&path, true).expect("funnel");
        funnel.sender().debug("collector", "flushed batch");
        funnel.sync();
        let text = std::fs::read_to_string(&path).expect("read log");
        assert!(text.contains("DEBUG collector: flushed batch"));
        funnel.close();
    }
}
