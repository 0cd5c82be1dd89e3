//! Record-writing consumers
//!
//! Two independent consumers over the same event stream, each with its own
//! level threshold: the [`FileRecorder`] persists self-describing JSONL
//! records for the session trail, and the [`DisplaySink`] renders
//! human-readable lines for live output. A message may appear in one and
//! not the other.
//!
//! Both are non-fatal by design: a failed write is reported through
//! `tracing::warn!` and the consumer keeps going. Observability must
//! never break a running session.

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use mirrorsync_core::domain::event::{Event, LogLevel};
use mirrorsync_core::domain::newtypes::SessionId;

use crate::bus::Subscription;

/// Persists events as one self-describing JSON record per line.
///
/// Log events below the configured threshold are skipped; progress and
/// connection events are always recorded (they carry no level).
pub struct FileRecorder {
    session_id: SessionId,
    threshold: LogLevel,
    path: PathBuf,
    file: Option<std::fs::File>,
}

impl FileRecorder {
    /// Create a recorder writing to `<directory>/<session_id>.jsonl`
    pub fn create(
        directory: &Path,
        session_id: SessionId,
        threshold: LogLevel,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(directory)?;
        let path = directory.join(format!("{session_id}.jsonl"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            session_id,
            threshold,
            path,
            file: Some(file),
        })
    }

    /// Where this recorder writes
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wants(&self, event: &Event) -> bool {
        match event {
            Event::Log(log) => log.level >= self.threshold,
            Event::Progress(_) | Event::Connection(_) => true,
        }
    }

    /// Write one event; errors are swallowed with a warning
    pub fn record(&mut self, event: &Event) {
        if !self.wants(event) {
            return;
        }
        let record = event.to_record(&self.session_id);
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{record}") {
                warn!(error = %e, path = %self.path.display(), "Failed to persist event record");
                self.file = None;
            }
        }
    }

    /// Consume a subscription until the bus closes or `cancel` fires.
    ///
    /// Spawn this on its own task; the recorder owns its subscription.
    pub async fn run(mut self, mut events: Subscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                maybe = events.next() => match maybe {
                    Some(event) => self.record(&event),
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        // Drain whatever is already queued before shutting down.
        while let Some(event) = events.try_next() {
            self.record(&event);
        }
        if events.dropped() > 0 {
            warn!(
                dropped = events.dropped(),
                "Record file is missing events (recorder fell behind)"
            );
        }
    }
}

/// Renders events as single human-readable lines for live display.
///
/// Terminal coloring and progress-bar drawing belong to the consumer of
/// these lines, not here.
pub struct DisplaySink<W: Write + Send> {
    threshold: LogLevel,
    out: W,
}

impl DisplaySink<std::io::Stderr> {
    /// Display sink writing to stderr
    #[must_use]
    pub fn stderr(threshold: LogLevel) -> Self {
        Self {
            threshold,
            out: std::io::stderr(),
        }
    }
}

impl<W: Write + Send> DisplaySink<W> {
    /// Display sink writing to any sink (tests use a `Vec<u8>`)
    pub fn new(threshold: LogLevel, out: W) -> Self {
        Self { threshold, out }
    }

    /// Render one event, applying the display threshold
    pub fn render(&mut self, event: &Event) {
        let line = match event {
            Event::Log(log) => {
                if log.level < self.threshold {
                    return;
                }
                format!(
                    "[{}] {:8} {} ({}): {}",
                    log.timestamp.format("%H:%M:%S"),
                    log.level.to_string().to_uppercase(),
                    log.operation,
                    log.host,
                    log.message
                )
            }
            Event::Progress(p) => {
                let eta = p
                    .eta_seconds
                    .map(|s| format!(", ~{s}s left"))
                    .unwrap_or_default();
                format!(
                    "[{}] {:8} {}: {:.0}% {}{eta}",
                    p.timestamp.format("%H:%M:%S"),
                    "PROGRESS",
                    p.operation,
                    p.fraction * 100.0,
                    p.current_item
                )
            }
            Event::Connection(c) => format!(
                "[{}] {:8} {}",
                c.timestamp.format("%H:%M:%S"),
                "LINK",
                serde_json::to_string(&c.status).unwrap_or_else(|_| "?".to_string())
            ),
        };
        if let Err(e) = writeln!(self.out, "{line}") {
            warn!(error = %e, "Failed to write display line");
        }
    }

    /// Consume a subscription until the bus closes or `cancel` fires
    pub async fn run(mut self, mut events: Subscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                maybe = events.next() => match maybe {
                    Some(event) => self.render(&event),
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        while let Some(event) = events.try_next() {
            self.render(&event);
        }
    }
}
