//! Run events and the sinks that consume them.
//!
//! The executor never talks to a presentation layer directly. It pushes
//! [`BackupEvent`]s into an unbounded channel; a console, a file or a GUI
//! drains the receiving side at its own pace.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::types::{RunStatus, StepKind};

pub type EventStream = mpsc::UnboundedReceiver<BackupEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub step: Option<StepKind>,
    pub message: String,
}

impl LogLine {
    pub fn new(level: LogLevel, step: Option<StepKind>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            step,
            message: message.into(),
        }
    }

    /// Single-line rendering shared by the console and file sinks.
    pub fn render(&self) -> String {
        let ts = self.timestamp.format("%Y-%m-%d %H:%M:%S");
        match self.step {
            Some(step) => format!("{ts} {:<5} [{step}] {}", self.level.as_str(), self.message),
            None => format!("{ts} {:<5} {}", self.level.as_str(), self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BackupEvent {
    Log(LogLine),
    StepStarted(StepKind),
    StepFinished { step: StepKind, success: bool },
    /// Coarse run progress in `0.0..=1.0`, never decreasing.
    Progress(f64),
    /// Bytes received so far while downloading the archive.
    Transfer { bytes: u64, total: u64 },
    Finished(RunStatus),
}

/// Collects the run log and forwards everything to an optional subscriber.
pub struct Reporter {
    tx: Option<mpsc::UnboundedSender<BackupEvent>>,
    lines: Vec<LogLine>,
    progress: f64,
}

impl Reporter {
    pub fn new(tx: mpsc::UnboundedSender<BackupEvent>) -> Self {
        Self {
            tx: Some(tx),
            lines: Vec::new(),
            progress: 0.0,
        }
    }

    /// Reporter without a subscriber; lines are still collected and traced.
    pub fn detached() -> Self {
        Self {
            tx: None,
            lines: Vec::new(),
            progress: 0.0,
        }
    }

    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub(crate) fn sender(&self) -> Option<mpsc::UnboundedSender<BackupEvent>> {
        self.tx.clone()
    }

    pub fn emit(&self, event: BackupEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    pub fn log(&mut self, level: LogLevel, step: Option<StepKind>, message: impl Into<String>) {
        let line = LogLine::new(level, step, message);
        let step_name = step.map(|s| s.as_str()).unwrap_or("-");
        match level {
            LogLevel::Info => info!(step = step_name, "{}", line.message),
            LogLevel::Warn => warn!(step = step_name, "{}", line.message),
            LogLevel::Error => error!(step = step_name, "{}", line.message),
        }
        self.emit(BackupEvent::Log(line.clone()));
        self.lines.push(line);
    }

    pub fn info(&mut self, step: Option<StepKind>, message: impl Into<String>) {
        self.log(LogLevel::Info, step, message);
    }

    pub fn warn(&mut self, step: Option<StepKind>, message: impl Into<String>) {
        self.log(LogLevel::Warn, step, message);
    }

    pub fn error(&mut self, step: Option<StepKind>, message: impl Into<String>) {
        self.log(LogLevel::Error, step, message);
    }

    /// Publishes `fraction` unless it would move progress backwards.
    pub fn progress(&mut self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > self.progress {
            self.progress = fraction;
            self.emit(BackupEvent::Progress(fraction));
        }
    }

    pub fn current_progress(&self) -> f64 {
        self.progress
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn into_log(self) -> Vec<LogLine> {
        self.lines
    }
}

/// Anything that can present a run: ordered text lines plus a progress fraction.
pub trait ProgressSink {
    fn log_line(&mut self, line: &LogLine);

    fn progress(&mut self, fraction: f64);

    fn step_started(&mut self, _step: StepKind) {}

    fn transfer(&mut self, _bytes: u64, _total: u64) {}

    fn finished(&mut self, _status: RunStatus) {}
}

/// Feeds every event from `events` into `sink` until the run ends or the sender is dropped.
pub async fn drain<S: ProgressSink + ?Sized>(mut events: EventStream, sink: &mut S) {
    while let Some(event) = events.recv().await {
        match event {
            BackupEvent::Log(line) => sink.log_line(&line),
            BackupEvent::StepStarted(step) => sink.step_started(step),
            BackupEvent::StepFinished { .. } => {}
            BackupEvent::Progress(fraction) => sink.progress(fraction),
            BackupEvent::Transfer { bytes, total } => sink.transfer(bytes, total),
            BackupEvent::Finished(status) => {
                sink.finished(status);
                break;
            }
        }
    }
}

/// Appends rendered log lines to a file.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl ProgressSink for FileSink {
    fn log_line(&mut self, line: &LogLine) {
        if let Err(e) = writeln!(self.writer, "{}", line.render()) {
            warn!(error = %e, "Failed to write log file");
        }
    }

    fn progress(&mut self, _fraction: f64) {}

    fn finished(&mut self, status: RunStatus) {
        let _ = writeln!(self.writer, "run finished: {}", status.as_str());
        let _ = self.writer.flush();
    }
}

/// Fans every callback out to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ProgressSink + Send>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn ProgressSink + Send>) {
        self.sinks.push(sink);
    }
}

impl ProgressSink for MultiSink {
    fn log_line(&mut self, line: &LogLine) {
        self.sinks.iter_mut().for_each(|s| s.log_line(line));
    }

    fn progress(&mut self, fraction: f64) {
        self.sinks.iter_mut().for_each(|s| s.progress(fraction));
    }

    fn step_started(&mut self, step: StepKind) {
        self.sinks.iter_mut().for_each(|s| s.step_started(step));
    }

    fn transfer(&mut self, bytes: u64, total: u64) {
        self.sinks.iter_mut().for_each(|s| s.transfer(bytes, total));
    }

    fn finished(&mut self, status: RunStatus) {
        self.sinks.iter_mut().for_each(|s| s.finished(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        lines: Vec<String>,
        progress: Vec<f64>,
        finished: Option<RunStatus>,
    }

    impl ProgressSink for Recording {
        fn log_line(&mut self, line: &LogLine) {
            self.lines.push(line.message.clone());
        }

        fn progress(&mut self, fraction: f64) {
            self.progress.push(fraction);
        }

        fn finished(&mut self, status: RunStatus) {
            self.finished = Some(status);
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (mut reporter, mut rx) = Reporter::channel();
        reporter.progress(0.25);
        reporter.progress(0.10);
        reporter.progress(0.50);
        reporter.progress(7.0);

        let mut seen = Vec::new();
        while let Ok(BackupEvent::Progress(p)) = rx.try_recv() {
            seen.push(p);
        }
        assert_eq!(seen, vec![0.25, 0.50, 1.0]);
        assert_eq!(reporter.current_progress(), 1.0);
    }

    #[test]
    fn test_detached_reporter_keeps_log() {
        let mut reporter = Reporter::detached();
        reporter.info(Some(StepKind::Prepare), "creating temp dir");
        reporter.error(None, "boom");

        let log = reporter.into_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].step, Some(StepKind::Prepare));
        assert_eq!(log[1].level, LogLevel::Error);
    }

    #[test]
    fn test_render_includes_step() {
        let line = LogLine::new(LogLevel::Warn, Some(StepKind::CopyMedia), "no media directory");
        let rendered = line.render();
        assert!(rendered.contains("WARN"));
        assert!(rendered.contains("[copy-media] no media directory"));
    }

    #[tokio::test]
    async fn test_drain_stops_at_finished() {
        let (mut reporter, rx) = Reporter::channel();
        reporter.info(None, "one");
        reporter.progress(0.5);
        reporter.emit(BackupEvent::Finished(RunStatus::Success));
        reporter.info(None, "after finish");

        let mut sink = Recording::default();
        drain(rx, &mut sink).await;

        assert_eq!(sink.lines, vec!["one".to_string()]);
        assert_eq!(sink.progress, vec![0.5]);
        assert_eq!(sink.finished, Some(RunStatus::Success));
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        {
            let mut sink = FileSink::open(&path).unwrap();
            sink.log_line(&LogLine::new(LogLevel::Info, None, "hello"));
            sink.finished(RunStatus::Failure);
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.contains("run finished: failure"));
    }
}
