//! Logging sink handed to the capture session.
//!
//! The orchestrator never reaches for process-wide logger state on its own; it
//! logs through the `SessionLog` it was constructed with. `SessionLog::global()`
//! forwards to whatever `log` backend the process installed (env_logger in the
//! binary), tests inject a `MemoryLog` and inspect what was reported.

use log::{Level, Log, Metadata, Record};
use std::fmt;
use std::sync::{Arc, Mutex};

const DEFAULT_TARGET: &str = "kinect_capture";

#[derive(Clone)]
pub struct SessionLog {
    sink: Arc<dyn Log>,
    target: &'static str,
}

impl SessionLog {
    pub fn new(sink: Arc<dyn Log>) -> Self {
        Self {
            sink,
            target: DEFAULT_TARGET,
        }
    }

    /// Forward to the process-wide `log` backend.
    pub fn global() -> Self {
        Self::new(Arc::new(GlobalLogger))
    }

    pub fn with_target(mut self, target: &'static str) -> Self {
        self.target = target;
        self
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Debug, args);
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        let metadata = Metadata::builder().level(level).target(self.target).build();
        if !self.sink.enabled(&metadata) {
            return;
        }
        self.sink
            .log(&Record::builder().metadata(metadata).args(args).build());
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLog")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

struct GlobalLogger;

impl Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level() && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        log::logger().log(record);
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// In-memory sink, records every line at every level.
#[derive(Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<LogLine>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|line| line.level == level && line.message.contains(needle))
    }
}

impl Log for MemoryLog {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(LogLine {
                level: record.level(),
                target: record.target().to_string(),
                message: record.args().to_string(),
            });
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_captures_levels() {
        let memory = MemoryLog::new();
        let log = SessionLog::new(memory.clone());
        log.warn(format_args!("save failed: {}", 3));
        log.info(format_args!("device started"));

        assert!(memory.contains(Level::Warn, "save failed: 3"));
        assert!(memory.contains(Level::Info, "device started"));
        assert_eq!(memory.lines().len(), 2);
    }

    #[test]
    fn target_follows_the_session_log() {
        let memory = MemoryLog::new();
        let log = SessionLog::new(memory.clone());
        log.debug(format_args!("default target"));
        log.with_target("kinect_capture::recorder")
            .debug(format_args!("recorder target"));

        let targets: Vec<String> = memory.lines().into_iter().map(|line| line.target).collect();
        assert_eq!(targets, ["kinect_capture", "kinect_capture::recorder"]);
        assert!(memory.contains(Level::Debug, "recorder target"));
    }
}
