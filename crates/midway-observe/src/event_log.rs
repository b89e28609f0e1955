use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{Event, EventSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogConfig {
    pub log_path: PathBuf,
    pub flush_every: usize,
}

impl EventLogConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            flush_every: 1,
        }
    }

    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every.max(1);
        self
    }
}

#[derive(Debug)]
struct EventLogState {
    writer: BufWriter<File>,
    events_since_flush: usize,
}

/// NDJSON event sink: one serialized [`Event`] per line. Write failures are
/// counted rather than propagated so a broken log never takes a connection
/// down with it.
#[derive(Debug)]
pub struct EventLogSink {
    config: EventLogConfig,
    state: Mutex<EventLogState>,
    write_error_count: AtomicU64,
}

impl EventLogSink {
    pub fn new(config: EventLogConfig) -> io::Result<Self> {
        if config.log_path.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "event log path must not be empty",
            ));
        }

        let file = open_log_file(&config.log_path)?;
        Ok(Self {
            config,
            state: Mutex::new(EventLogState {
                writer: BufWriter::new(file),
                events_since_flush: 0,
            }),
            write_error_count: AtomicU64::new(0),
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.writer.flush()
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_error_count.load(Ordering::Relaxed)
    }

    fn try_emit(&self, event: &Event) -> io::Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        let mut state = self.state.lock().expect("lock poisoned");
        writeln!(state.writer, "{line}")?;
        state.events_since_flush += 1;
        if state.events_since_flush >= self.config.flush_every {
            state.writer.flush()?;
            state.events_since_flush = 0;
        }
        Ok(())
    }
}

impl EventSink for EventLogSink {
    fn emit(&self, event: Event) {
        if self.try_emit(&event).is_err() {
            self.write_error_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, SessionContext};

    fn context() -> SessionContext {
        SessionContext {
            session_id: 1,
            client_addr: "127.0.0.1:4000".to_string(),
            server_host: "example.com".to_string(),
            server_port: 443,
        }
    }

    #[test]
    fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.ndjson");
        let sink = EventLogSink::new(EventLogConfig::new(&path)).expect("sink");

        sink.emit(Event::new(EventKind::ConnectReceived, context()));
        sink.emit(Event::new(EventKind::SessionClosed, context()).with_attribute("outcome", "ok"));
        sink.flush().expect("flush");

        let contents = fs::read_to_string(&path).expect("read log");
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("connect_received"));
        assert!(lines[1].contains("session_closed"));
        assert_eq!(sink.write_error_count(), 0);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/deeper/events.ndjson");
        let sink = EventLogSink::new(EventLogConfig::new(&path)).expect("sink");
        sink.emit(Event::new(EventKind::PolicyReloaded, context()));
        sink.flush().expect("flush");
        assert!(path.exists());
    }
}
