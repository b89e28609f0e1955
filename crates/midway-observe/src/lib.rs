use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

mod event_log;

pub use event_log::{EventLogConfig, EventLogSink};

/// Lifecycle markers emitted by the proxy core. `SessionClosed` and
/// `SessionError` are the two records the rest of the system is contractually
/// required to emit: a completion record (outcome, duration) and an error
/// record (message, cause). Everything else is supporting detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectReceived,
    RouteDecision,
    TlsHandshakeStarted,
    TlsHandshakeSucceeded,
    TlsHandshakeFailed,
    TunnelEstablished,
    RequestForwarded,
    ResponseReturned,
    PolicyReloaded,
    SessionError,
    SessionClosed,
}

/// Per-request correlation context. Session ids are monotonically increasing
/// and unique for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionContext {
    pub session_id: u64,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub context: SessionContext,
    pub occurred_at_unix_ms: u64,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, context: SessionContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Collects events in memory; test sink.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

impl<T: EventSink + ?Sized> EventSink for Box<T> {
    fn emit(&self, event: Event) {
        (**self).emit(event);
    }
}

fn now_unix_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(u128::from(u64::MAX)) as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SessionContext {
        SessionContext {
            session_id: 7,
            client_addr: "127.0.0.1:9999".to_string(),
            server_host: "example.com".to_string(),
            server_port: 443,
        }
    }

    #[test]
    fn vec_sink_records_events_in_order() {
        let sink = VecEventSink::default();
        sink.emit(Event::new(EventKind::ConnectReceived, context()));
        sink.emit(
            Event::new(EventKind::SessionClosed, context()).with_attribute("outcome", "ok"),
        );

        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::ConnectReceived);
        assert_eq!(events[1].kind, EventKind::SessionClosed);
        assert_eq!(events[1].attributes.get("outcome").map(String::as_str), Some("ok"));
    }

    #[test]
    fn events_serialize_with_snake_case_kinds() {
        let event = Event::new(EventKind::TlsHandshakeFailed, context());
        let json = serde_json::to_string(&event).expect("serialize event");
        assert!(json.contains("\"tls_handshake_failed\""), "{json}");
        assert!(json.contains("\"session_id\":7"), "{json}");
    }
}
