use std::sync::atomic::{AtomicU64, Ordering};

use midway_observe::{Event, EventKind, EventSink, SessionContext};
use midway_policy::SuffixRouter;

mod config;
pub use config::{ConfigError, EndpointConfig, EngineConfig, ProxyConfig};

/// Parsed authority of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectParseError {
    IncompleteHeaders,
    InvalidUtf8,
    EmptyRequestLine,
    InvalidRequestLine,
    MethodNotConnect,
    InvalidHttpVersion,
    InvalidAuthority,
    MissingPort,
    InvalidPort,
}

impl ConnectParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::IncompleteHeaders => "incomplete_headers",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::MethodNotConnect => "method_not_connect",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
        }
    }
}

pub fn parse_connect_request_line(request_line: &str) -> Result<ConnectRequest, ConnectParseError> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ConnectParseError::EmptyRequestLine)?;
    let authority = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;

    if parts.next().is_some() {
        return Err(ConnectParseError::InvalidRequestLine);
    }
    if method != "CONNECT" {
        return Err(ConnectParseError::MethodNotConnect);
    }
    if !version.starts_with("HTTP/") {
        return Err(ConnectParseError::InvalidHttpVersion);
    }

    let (server_host, server_port) = parse_connect_authority(authority)?;
    Ok(ConnectRequest {
        server_host,
        server_port,
    })
}

/// Parses a buffered CONNECT head. Returns the request plus the number of
/// bytes the head occupies, so callers know where tunneled data begins.
pub fn parse_connect_request_head(
    input: &[u8],
) -> Result<(ConnectRequest, usize), ConnectParseError> {
    let header_end = header_terminator_index(input).ok_or(ConnectParseError::IncompleteHeaders)?;
    let head =
        std::str::from_utf8(&input[..header_end]).map_err(|_| ConnectParseError::InvalidUtf8)?;
    let request_line = head
        .split("\r\n")
        .next()
        .ok_or(ConnectParseError::EmptyRequestLine)?;
    let request = parse_connect_request_line(request_line)?;
    Ok((request, header_end))
}

fn header_terminator_index(input: &[u8]) -> Option<usize> {
    input
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

fn parse_connect_authority(authority: &str) -> Result<(String, u16), ConnectParseError> {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal, e.g. `[::1]:443`.
        let bracket_close = rest.find(']').ok_or(ConnectParseError::InvalidAuthority)?;
        let host = &rest[..bracket_close];
        if host.is_empty() {
            return Err(ConnectParseError::InvalidAuthority);
        }
        let suffix = &rest[bracket_close + 1..];
        let port_text = suffix
            .strip_prefix(':')
            .ok_or(ConnectParseError::MissingPort)?;
        let port = parse_port(port_text)?;
        return Ok((host.to_string(), port));
    }

    let (host, port_text) = authority
        .rsplit_once(':')
        .ok_or(ConnectParseError::MissingPort)?;
    if host.is_empty() || host.contains(':') {
        // An unbracketed colon-bearing host is an IPv6 literal missing its
        // brackets, which makes the port boundary ambiguous.
        return Err(ConnectParseError::InvalidAuthority);
    }
    let port = parse_port(port_text)?;
    Ok((host.to_string(), port))
}

fn parse_port(text: &str) -> Result<u16, ConnectParseError> {
    let port = text
        .parse::<u16>()
        .map_err(|_| ConnectParseError::InvalidPort)?;
    if port == 0 {
        return Err(ConnectParseError::InvalidPort);
    }
    Ok(port)
}

/// Which path a smart-listener connection takes after the policy lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteBinding {
    /// Host matched the suffix policy: hand off to the configured engine.
    Engine,
    /// No match: dial the destination directly.
    Direct,
}

impl RouteBinding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Direct => "direct",
        }
    }
}

/// Shared per-proxy state: the routing policy, the event sink, and the
/// session id counter every listener draws from.
pub struct ProxyCore<S: EventSink> {
    router: SuffixRouter,
    sink: S,
    next_session_id: AtomicU64,
}

impl<S: EventSink> ProxyCore<S> {
    pub fn new(router: SuffixRouter, sink: S) -> Self {
        Self {
            router,
            sink,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn router(&self) -> &SuffixRouter {
        &self.router
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn begin_session(
        &self,
        client_addr: impl Into<String>,
        server_host: impl Into<String>,
        server_port: u16,
    ) -> SessionContext {
        SessionContext {
            session_id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            client_addr: client_addr.into(),
            server_host: server_host.into(),
            server_port,
        }
    }

    /// Policy lookup against the live suffix snapshot, with the decision
    /// emitted to the event sink.
    pub fn decide_route(&self, context: &SessionContext) -> RouteBinding {
        let snapshot = self.router.snapshot();
        let binding = if snapshot.matches(&context.server_host) {
            RouteBinding::Engine
        } else {
            RouteBinding::Direct
        };
        self.sink.emit(
            Event::new(EventKind::RouteDecision, context.clone())
                .with_attribute("route", binding.as_str())
                .with_attribute("policy_generation", self.router.generation().to_string()),
        );
        binding
    }

    pub fn emit(&self, event: Event) {
        self.sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    include!("tests_connect_parser.rs");
    include!("tests_config_schema.rs");
    include!("tests_route_core.rs");
}
