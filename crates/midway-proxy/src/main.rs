use std::env;
use std::io;

use midway_core::ProxyConfig;
use midway_observe::{EventLogConfig, EventLogSink, EventSink, NoopEventSink};
use midway_proxy::ProxyServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Ok,
    ConfigInvalid,
    EventSinkInitFailed,
    ServerInitFailed,
    RuntimeFailed,
}

impl ExitClass {
    fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ConfigInvalid => 20,
            Self::EventSinkInitFailed => 21,
            Self::ServerInitFailed => 22,
            Self::RuntimeFailed => 23,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ConfigInvalid => "config_invalid",
            Self::EventSinkInitFailed => "event_sink_init_failed",
            Self::ServerInitFailed => "server_init_failed",
            Self::RuntimeFailed => "runtime_failed",
        }
    }
}

#[derive(Debug)]
struct RunOutcome {
    class: ExitClass,
    detail: Option<String>,
}

impl RunOutcome {
    fn ok() -> Self {
        Self {
            class: ExitClass::Ok,
            detail: None,
        }
    }

    fn error(class: ExitClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: Some(detail.into()),
        }
    }
}

#[tokio::main]
async fn main() {
    let outcome = run_proxy().await;
    if let Some(detail) = &outcome.detail {
        eprintln!("midway exiting ({}): {detail}", outcome.class.label());
    }
    std::process::exit(outcome.class.code());
}

async fn run_proxy() -> RunOutcome {
    let config = match load_config() {
        Ok(config) => config,
        Err(error) => return RunOutcome::error(ExitClass::ConfigInvalid, error.to_string()),
    };

    let sink = match build_event_sink(&config) {
        Ok(sink) => sink,
        Err(error) => return RunOutcome::error(ExitClass::EventSinkInitFailed, error.to_string()),
    };

    let server = match ProxyServer::new(config, sink) {
        Ok(server) => server,
        Err(error) => return RunOutcome::error(ExitClass::ServerInitFailed, error.to_string()),
    };

    let reload_task = if server.config().suffix_file.is_some() {
        match server.spawn_policy_reload() {
            Ok(handle) => Some(handle),
            Err(error) => {
                return RunOutcome::error(ExitClass::ServerInitFailed, error.to_string())
            }
        }
    } else {
        None
    };

    eprintln!(
        "midway listening: smart {}:{} plain {}:{} engine {}",
        server.config().listen_addr,
        server.config().smart_listen_port,
        server.config().listen_addr,
        server.config().plain_listen_port,
        server.config().engine.kind(),
    );

    let result = server.run().await;
    if let Some(handle) = reload_task {
        handle.abort();
    }
    match result {
        Ok(()) => RunOutcome::ok(),
        Err(error) => RunOutcome::error(ExitClass::RuntimeFailed, error.to_string()),
    }
}

fn load_config() -> Result<ProxyConfig, midway_core::ConfigError> {
    let mut args = env::args().skip(1);
    match args.next() {
        Some(path) => ProxyConfig::load_from_path(path),
        None => {
            let config = ProxyConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn build_event_sink(config: &ProxyConfig) -> io::Result<Box<dyn EventSink + Send + Sync>> {
    match &config.event_log_path {
        Some(path) => {
            let sink = EventLogSink::new(EventLogConfig::new(path))?;
            Ok(Box::new(sink))
        }
        None => Ok(Box::new(NoopEventSink)),
    }
}
