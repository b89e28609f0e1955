use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use midway_core::{
    parse_connect_request_head, EngineConfig, ProxyConfig, ProxyCore, RouteBinding,
};
use midway_observe::{Event, EventKind, EventSink, SessionContext};
use midway_policy::SuffixRouter;
use midway_tls::{
    classify_tls_error, build_public_client_config, CertificatePool, CertificatePoolConfig,
    PoolMetricsSnapshot, RootAuthorityConfig,
};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const IO_CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;
/// Correlation header stamped on every proxied request leaving a tunnel.
const SESSION_HEADER: &str = "X-Midway-Session";
/// Content type of wrapped requests posted to a relay endpoint.
const RELAY_CONTENT_TYPE: &str = "application/data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Consults the domain suffix policy before choosing a path.
    Smart,
    /// Always applies the configured engine.
    Plain,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Plain => "plain",
        }
    }
}

struct RuntimeHandles<S>
where
    S: EventSink + Send + Sync + 'static,
{
    config: Arc<ProxyConfig>,
    core: Arc<ProxyCore<S>>,
    pool: Arc<CertificatePool>,
    engine: Arc<Engine>,
    upstream_tls: Arc<ClientConfig>,
}

impl<S> Clone for RuntimeHandles<S>
where
    S: EventSink + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            core: Arc::clone(&self.core),
            pool: Arc::clone(&self.pool),
            engine: Arc::clone(&self.engine),
            upstream_tls: Arc::clone(&self.upstream_tls),
        }
    }
}

/// The two-listener intercepting proxy: a smart listener that routes by
/// domain suffix and a plain listener that always applies the engine.
pub struct ProxyServer<S>
where
    S: EventSink + Send + Sync + 'static,
{
    runtime: RuntimeHandles<S>,
}

impl<S> ProxyServer<S>
where
    S: EventSink + Send + Sync + 'static,
{
    pub fn new(config: ProxyConfig, sink: S) -> io::Result<Self> {
        config
            .validate()
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error.to_string()))?;

        let suffixes = match &config.suffix_file {
            Some(path) => load_suffix_file(path)?,
            None => Vec::new(),
        };
        let core = Arc::new(ProxyCore::new(SuffixRouter::new(suffixes), sink));

        let cert_dir = std::path::PathBuf::from(&config.cert_dir);
        let ca_cert_path = config
            .ca_cert_pem_path
            .as_ref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| cert_dir.join("root.pem"));
        let ca_key_path = config
            .ca_key_pem_path
            .as_ref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| cert_dir.join("root.key.pem"));
        let mut root = RootAuthorityConfig::new(ca_cert_path, ca_key_path);
        root.ca_common_name = config.ca_common_name.clone();
        root.ca_organization = config.ca_organization.clone();
        let mut pool_config = CertificatePoolConfig::new(root, cert_dir.join("leaves"));
        pool_config.leaf_validity = Duration::from_secs(config.leaf_validity_seconds);
        pool_config.expiry_margin = Duration::from_secs(config.expiry_margin_seconds);
        let pool = CertificatePool::new(pool_config).map_err(io::Error::other)?;

        let engine = Engine::from_config(&config.engine)?;

        Ok(Self {
            runtime: RuntimeHandles {
                config: Arc::new(config),
                core,
                pool: Arc::new(pool),
                engine: Arc::new(engine),
                upstream_tls: build_public_client_config(),
            },
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.runtime.config
    }

    pub fn core(&self) -> &Arc<ProxyCore<S>> {
        &self.runtime.core
    }

    pub fn ca_certificate_pem(&self) -> &str {
        self.runtime.pool.ca_certificate_pem()
    }

    pub fn ca_certificate_der(&self) -> &CertificateDer<'static> {
        self.runtime.pool.ca_certificate_der()
    }

    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.runtime.pool.metrics_snapshot()
    }

    /// Re-reads the suffix file and swaps the live policy snapshot.
    pub fn reload_policy(&self) -> io::Result<u64> {
        reload_policy(&self.runtime)
    }

    /// Watches for SIGHUP and reloads the suffix policy on each signal.
    #[cfg(unix)]
    pub fn spawn_policy_reload(&self) -> io::Result<tokio::task::JoinHandle<()>> {
        let runtime = self.runtime.clone();
        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        Ok(tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                if let Err(error) = reload_policy(&runtime) {
                    eprintln!("policy reload failed: {error}");
                }
            }
        }))
    }

    pub async fn bind(&self) -> io::Result<(TcpListener, TcpListener)> {
        let config = &self.runtime.config;
        let smart =
            TcpListener::bind((config.listen_addr.as_str(), config.smart_listen_port)).await?;
        let plain =
            TcpListener::bind((config.listen_addr.as_str(), config.plain_listen_port)).await?;
        Ok((smart, plain))
    }

    pub async fn run(self) -> io::Result<()> {
        let (smart, plain) = self.bind().await?;
        self.run_with_listeners(smart, plain).await
    }

    pub async fn run_with_listeners(
        self,
        smart: TcpListener,
        plain: TcpListener,
    ) -> io::Result<()> {
        let smart_loop = accept_loop(self.runtime.clone(), ListenerKind::Smart, smart);
        let plain_loop = accept_loop(self.runtime.clone(), ListenerKind::Plain, plain);
        tokio::try_join!(smart_loop, plain_loop)?;
        Ok(())
    }
}

async fn accept_loop<S>(
    runtime: RuntimeHandles<S>,
    kind: ListenerKind,
    listener: TcpListener,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    loop {
        let (stream, client_addr) = listener.accept().await?;
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if let Err(error) =
                handle_client(runtime, kind, stream, client_addr.to_string()).await
            {
                eprintln!("{} connection handling failed: {error}", kind.as_str());
            }
        });
    }
}

async fn handle_client<S>(
    runtime: RuntimeHandles<S>,
    kind: ListenerKind,
    mut stream: TcpStream,
    client_addr: String,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let head = match read_initial_head(&mut stream, runtime.config.max_http_head_bytes).await {
        Ok(head) => head,
        Err(error) => {
            if error.kind() == io::ErrorKind::InvalidData {
                send_status(
                    &mut stream,
                    "431 Request Header Fields Too Large",
                    "request head exceeded the configured limit",
                )
                .await?;
            }
            // A connection opened and closed without a request is routine.
            if error.kind() == io::ErrorKind::ConnectionAborted {
                return Ok(());
            }
            return Err(error);
        }
    };

    if head.starts_with(b"CONNECT ") {
        let (connect, _header_len) = match parse_connect_request_head(&head) {
            Ok(parsed) => parsed,
            Err(parse_error) => {
                let context = runtime.core.begin_session(client_addr, "<unknown>", 0);
                runtime.core.emit(
                    Event::new(EventKind::SessionError, context)
                        .with_attribute("reason", "connect_parse_failed")
                        .with_attribute("code", parse_error.code()),
                );
                send_status(&mut stream, "400 Bad Request", "invalid CONNECT request").await?;
                return Ok(());
            }
        };

        let context = runtime.core.begin_session(
            client_addr,
            connect.server_host.clone(),
            connect.server_port,
        );
        runtime.core.emit(
            Event::new(EventKind::ConnectReceived, context.clone())
                .with_attribute("listener", kind.as_str()),
        );

        let binding = match kind {
            ListenerKind::Smart => runtime.core.decide_route(&context),
            ListenerKind::Plain => RouteBinding::Engine,
        };
        return match binding {
            // Policy misses are spliced blind at whatever port was asked
            // for; the 443-only rule applies to intercepted tunnels.
            RouteBinding::Direct => tunnel_direct(runtime.clone(), context, stream).await,
            RouteBinding::Engine => {
                let engine = Arc::clone(&runtime.engine);
                engine.handle_connect(runtime, context, stream).await
            }
        };
    }

    handle_plain_requests(runtime, kind, client_addr, stream, head).await
}

include!("http1_wire.rs");
include!("engine_ops.rs");
include!("tunnel_intercept.rs");
include!("plain_forward.rs");
include!("reload_ops.rs");

#[cfg(test)]
mod tests {
    include!("tests_proxy_units.rs");
}
