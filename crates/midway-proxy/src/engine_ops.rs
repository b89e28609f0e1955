/// Runtime form of [`EngineConfig`], with the relay URL pre-parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Engine {
    Direct,
    Remote {
        endpoint_host: String,
        endpoint_port: u16,
    },
    Relay {
        relay: RelayTarget,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RelayTarget {
    tls: bool,
    host: String,
    port: u16,
    path: String,
}

impl RelayTarget {
    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Engine {
    fn from_config(config: &EngineConfig) -> io::Result<Self> {
        match config {
            EngineConfig::Direct => Ok(Self::Direct),
            EngineConfig::Remote { endpoint } => Ok(Self::Remote {
                endpoint_host: endpoint.host.clone(),
                endpoint_port: endpoint.port,
            }),
            EngineConfig::Relay { relay_url } => Ok(Self::Relay {
                relay: parse_relay_url(relay_url)?,
            }),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Remote { .. } => "remote",
            Self::Relay { .. } => "relay",
        }
    }

    /// Serves one cleartext proxy exchange with this engine. Returns whether
    /// the upstream side asked to close. CONNECT belongs on the tunnel path
    /// and is refused here.
    async fn handle_plain<S, D>(
        &self,
        runtime: &RuntimeHandles<S>,
        context: &SessionContext,
        downstream: &mut Http1Conn<D>,
        request: &RequestHead,
        target: &PlainTarget,
        cached_upstream: &mut Option<CachedUpstream>,
    ) -> io::Result<bool>
    where
        S: EventSink + Send + Sync + 'static,
        D: AsyncRead + AsyncWrite + Unpin,
    {
        if request.method.eq_ignore_ascii_case("CONNECT") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "CONNECT requests must take the tunnel path",
            ));
        }
        match self {
            Self::Direct => {
                exchange_direct(runtime, context, downstream, request, target, cached_upstream)
                    .await
            }
            Self::Remote {
                endpoint_host,
                endpoint_port,
            } => {
                exchange_remote(
                    runtime,
                    context,
                    downstream,
                    request,
                    target,
                    endpoint_host,
                    *endpoint_port,
                    cached_upstream,
                )
                .await
            }
            Self::Relay { relay } => {
                exchange_relay(runtime, context, downstream, request, target, relay).await
            }
        }
    }

    /// Runs the intercepting tunnel for an accepted CONNECT against this
    /// engine's backend.
    async fn handle_connect<S>(
        &self,
        runtime: RuntimeHandles<S>,
        context: SessionContext,
        downstream: TcpStream,
    ) -> io::Result<()>
    where
        S: EventSink + Send + Sync + 'static,
    {
        intercept_connect(runtime, context, downstream).await
    }

    /// Backend a MITM tunnel forwards decrypted proxied requests to. The
    /// remote engine speaks proxied HTTP natively; the direct and relay
    /// engines re-enter this proxy's own plain listener, which applies the
    /// engine to each unwrapped request.
    fn tunnel_backend(&self, config: &ProxyConfig) -> (String, u16) {
        match self {
            Self::Remote {
                endpoint_host,
                endpoint_port,
            } => (endpoint_host.clone(), *endpoint_port),
            Self::Direct | Self::Relay { .. } => {
                (config.listen_addr.clone(), config.plain_listen_port)
            }
        }
    }
}

fn parse_relay_url(url: &str) -> io::Result<RelayTarget> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "relay URL must use http or https",
        ));
    };

    let (authority, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "relay URL is missing a host",
        ));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.is_empty() => {
            let port = port_text.parse::<u16>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "relay URL has an invalid port")
            })?;
            (host.to_string(), port)
        }
        _ => (authority.to_string(), if tls { 443 } else { 80 }),
    };

    Ok(RelayTarget {
        tls,
        host,
        port,
        path: path.to_string(),
    })
}
