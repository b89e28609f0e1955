trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Destination of a cleartext proxy request, resolved from the request
/// target (absolute form) or the Host header (origin form).
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlainTarget {
    host: String,
    port: u16,
    tls: bool,
    origin_form: String,
}

impl PlainTarget {
    fn default_port(tls: bool) -> u16 {
        if tls {
            443
        } else {
            80
        }
    }

    fn authority(&self) -> String {
        if self.port == Self::default_port(self.tls) {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn absolute_form(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}{}", self.authority(), self.origin_form)
    }
}

fn resolve_plain_target(request: &RequestHead) -> io::Result<PlainTarget> {
    if let Some(rest) = request.target.strip_prefix("http://") {
        return resolve_absolute_target(rest, false);
    }
    if let Some(rest) = request.target.strip_prefix("https://") {
        return resolve_absolute_target(rest, true);
    }
    if request.target.starts_with('/') {
        let host_header = field_value(&request.fields, "host").ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "origin-form request is missing a Host header",
            )
        })?;
        let (host, port) = split_authority(host_header, 80)?;
        return Ok(PlainTarget {
            host,
            port,
            tls: false,
            origin_form: request.target.clone(),
        });
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "request target must be absolute form or origin form",
    ))
}

fn resolve_absolute_target(rest: &str, tls: bool) -> io::Result<PlainTarget> {
    let (authority, origin_form) = match rest.find('/') {
        Some(index) => (&rest[..index], rest[index..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = split_authority(authority, PlainTarget::default_port(tls))?;
    Ok(PlainTarget {
        host,
        port,
        tls,
        origin_form,
    })
}

fn split_authority(authority: &str, default_port: u16) -> io::Result<(String, u16)> {
    if authority.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request authority is empty",
        ));
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unterminated IPv6 authority")
        })?;
        let host = rest[..close].to_string();
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(port_text) => parse_authority_port(port_text)?,
            None => default_port,
        };
        return Ok((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            Ok((host.to_string(), parse_authority_port(port_text)?))
        }
        Some(_) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "IPv6 authority must be bracketed",
        )),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_authority_port(text: &str) -> io::Result<u16> {
    text.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid authority port"))
}

struct CachedUpstream {
    key: (String, u16, bool),
    conn: Http1Conn<BoxedStream>,
}

/// Serves cleartext proxy requests on one downstream connection. The smart
/// listener consults the routing policy per request; the plain listener
/// always applies the configured engine. Upstream connections are reused
/// across sequential requests to the same destination.
async fn handle_plain_requests<S>(
    runtime: RuntimeHandles<S>,
    kind: ListenerKind,
    client_addr: String,
    downstream: TcpStream,
    initial_head: Vec<u8>,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let max_head = runtime.config.max_http_head_bytes;
    let mut downstream = Http1Conn::new(downstream);
    let mut next_head = Some(initial_head);
    let mut cached_upstream: Option<CachedUpstream> = None;

    loop {
        let head = match next_head.take() {
            Some(head) => head,
            None => match downstream.next_head(max_head).await? {
                Some(head) => head,
                None => break,
            },
        };

        let request = match parse_request_head(&head) {
            Ok(parsed) => parsed,
            Err(error) => {
                send_status(
                    &mut downstream.io,
                    "400 Bad Request",
                    "invalid HTTP proxy request",
                )
                .await?;
                return Err(error);
            }
        };
        let target = match resolve_plain_target(&request) {
            Ok(resolved) => resolved,
            Err(error) => {
                send_status(
                    &mut downstream.io,
                    "400 Bad Request",
                    "invalid HTTP proxy target",
                )
                .await?;
                return Err(error);
            }
        };

        let context = runtime
            .core
            .begin_session(client_addr.clone(), target.host.clone(), target.port);
        let started = Instant::now();
        let binding = match kind {
            ListenerKind::Smart => runtime.core.decide_route(&context),
            ListenerKind::Plain => RouteBinding::Engine,
        };
        let engine = match binding {
            RouteBinding::Engine => runtime.engine.as_ref(),
            RouteBinding::Direct => &Engine::Direct,
        };

        let exchange = engine
            .handle_plain(
                &runtime,
                &context,
                &mut downstream,
                &request,
                &target,
                &mut cached_upstream,
            )
            .await;

        match exchange {
            Ok(close) => {
                emit_session_closed(&runtime, context, started, "ok");
                if close || request.wants_close {
                    break;
                }
            }
            Err(error) => {
                runtime.core.emit(
                    Event::new(EventKind::SessionError, context.clone())
                        .with_attribute("reason", "exchange_failed")
                        .with_attribute("engine", engine.kind())
                        .with_attribute("detail", error.to_string()),
                );
                emit_session_closed(&runtime, context, started, "exchange_failed");
                return Err(error);
            }
        }
    }

    Ok(())
}

async fn connect_upstream(
    host: &str,
    port: u16,
    tls: bool,
    tls_config: &Arc<ClientConfig>,
) -> io::Result<BoxedStream> {
    let tcp = TcpStream::connect((host, port)).await?;
    if !tls {
        return Ok(Box::new(tcp));
    }
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid upstream server name"))?;
    let connector = TlsConnector::from(Arc::clone(tls_config));
    let stream = connector.connect(server_name, tcp).await?;
    Ok(Box::new(stream))
}

/// Returns a cached upstream connection when it still points at `key`,
/// otherwise dials a fresh one.
async fn upstream_for<'c>(
    cached: &'c mut Option<CachedUpstream>,
    key: (String, u16, bool),
    tls_config: &Arc<ClientConfig>,
) -> io::Result<&'c mut Http1Conn<BoxedStream>> {
    let reusable = matches!(cached, Some(existing) if existing.key == key);
    if !reusable {
        let conn = connect_upstream(&key.0, key.1, key.2, tls_config).await?;
        *cached = Some(CachedUpstream {
            key,
            conn: Http1Conn::new(conn),
        });
    }
    Ok(&mut cached
        .as_mut()
        .ok_or_else(|| io::Error::other("upstream cache unexpectedly empty"))?
        .conn)
}

/// Dials the destination itself and exchanges one request/response pair.
async fn exchange_direct<S, D>(
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
    let max_head = runtime.config.max_http_head_bytes;
    let key = (target.host.clone(), target.port, target.tls);
    let upstream = upstream_for(cached_upstream, key, &runtime.upstream_tls).await?;

    let fields = upstream_fields(request);
    let origin_head = encode_request_head(
        &request.method,
        &target.origin_form,
        request.protocol,
        &fields,
    );
    upstream.io.write_all(&origin_head).await?;
    downstream
        .copy_body(&mut upstream.io, request.framing, max_head)
        .await?;
    upstream.io.flush().await?;
    runtime.core.emit(
        Event::new(EventKind::RequestForwarded, context.clone())
            .with_attribute("engine", "direct")
            .with_attribute("method", request.method.clone())
            .with_attribute("target", target.absolute_form()),
    );

    let response_head = upstream.next_head(max_head).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "upstream closed before responding",
        )
    })?;
    let response = parse_response_head(&response_head, &request.method)?;

    downstream.io.write_all(&response.raw).await?;
    upstream
        .copy_body(&mut downstream.io, response.framing, max_head)
        .await?;
    downstream.io.flush().await?;
    runtime.core.emit(
        Event::new(EventKind::ResponseReturned, context.clone())
            .with_attribute("engine", "direct")
            .with_attribute("status", response.status.to_string()),
    );

    if response.wants_close {
        *cached_upstream = None;
    }
    Ok(response.wants_close)
}

/// Forwards the proxied request as-is to the remote tunnel endpoint, which
/// speaks the same proxied-HTTP dialect.
#[allow(clippy::too_many_arguments)]
async fn exchange_remote<S, D>(
    runtime: &RuntimeHandles<S>,
    context: &SessionContext,
    downstream: &mut Http1Conn<D>,
    request: &RequestHead,
    target: &PlainTarget,
    endpoint_host: &str,
    endpoint_port: u16,
    cached_upstream: &mut Option<CachedUpstream>,
) -> io::Result<bool>
where
    S: EventSink + Send + Sync + 'static,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let max_head = runtime.config.max_http_head_bytes;
    let key = (endpoint_host.to_string(), endpoint_port, false);
    let upstream = upstream_for(cached_upstream, key, &runtime.upstream_tls).await?;

    let mut fields = upstream_fields(request);
    fields.push((SESSION_HEADER.to_string(), context.session_id.to_string()));
    let proxied_head = encode_request_head(
        &request.method,
        &target.absolute_form(),
        request.protocol,
        &fields,
    );
    upstream.io.write_all(&proxied_head).await?;
    downstream
        .copy_body(&mut upstream.io, request.framing, max_head)
        .await?;
    upstream.io.flush().await?;
    runtime.core.emit(
        Event::new(EventKind::RequestForwarded, context.clone())
            .with_attribute("engine", "remote")
            .with_attribute("method", request.method.clone())
            .with_attribute("target", target.absolute_form()),
    );

    let response_head = upstream.next_head(max_head).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "tunnel endpoint closed before responding",
        )
    })?;
    let response = parse_response_head(&response_head, &request.method)?;

    downstream.io.write_all(&response.raw).await?;
    upstream
        .copy_body(&mut downstream.io, response.framing, max_head)
        .await?;
    downstream.io.flush().await?;
    runtime.core.emit(
        Event::new(EventKind::ResponseReturned, context.clone())
            .with_attribute("engine", "remote")
            .with_attribute("status", response.status.to_string()),
    );

    if response.wants_close {
        *cached_upstream = None;
    }
    Ok(response.wants_close)
}

/// Wraps the whole proxied request into an HTTP POST to the relay URL. The
/// relay's response body carries the destination's response verbatim, which
/// is streamed back to the client untouched.
async fn exchange_relay<S, D>(
    runtime: &RuntimeHandles<S>,
    context: &SessionContext,
    downstream: &mut Http1Conn<D>,
    request: &RequestHead,
    target: &PlainTarget,
    relay: &RelayTarget,
) -> io::Result<bool>
where
    S: EventSink + Send + Sync + 'static,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let max_head = runtime.config.max_http_head_bytes;

    let mut wrapped = request.raw.clone();
    let body = downstream.slurp_body(request.framing, max_head).await?;
    wrapped.extend_from_slice(&body);

    let envelope_head = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: {RELAY_CONTENT_TYPE}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        relay.path,
        relay.host_header(),
        wrapped.len(),
    );

    let stream = connect_upstream(&relay.host, relay.port, relay.tls, &runtime.upstream_tls).await?;
    let mut relay_conn = Http1Conn::new(stream);
    relay_conn.io.write_all(envelope_head.as_bytes()).await?;
    relay_conn.io.write_all(&wrapped).await?;
    relay_conn.io.flush().await?;
    runtime.core.emit(
        Event::new(EventKind::RequestForwarded, context.clone())
            .with_attribute("engine", "relay")
            .with_attribute("method", request.method.clone())
            .with_attribute("target", target.absolute_form()),
    );

    let response_head = relay_conn.next_head(max_head).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "relay closed before responding",
        )
    })?;
    let envelope = parse_response_head(&response_head, "POST")?;
    if envelope.status != 200 {
        send_status(
            &mut downstream.io,
            "502 Bad Gateway",
            "relay returned a non-200 envelope",
        )
        .await?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("relay envelope status {}", envelope.status),
        ));
    }

    // The envelope body is the destination's response, relayed untouched.
    relay_conn
        .copy_body(&mut downstream.io, envelope.framing, max_head)
        .await?;
    downstream.io.flush().await?;
    runtime.core.emit(
        Event::new(EventKind::ResponseReturned, context.clone())
            .with_attribute("engine", "relay")
            .with_attribute("status", "wrapped"),
    );

    Ok(request.wants_close)
}

/// Header fields for the upstream hop: proxy bookkeeping stripped.
fn upstream_fields(request: &RequestHead) -> Vec<HeaderField> {
    request
        .fields
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case(SESSION_HEADER)
                && !name.eq_ignore_ascii_case("proxy-connection")
        })
        .cloned()
        .collect()
}
