/// In-flight request metadata handed from the request loop to the response
/// loop. The bounded channel is the only coordination between the two.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRequest {
    method: String,
    wants_close: bool,
}

/// MITM CONNECT handling: dial the engine backend, accept the client's TLS
/// handshake with a minted leaf, then relay decrypted requests in proxied
/// form while responses stream back in request order.
async fn intercept_connect<S>(
    runtime: RuntimeHandles<S>,
    context: SessionContext,
    mut downstream: TcpStream,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let started = Instant::now();

    if context.server_port != 443 {
        runtime.core.emit(
            Event::new(EventKind::SessionError, context.clone())
                .with_attribute("reason", "unsupported_connect_port")
                .with_attribute("port", context.server_port.to_string()),
        );
        send_status(
            &mut downstream,
            "400 Bad Request",
            "only port 443 CONNECT is supported",
        )
        .await?;
        emit_session_closed(&runtime, context, started, "rejected_port");
        return Ok(());
    }

    let (backend_host, backend_port) = runtime.engine.tunnel_backend(&runtime.config);
    let backend = match TcpStream::connect((backend_host.as_str(), backend_port)).await {
        Ok(stream) => stream,
        Err(error) => {
            runtime.core.emit(
                Event::new(EventKind::SessionError, context.clone())
                    .with_attribute("reason", "backend_connect_failed")
                    .with_attribute("detail", error.to_string()),
            );
            send_status(&mut downstream, "502 Bad Gateway", "backend unreachable").await?;
            emit_session_closed(&runtime, context, started, "backend_connect_failed");
            return Ok(());
        }
    };

    downstream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;

    let issued = runtime
        .pool
        .server_config_for_host(&context.server_host)
        .map_err(io::Error::other)?;
    runtime.core.emit(
        Event::new(EventKind::TlsHandshakeStarted, context.clone())
            .with_attribute("leaf_cache", issued.cache_status.as_str()),
    );

    let acceptor = TlsAcceptor::from(Arc::clone(&issued.server_config));
    let tls_stream = match acceptor.accept(downstream).await {
        Ok(stream) => stream,
        Err(error) => {
            runtime.core.emit(
                Event::new(EventKind::TlsHandshakeFailed, context.clone())
                    .with_attribute("reason", classify_tls_error(&error.to_string()).code())
                    .with_attribute("detail", error.to_string()),
            );
            emit_session_closed(&runtime, context, started, "tls_handshake_failed");
            return Ok(());
        }
    };

    runtime.core.emit(
        Event::new(EventKind::TlsHandshakeSucceeded, context.clone())
            .with_attribute("leaf_serial", issued.serial_hex.clone()),
    );
    runtime.core.emit(
        Event::new(EventKind::TunnelEstablished, context.clone())
            .with_attribute("engine", runtime.engine.kind())
            .with_attribute("backend", format!("{backend_host}:{backend_port}")),
    );

    let (mut client_read, mut client_write) = tokio::io::split(tls_stream);
    let (backend_read, backend_write) = backend.into_split();
    let (pending_tx, pending_rx) = mpsc::channel::<PendingRequest>(runtime.config.pipeline_depth);
    let forwarded = AtomicU64::new(0);
    let returned = AtomicU64::new(0);

    let (requests, responses) = {
        let request_loop = relay_requests_upstream(
            runtime.clone(),
            context.clone(),
            &mut client_read,
            backend_write,
            pending_tx,
            &forwarded,
        );
        let response_loop = relay_responses_downstream(
            runtime.clone(),
            context.clone(),
            backend_read,
            &mut client_write,
            pending_rx,
            &returned,
        );
        tokio::pin!(request_loop, response_loop);

        tokio::select! {
            requests = &mut request_loop => {
                // Client side finished; drain the responses still in flight.
                let responses = (&mut response_loop).await;
                (requests, responses)
            }
            responses = &mut response_loop => {
                // A response-side close (or backend failure) ends the whole
                // tunnel; the request loop must not stay parked on a client
                // that is waiting for us to hang up.
                (Ok(()), responses)
            }
        }
    };

    // Send close_notify so the client sees a clean TLS end of stream.
    let mut tls_stream = client_read.unsplit(client_write);
    let _ = tls_stream.shutdown().await;

    let outcome = match (&requests, &responses) {
        (Ok(()), Ok(())) => "ok",
        _ => "relay_error",
    };
    if let Err(error) = &requests {
        runtime.core.emit(
            Event::new(EventKind::SessionError, context.clone())
                .with_attribute("reason", "request_relay_failed")
                .with_attribute("detail", error.to_string()),
        );
    }
    if let Err(error) = &responses {
        runtime.core.emit(
            Event::new(EventKind::SessionError, context.clone())
                .with_attribute("reason", "response_relay_failed")
                .with_attribute("detail", error.to_string()),
        );
    }

    runtime.core.emit(
        Event::new(EventKind::SessionClosed, context)
            .with_attribute("outcome", outcome)
            .with_attribute("requests", forwarded.load(Ordering::Relaxed).to_string())
            .with_attribute("responses", returned.load(Ordering::Relaxed).to_string())
            .with_attribute("duration_ms", started.elapsed().as_millis().to_string()),
    );
    Ok(())
}

/// Reads decrypted requests from the client side of the tunnel, rewrites each
/// to proxied absolute form, and forwards it to the backend. A clean EOF from
/// the client ends the loop without an error.
async fn relay_requests_upstream<S, R, W>(
    runtime: RuntimeHandles<S>,
    context: SessionContext,
    client_read: R,
    mut backend_write: W,
    pending_tx: mpsc::Sender<PendingRequest>,
    forwarded: &AtomicU64,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let max_head = runtime.config.max_http_head_bytes;
    let mut client = Http1Conn::new(client_read);

    loop {
        let Some(head) = client.next_head(max_head).await? else {
            break;
        };
        let request = parse_request_head(&head)?;
        let proxied_head = proxied_request_head(
            &request,
            &context.server_host,
            context.server_port,
            context.session_id,
        );

        backend_write.write_all(&proxied_head).await?;
        client
            .copy_body(&mut backend_write, request.framing, max_head)
            .await?;
        backend_write.flush().await?;
        forwarded.fetch_add(1, Ordering::Relaxed);

        runtime.core.emit(
            Event::new(EventKind::RequestForwarded, context.clone())
                .with_attribute("method", request.method.clone())
                .with_attribute("target", request.target.clone()),
        );

        let pending = PendingRequest {
            method: request.method,
            wants_close: request.wants_close,
        };
        if pending_tx.send(pending).await.is_err() {
            // Response loop is gone; nothing will answer further requests.
            break;
        }
        if request.wants_close {
            break;
        }
    }

    Ok(())
}

/// Streams backend responses to the client in the order requests were sent.
async fn relay_responses_downstream<S, R, W>(
    runtime: RuntimeHandles<S>,
    context: SessionContext,
    backend_read: R,
    mut client_write: W,
    mut pending_rx: mpsc::Receiver<PendingRequest>,
    returned: &AtomicU64,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let max_head = runtime.config.max_http_head_bytes;
    let mut backend = Http1Conn::new(backend_read);

    while let Some(pending) = pending_rx.recv().await {
        let head = backend.next_head(max_head).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed before answering a forwarded request",
            )
        })?;
        let response = parse_response_head(&head, &pending.method)?;

        client_write.write_all(&response.raw).await?;
        backend
            .copy_body(&mut client_write, response.framing, max_head)
            .await?;
        client_write.flush().await?;
        returned.fetch_add(1, Ordering::Relaxed);

        runtime.core.emit(
            Event::new(EventKind::ResponseReturned, context.clone())
                .with_attribute("status", response.status.to_string()),
        );

        if response.wants_close || pending.wants_close {
            break;
        }
    }

    Ok(())
}

/// Opaque CONNECT tunnel for hosts the policy does not claim: dial the
/// destination and splice bytes without touching TLS.
async fn tunnel_direct<S>(
    runtime: RuntimeHandles<S>,
    context: SessionContext,
    mut downstream: TcpStream,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let started = Instant::now();

    let mut upstream =
        match TcpStream::connect((context.server_host.as_str(), context.server_port)).await {
            Ok(stream) => stream,
            Err(error) => {
                runtime.core.emit(
                    Event::new(EventKind::SessionError, context.clone())
                        .with_attribute("reason", "upstream_connect_failed")
                        .with_attribute("detail", error.to_string()),
                );
                send_status(&mut downstream, "502 Bad Gateway", "upstream unreachable").await?;
                emit_session_closed(&runtime, context, started, "upstream_connect_failed");
                return Ok(());
            }
        };

    downstream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
    runtime.core.emit(
        Event::new(EventKind::TunnelEstablished, context.clone())
            .with_attribute("engine", "passthrough"),
    );

    match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
        Ok((from_client, from_server)) => {
            runtime.core.emit(
                Event::new(EventKind::SessionClosed, context)
                    .with_attribute("outcome", "ok")
                    .with_attribute("bytes_up", from_client.to_string())
                    .with_attribute("bytes_down", from_server.to_string())
                    .with_attribute("duration_ms", started.elapsed().as_millis().to_string()),
            );
            Ok(())
        }
        Err(error) => {
            runtime.core.emit(
                Event::new(EventKind::SessionError, context.clone())
                    .with_attribute("reason", "relay_error")
                    .with_attribute("detail", error.to_string()),
            );
            emit_session_closed(&runtime, context, started, "relay_error");
            Err(error)
        }
    }
}

fn proxied_request_head(
    request: &RequestHead,
    host: &str,
    port: u16,
    session_id: u64,
) -> Vec<u8> {
    let target = if request.target.starts_with("http://")
        || request.target.starts_with("https://")
    {
        request.target.clone()
    } else if port == 443 {
        format!("https://{host}{}", request.target)
    } else {
        format!("https://{host}:{port}{}", request.target)
    };

    let mut fields = request
        .fields
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case(SESSION_HEADER)
                && !name.eq_ignore_ascii_case("proxy-connection")
        })
        .cloned()
        .collect::<Vec<_>>();
    fields.push((SESSION_HEADER.to_string(), session_id.to_string()));

    encode_request_head(&request.method, &target, request.protocol, &fields)
}

fn emit_session_closed<S>(
    runtime: &RuntimeHandles<S>,
    context: SessionContext,
    started: Instant,
    outcome: &str,
) where
    S: EventSink + Send + Sync + 'static,
{
    runtime.core.emit(
        Event::new(EventKind::SessionClosed, context)
            .with_attribute("outcome", outcome)
            .with_attribute("duration_ms", started.elapsed().as_millis().to_string()),
    );
}
