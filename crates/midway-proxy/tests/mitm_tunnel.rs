use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use midway_core::{EndpointConfig, EngineConfig, ProxyConfig};
use midway_observe::NoopEventSink;
use midway_proxy::ProxyServer;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

struct RunningProxy {
    smart_port: u16,
    ca_der: CertificateDer<'static>,
    _cert_dir: tempfile::TempDir,
}

async fn start_proxy(engine: EngineConfig, routed_suffixes: &[&str]) -> RunningProxy {
    let smart = TcpListener::bind("127.0.0.1:0").await.expect("bind smart");
    let plain = TcpListener::bind("127.0.0.1:0").await.expect("bind plain");
    let cert_dir = tempfile::tempdir().expect("cert dir");

    let config = ProxyConfig {
        listen_addr: "127.0.0.1".to_string(),
        smart_listen_port: smart.local_addr().expect("smart addr").port(),
        plain_listen_port: plain.local_addr().expect("plain addr").port(),
        engine,
        cert_dir: cert_dir.path().to_str().expect("utf8 path").to_string(),
        ..ProxyConfig::default()
    };
    let server = ProxyServer::new(config, NoopEventSink).expect("proxy server");
    server.core().router().reload(routed_suffixes.to_vec());

    let running = RunningProxy {
        smart_port: smart.local_addr().expect("smart addr").port(),
        ca_der: server.ca_certificate_der().clone(),
        _cert_dir: cert_dir,
    };
    tokio::spawn(async move {
        let _ = server.run_with_listeners(smart, plain).await;
    });
    running
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await.expect("read head byte");
        assert_ne!(read, 0, "connection closed before head completed");
        head.push(byte[0]);
    }
    head
}

/// Backend that speaks the proxied-HTTP dialect a tunnel endpoint uses:
/// reads absolute-form requests off one connection and answers from the
/// supplied script, in order.
fn spawn_tunnel_endpoint(
    responses: Vec<Vec<u8>>,
    heads_tx: tokio::sync::mpsc::UnboundedSender<String>,
    connections: Arc<AtomicUsize>,
) -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind endpoint");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().expect("endpoint addr");
    let listener = TcpListener::from_std(listener).expect("tokio listener");

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        connections.fetch_add(1, Ordering::SeqCst);

        // Read every request head first so pipelined requests queue up, then
        // answer them in arrival order.
        for _ in 0..responses.len() {
            let head = read_head(&mut stream).await;
            let _ = heads_tx.send(String::from_utf8_lossy(&head).to_string());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for response in responses {
            stream.write_all(&response).await.expect("write response");
        }
        stream.flush().await.expect("flush responses");
    });
    addr
}

async fn open_tunnel(
    proxy: &RunningProxy,
    host: &str,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy.smart_port))
        .await
        .expect("connect proxy");
    stream
        .write_all(format!("CONNECT {host}:443 HTTP/1.1\r\nHost: {host}:443\r\n\r\n").as_bytes())
        .await
        .expect("send connect");

    let head = read_head(&mut stream).await;
    let head_text = String::from_utf8_lossy(&head);
    assert!(head_text.starts_with("HTTP/1.1 200"), "{head_text}");

    let client_config =
        midway_tls::build_client_config_with_root(&proxy.ca_der).expect("client config");
    let connector = TlsConnector::from(client_config);
    let server_name = ServerName::try_from(host.to_string()).expect("server name");
    connector
        .connect(server_name, stream)
        .await
        .expect("client TLS handshake against minted leaf")
}

#[tokio::test]
async fn connect_tunnel_rewrites_requests_and_relays_responses_verbatim() {
    let (heads_tx, mut heads_rx) = tokio::sync::mpsc::unbounded_channel();
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".to_vec();
    let endpoint = spawn_tunnel_endpoint(
        vec![response.clone()],
        heads_tx,
        Arc::new(AtomicUsize::new(0)),
    );

    let proxy = start_proxy(
        EngineConfig::Remote {
            endpoint: EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: endpoint.port(),
            },
        },
        &["example.com"],
    )
    .await;

    let mut tls = open_tunnel(&proxy, "secure.example.com").await;
    tls.write_all(
        b"GET / HTTP/1.1\r\nHost: secure.example.com\r\nConnection: close\r\n\r\n",
    )
    .await
    .expect("send request");

    let mut received = Vec::new();
    tls.read_to_end(&mut received).await.expect("read response");
    assert_eq!(received, response, "response must be relayed untouched");

    let forwarded = heads_rx.recv().await.expect("backend saw the request");
    assert!(
        forwarded.starts_with("GET https://secure.example.com/ HTTP/1.1\r\n"),
        "{forwarded}"
    );
    assert!(forwarded.contains("X-Midway-Session: "), "{forwarded}");
    assert!(forwarded.contains("Host: secure.example.com\r\n"), "{forwarded}");
}

#[tokio::test]
async fn pipelined_requests_come_back_in_order() {
    let (heads_tx, mut heads_rx) = tokio::sync::mpsc::unbounded_channel();
    let first = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nfirst\n".to_vec();
    let second =
        b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nsecond\n".to_vec();
    let endpoint = spawn_tunnel_endpoint(
        vec![first.clone(), second.clone()],
        heads_tx,
        Arc::new(AtomicUsize::new(0)),
    );

    let proxy = start_proxy(
        EngineConfig::Remote {
            endpoint: EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: endpoint.port(),
            },
        },
        &["example.com"],
    )
    .await;

    let mut tls = open_tunnel(&proxy, "pipelined.example.com").await;
    // Both requests leave before any response arrives.
    tls.write_all(
        b"GET /r1 HTTP/1.1\r\nHost: pipelined.example.com\r\n\r\n\
          GET /r2 HTTP/1.1\r\nHost: pipelined.example.com\r\nConnection: close\r\n\r\n",
    )
    .await
    .expect("send pipelined requests");

    let mut received = Vec::new();
    tls.read_to_end(&mut received).await.expect("read responses");
    let mut expected = first;
    expected.extend_from_slice(&second);
    assert_eq!(received, expected, "responses must preserve request order");

    let head_one = heads_rx.recv().await.expect("first head");
    let head_two = heads_rx.recv().await.expect("second head");
    assert!(head_one.starts_with("GET https://pipelined.example.com/r1 "), "{head_one}");
    assert!(head_two.starts_with("GET https://pipelined.example.com/r2 "), "{head_two}");
}

#[tokio::test]
async fn response_only_close_tears_the_tunnel_down() {
    let (heads_tx, _heads_rx) = tokio::sync::mpsc::unbounded_channel();
    let response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndone".to_vec();
    let endpoint = spawn_tunnel_endpoint(
        vec![response.clone()],
        heads_tx,
        Arc::new(AtomicUsize::new(0)),
    );

    let proxy = start_proxy(
        EngineConfig::Remote {
            endpoint: EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: endpoint.port(),
            },
        },
        &["example.com"],
    )
    .await;

    let mut tls = open_tunnel(&proxy, "closing.example.com").await;
    // The request keeps the connection open; only the response closes it.
    tls.write_all(b"GET / HTTP/1.1\r\nHost: closing.example.com\r\n\r\n")
        .await
        .expect("send request");

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), tls.read_to_end(&mut received))
        .await
        .expect("tunnel must close promptly after a closing response")
        .expect("read response");
    assert_eq!(received, response);
}

#[tokio::test]
async fn non_tls_connect_port_is_rejected_before_dialing_the_backend() {
    let (heads_tx, _heads_rx) = tokio::sync::mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let endpoint = spawn_tunnel_endpoint(Vec::new(), heads_tx, Arc::clone(&connections));

    let proxy = start_proxy(
        EngineConfig::Remote {
            endpoint: EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: endpoint.port(),
            },
        },
        &["example.com"],
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.smart_port))
        .await
        .expect("connect proxy");
    stream
        .write_all(b"CONNECT www.example.com:80 HTTP/1.1\r\nHost: www.example.com:80\r\n\r\n")
        .await
        .expect("send connect");

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("read rejection");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 400"), "{text}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        connections.load(Ordering::SeqCst),
        0,
        "backend must never be dialed for a rejected port"
    );
}

#[tokio::test]
async fn unmatched_connect_hosts_get_an_opaque_passthrough_tunnel() {
    // Echo server standing in for an arbitrary non-HTTP destination.
    let echo = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let echo_port = echo.local_addr().expect("echo addr").port();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = echo.accept().await else {
            return;
        };
        let mut buffer = [0_u8; 64];
        let read = stream.read(&mut buffer).await.expect("echo read");
        stream.write_all(&buffer[..read]).await.expect("echo write");
    });

    let proxy = start_proxy(EngineConfig::Direct, &["example.com"]).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.smart_port))
        .await
        .expect("connect proxy");
    stream
        .write_all(
            format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\nHost: 127.0.0.1:{echo_port}\r\n\r\n")
                .as_bytes(),
        )
        .await
        .expect("send connect");

    let head = read_head(&mut stream).await;
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 200"));

    stream.write_all(b"opaque-bytes").await.expect("send payload");
    let mut reply = [0_u8; 12];
    stream.read_exact(&mut reply).await.expect("read echo");
    assert_eq!(&reply, b"opaque-bytes");
}

#[tokio::test]
async fn unreachable_backend_answers_the_connect_with_502() {
    let proxy = start_proxy(
        EngineConfig::Remote {
            endpoint: EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
            },
        },
        &["example.com"],
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.smart_port))
        .await
        .expect("connect proxy");
    stream
        .write_all(b"CONNECT a.example.com:443 HTTP/1.1\r\nHost: a.example.com:443\r\n\r\n")
        .await
        .expect("send connect");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read");
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502"),
        "{}", String::from_utf8_lossy(&response));
}
