use midway_core::{EndpointConfig, EngineConfig, ProxyConfig};
use midway_observe::NoopEventSink;
use midway_proxy::ProxyServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct RunningProxy {
    smart_port: u16,
    plain_port: u16,
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
        plain_port: plain.local_addr().expect("plain addr").port(),
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

fn header_value(head: &str, name: &str) -> Option<String> {
    let prefix = format!("{}:", name.to_ascii_lowercase());
    head.lines()
        .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
        .map(|line| line[prefix.len()..].trim().to_string())
}

/// One-connection HTTP origin: serves the scripted responses in order and
/// reports every request head it saw.
fn spawn_origin(
    responses: Vec<Vec<u8>>,
    heads_tx: tokio::sync::mpsc::UnboundedSender<String>,
) -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind origin");
    listener.set_nonblocking(true).expect("nonblocking");
    let port = listener.local_addr().expect("origin addr").port();
    let listener = TcpListener::from_std(listener).expect("tokio listener");

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        for response in responses {
            let head = read_head(&mut stream).await;
            let head_text = String::from_utf8_lossy(&head).to_string();
            if let Some(length) = header_value(&head_text, "content-length") {
                let length: usize = length.parse().expect("content length");
                let mut body = vec![0_u8; length];
                stream.read_exact(&mut body).await.expect("request body");
            }
            let _ = heads_tx.send(head_text);
            stream.write_all(&response).await.expect("write response");
            stream.flush().await.expect("flush response");
        }
    });
    port
}

#[tokio::test]
async fn direct_engine_reissues_the_request_in_origin_form() {
    let (heads_tx, mut heads_rx) = tokio::sync::mpsc::unbounded_channel();
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok".to_vec();
    let origin_port = spawn_origin(vec![response.clone()], heads_tx);

    let proxy = start_proxy(EngineConfig::Direct, &[]).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy.plain_port))
        .await
        .expect("connect proxy");
    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{origin_port}/x HTTP/1.1\r\n\
                 Host: 127.0.0.1:{origin_port}\r\n\
                 X-Midway-Session: 999\r\n\
                 Proxy-Connection: keep-alive\r\n\
                 Connection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .expect("send request");

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.expect("read response");
    assert_eq!(received, response);

    let seen = heads_rx.recv().await.expect("origin saw the request");
    assert!(seen.starts_with("GET /x HTTP/1.1\r\n"), "{seen}");
    assert!(seen.contains(&format!("Host: 127.0.0.1:{origin_port}\r\n")), "{seen}");
    // Client-supplied proxy bookkeeping never reaches the origin.
    assert!(!seen.contains("999"), "{seen}");
    assert!(!seen.to_ascii_lowercase().contains("proxy-connection"), "{seen}");
}

#[tokio::test]
async fn direct_engine_reuses_one_origin_connection_for_sequential_requests() {
    let (heads_tx, mut heads_rx) = tokio::sync::mpsc::unbounded_channel();
    let first = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none".to_vec();
    let second = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\ntwo".to_vec();
    // A single accepted connection serves both requests.
    let origin_port = spawn_origin(vec![first, second], heads_tx);

    let proxy = start_proxy(EngineConfig::Direct, &[]).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy.plain_port))
        .await
        .expect("connect proxy");
    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{origin_port}/one HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .expect("send first");

    let head = read_head(&mut client).await;
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 200"));
    let mut body = [0_u8; 3];
    client.read_exact(&mut body).await.expect("first body");
    assert_eq!(&body, b"one");

    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{origin_port}/two HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .expect("send second");

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.expect("second response");
    assert!(String::from_utf8_lossy(&rest).ends_with("two"));

    let head_one = heads_rx.recv().await.expect("first head");
    let head_two = heads_rx.recv().await.expect("second head");
    assert!(head_one.starts_with("GET /one "), "{head_one}");
    assert!(head_two.starts_with("GET /two "), "{head_two}");
}

#[tokio::test]
async fn remote_engine_forwards_absolute_form_with_a_session_header() {
    let (heads_tx, mut heads_rx) = tokio::sync::mpsc::unbounded_channel();
    let response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\nvia-endpoint".to_vec();
    let endpoint_port = spawn_origin(vec![response.clone()], heads_tx);

    let proxy = start_proxy(
        EngineConfig::Remote {
            endpoint: EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: endpoint_port,
            },
        },
        &[],
    )
    .await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy.plain_port))
        .await
        .expect("connect proxy");
    client
        .write_all(
            b"GET http://www.example.net/page HTTP/1.1\r\nHost: www.example.net\r\nConnection: close\r\n\r\n",
        )
        .await
        .expect("send request");

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.expect("read response");
    assert_eq!(received, response);

    let seen = heads_rx.recv().await.expect("endpoint saw the request");
    assert!(
        seen.starts_with("GET http://www.example.net/page HTTP/1.1\r\n"),
        "{seen}"
    );
    assert!(seen.contains("X-Midway-Session: "), "{seen}");
}

#[tokio::test]
async fn relay_engine_wraps_the_request_and_unwraps_the_envelope() {
    let (heads_tx, mut heads_rx) = tokio::sync::mpsc::unbounded_channel();
    let inner =
        b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nwrapped".to_vec();
    let mut envelope = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        inner.len()
    )
    .into_bytes();
    envelope.extend_from_slice(&inner);
    let relay_port = spawn_origin(vec![envelope], heads_tx);

    let proxy = start_proxy(
        EngineConfig::Relay {
            relay_url: format!("http://127.0.0.1:{relay_port}/relay"),
        },
        &[],
    )
    .await;

    let client_request =
        b"GET https://www.example.org/ HTTP/1.1\r\nHost: www.example.org\r\nConnection: close\r\n\r\n";
    let mut client = TcpStream::connect(("127.0.0.1", proxy.plain_port))
        .await
        .expect("connect proxy");
    client.write_all(client_request).await.expect("send request");

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.expect("read response");
    assert_eq!(received, inner, "client gets the envelope payload verbatim");

    let seen = heads_rx.recv().await.expect("relay saw the envelope");
    assert!(seen.starts_with("POST /relay HTTP/1.1\r\n"), "{seen}");
    assert_eq!(
        header_value(&seen, "content-type").as_deref(),
        Some("application/data"),
        "{seen}"
    );
    assert_eq!(
        header_value(&seen, "content-length").as_deref(),
        Some(client_request.len().to_string().as_str()),
        "{seen}"
    );
    assert_eq!(header_value(&seen, "host").as_deref(), Some(&*format!("127.0.0.1:{relay_port}")));
}

#[tokio::test]
async fn smart_listener_sends_only_routed_hosts_through_the_engine() {
    let (endpoint_tx, mut endpoint_rx) = tokio::sync::mpsc::unbounded_channel();
    let endpoint_response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\nvia-endpoint".to_vec();
    let endpoint_port = spawn_origin(vec![endpoint_response.clone()], endpoint_tx);

    let (origin_tx, mut origin_rx) = tokio::sync::mpsc::unbounded_channel();
    let origin_response =
        b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\nvia-origin".to_vec();
    let origin_port = spawn_origin(vec![origin_response.clone()], origin_tx);

    let proxy = start_proxy(
        EngineConfig::Remote {
            endpoint: EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: endpoint_port,
            },
        },
        &["example.com"],
    )
    .await;

    // Routed suffix: the engine endpoint answers, the host is never dialed.
    let mut client = TcpStream::connect(("127.0.0.1", proxy.smart_port))
        .await
        .expect("connect proxy");
    client
        .write_all(
            b"GET http://blocked.example.com/ HTTP/1.1\r\nHost: blocked.example.com\r\nConnection: close\r\n\r\n",
        )
        .await
        .expect("send routed request");
    let mut received = Vec::new();
    client.read_to_end(&mut received).await.expect("routed response");
    assert_eq!(received, endpoint_response);
    let seen = endpoint_rx.recv().await.expect("endpoint request");
    assert!(seen.starts_with("GET http://blocked.example.com/ "), "{seen}");

    // Unrouted host: fetched directly from the origin.
    let mut client = TcpStream::connect(("127.0.0.1", proxy.smart_port))
        .await
        .expect("connect proxy");
    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{origin_port}/ HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .expect("send unrouted request");
    let mut received = Vec::new();
    client.read_to_end(&mut received).await.expect("unrouted response");
    assert_eq!(received, origin_response);
    let seen = origin_rx.recv().await.expect("origin request");
    assert!(seen.starts_with("GET / "), "{seen}");
}

#[tokio::test]
async fn malformed_plain_requests_get_a_400() {
    let proxy = start_proxy(EngineConfig::Direct, &[]).await;

    let mut client = TcpStream::connect(("127.0.0.1", proxy.plain_port))
        .await
        .expect("connect proxy");
    client
        .write_all(b"NOT-HTTP\r\n\r\n")
        .await
        .expect("send garbage");

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.expect("read response");
    assert!(
        String::from_utf8_lossy(&received).starts_with("HTTP/1.1 400"),
        "{}",
        String::from_utf8_lossy(&received)
    );
}
