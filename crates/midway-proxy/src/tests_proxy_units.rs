use super::*;

#[test]
fn parses_request_head_with_content_length_body() {
    let raw = b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 11\r\n\r\n";
    let request = parse_request_head(raw).expect("request parses");
    assert_eq!(request.method, "POST");
    assert_eq!(request.target, "/submit");
    assert_eq!(request.protocol, Protocol::H11);
    assert_eq!(request.framing, BodyFraming::Sized(11));
    assert!(!request.wants_close);
}

#[test]
fn chunked_and_content_length_together_are_rejected() {
    let raw =
        b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 4\r\n\r\n";
    assert!(parse_request_head(raw).is_err());
}

#[test]
fn response_without_length_is_close_delimited() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n";
    let response = parse_response_head(raw, "GET").expect("response parses");
    assert_eq!(response.framing, BodyFraming::UntilClose);
    assert!(response.wants_close);
}

#[test]
fn head_and_204_responses_have_no_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
    let response = parse_response_head(raw, "HEAD").expect("parses");
    assert_eq!(response.framing, BodyFraming::Empty);

    let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
    let response = parse_response_head(raw, "GET").expect("parses");
    assert_eq!(response.framing, BodyFraming::Empty);
}

#[test]
fn http10_without_keep_alive_closes() {
    let raw = b"GET / HTTP/1.0\r\nHost: a\r\n\r\n";
    let request = parse_request_head(raw).expect("parses");
    assert!(request.wants_close);

    let raw = b"GET / HTTP/1.0\r\nHost: a\r\nConnection: keep-alive\r\n\r\n";
    let request = parse_request_head(raw).expect("parses");
    assert!(!request.wants_close);
}

#[test]
fn chunk_size_lines_parse_with_extensions() {
    assert_eq!(chunk_size(b"1a\r\n").expect("hex"), 0x1a);
    assert_eq!(chunk_size(b"4;ext=1\r\n").expect("ext"), 4);
    assert!(chunk_size(b"zz\r\n").is_err());
}

#[test]
fn proxied_head_rewrites_origin_form_and_stamps_session() {
    let raw = b"GET /search?q=1 HTTP/1.1\r\nHost: www.google.com\r\nX-Midway-Session: 999\r\nProxy-Connection: keep-alive\r\n\r\n";
    let request = parse_request_head(raw).expect("parses");
    let head = proxied_request_head(&request, "www.google.com", 443, 7);
    let text = String::from_utf8(head).expect("utf8 head");

    assert!(text.starts_with("GET https://www.google.com/search?q=1 HTTP/1.1\r\n"));
    assert!(text.contains("X-Midway-Session: 7\r\n"));
    // The client-supplied session header and proxy bookkeeping are dropped.
    assert!(!text.contains("999"));
    assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
}

#[test]
fn proxied_head_keeps_nonstandard_port_in_target() {
    let raw = b"GET / HTTP/1.1\r\nHost: internal\r\n\r\n";
    let request = parse_request_head(raw).expect("parses");
    let head = proxied_request_head(&request, "internal", 8443, 1);
    let text = String::from_utf8(head).expect("utf8 head");
    assert!(text.starts_with("GET https://internal:8443/ HTTP/1.1\r\n"));
}

#[test]
fn relay_url_parsing_handles_defaults_and_paths() {
    let relay = parse_relay_url("https://relay.example.com/midway").expect("https relay");
    assert_eq!(
        relay,
        RelayTarget {
            tls: true,
            host: "relay.example.com".to_string(),
            port: 443,
            path: "/midway".to_string(),
        }
    );

    let relay = parse_relay_url("http://relay.example.com:8080").expect("http relay");
    assert_eq!(relay.port, 8080);
    assert_eq!(relay.path, "/");
    assert_eq!(relay.host_header(), "relay.example.com:8080");

    assert!(parse_relay_url("gopher://relay").is_err());
    assert!(parse_relay_url("http://").is_err());
}

#[test]
fn plain_targets_resolve_from_absolute_and_origin_forms() {
    let raw = b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let request = parse_request_head(raw).expect("parses");
    let target = resolve_plain_target(&request).expect("absolute http");
    assert_eq!(
        target,
        PlainTarget {
            host: "example.com".to_string(),
            port: 80,
            tls: false,
            origin_form: "/a".to_string(),
        }
    );
    assert_eq!(target.absolute_form(), "http://example.com/a");

    let raw = b"GET https://example.com:8443/b HTTP/1.1\r\n\r\n";
    let request = parse_request_head(raw).expect("parses");
    let target = resolve_plain_target(&request).expect("absolute https");
    assert!(target.tls);
    assert_eq!(target.port, 8443);
    assert_eq!(target.absolute_form(), "https://example.com:8443/b");

    let raw = b"GET /c HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
    let request = parse_request_head(raw).expect("parses");
    let target = resolve_plain_target(&request).expect("origin form");
    assert_eq!(target.port, 8080);
    assert!(!target.tls);

    let raw = b"GET /d HTTP/1.1\r\n\r\n";
    let request = parse_request_head(raw).expect("parses");
    assert!(resolve_plain_target(&request).is_err());
}

#[test]
fn ipv6_authorities_must_be_bracketed() {
    let (host, port) = split_authority("[::1]:8443", 80).expect("bracketed");
    assert_eq!(host, "::1");
    assert_eq!(port, 8443);

    let (host, port) = split_authority("[::1]", 80).expect("bracketed default port");
    assert_eq!(host, "::1");
    assert_eq!(port, 80);

    assert!(split_authority("::1:443", 80).is_err());
}

#[test]
fn tunnel_backend_depends_on_engine_kind() {
    let config = ProxyConfig::default();

    let direct = Engine::from_config(&EngineConfig::Direct).expect("direct engine");
    assert_eq!(
        direct.tunnel_backend(&config),
        (config.listen_addr.clone(), config.plain_listen_port)
    );

    let remote = Engine::from_config(&EngineConfig::Remote {
        endpoint: midway_core::EndpointConfig {
            host: "tunnel.example.net".to_string(),
            port: 9443,
        },
    })
    .expect("remote engine");
    assert_eq!(
        remote.tunnel_backend(&config),
        ("tunnel.example.net".to_string(), 9443)
    );
}

#[test]
fn suffix_files_skip_comments_and_blanks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("domains.txt");
    std::fs::write(&path, "# routed suffixes\ngoogle.com\n\n  twitter.com  \n#youtube.com\n")
        .expect("write suffix file");

    let suffixes = load_suffix_file(path.to_str().expect("utf8 path")).expect("load");
    assert_eq!(suffixes, vec!["google.com".to_string(), "twitter.com".to_string()]);
}

#[tokio::test]
async fn initial_head_read_stops_exactly_at_the_blank_line() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let payload = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01";
    client.write_all(payload).await.expect("write");

    let head = read_initial_head(&mut server, 1024).await.expect("head");
    assert_eq!(head, b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");

    // The TLS client hello bytes after the head are still unread.
    let mut rest = [0_u8; 3];
    server.read_exact(&mut rest).await.expect("rest");
    assert_eq!(&rest, b"\x16\x03\x01");
}

#[tokio::test]
async fn next_head_keeps_leftover_bytes_pending() {
    let (mut client, server) = tokio::io::duplex(1024);
    client
        .write_all(b"HTTP/1.1 200 OK\r\n\r\nbody-bytes")
        .await
        .expect("write");
    drop(client);

    let mut conn = Http1Conn::new(server);
    let head = conn.next_head(1024).await.expect("read").expect("head present");
    assert_eq!(head, b"HTTP/1.1 200 OK\r\n\r\n");
    assert_eq!(conn.pending, b"body-bytes");

    let trailing = conn.next_head(1024).await;
    assert!(trailing.is_err(), "partial tail must not vanish silently");
}

#[tokio::test]
async fn chunked_bodies_copy_byte_for_byte() {
    let (mut client, server) = tokio::io::duplex(1024);
    let body = b"4\r\nwiki\r\n6\r\npedia \r\n0\r\n\r\n";
    client.write_all(body).await.expect("write");
    drop(client);

    let mut source = Http1Conn::new(server);
    let mut copied = Vec::new();
    let total = source
        .copy_body(&mut copied, BodyFraming::Chunked, 1024)
        .await
        .expect("copy");
    assert_eq!(copied, body);
    assert_eq!(total, 10);
}

#[tokio::test]
async fn chunked_trailer_fields_are_forwarded() {
    let (mut client, server) = tokio::io::duplex(1024);
    let body = b"3\r\nabc\r\n0\r\nExpires: never\r\n\r\n";
    client.write_all(body).await.expect("write");
    drop(client);

    let mut source = Http1Conn::new(server);
    let mut copied = Vec::new();
    let total = source
        .copy_body(&mut copied, BodyFraming::Chunked, 1024)
        .await
        .expect("copy");
    assert_eq!(copied, body);
    assert_eq!(total, 3);
}

#[tokio::test]
async fn sized_body_copy_stops_at_the_declared_boundary() {
    let (mut client, server) = tokio::io::duplex(1024);
    client.write_all(b"hello worldEXTRA").await.expect("write");
    drop(client);

    let mut source = Http1Conn::new(server);
    let mut copied = Vec::new();
    let total = source
        .copy_body(&mut copied, BodyFraming::Sized(11), 1024)
        .await
        .expect("copy");
    assert_eq!(copied, b"hello world");
    assert_eq!(total, 11);

    // Bytes past the declared length stay on the wire for the next message.
    let mut rest = [0_u8; 5];
    source.io.read_exact(&mut rest).await.expect("rest");
    assert_eq!(&rest, b"EXTRA");
}
