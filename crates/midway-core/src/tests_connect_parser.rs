use super::{
    parse_connect_request_head, parse_connect_request_line, ConnectParseError, ConnectRequest,
};

#[test]
fn parses_canonical_connect_line() {
    let parsed = parse_connect_request_line("CONNECT www.google.com:443 HTTP/1.1")
        .expect("canonical line parses");
    assert_eq!(
        parsed,
        ConnectRequest {
            server_host: "www.google.com".to_string(),
            server_port: 443,
        }
    );
}

#[test]
fn parses_bracketed_ipv6_authority() {
    let parsed =
        parse_connect_request_line("CONNECT [2001:db8::1]:443 HTTP/1.1").expect("ipv6 parses");
    assert_eq!(parsed.server_host, "2001:db8::1");
    assert_eq!(parsed.server_port, 443);
}

#[test]
fn rejects_unbracketed_ipv6_authority() {
    let error = parse_connect_request_line("CONNECT 2001:db8::1:443 HTTP/1.1")
        .expect_err("ambiguous port boundary");
    assert_eq!(error, ConnectParseError::InvalidAuthority);
}

#[test]
fn rejects_missing_port() {
    let error =
        parse_connect_request_line("CONNECT www.google.com HTTP/1.1").expect_err("no port");
    assert_eq!(error, ConnectParseError::MissingPort);
}

#[test]
fn rejects_port_zero_and_garbage_ports() {
    assert_eq!(
        parse_connect_request_line("CONNECT host:0 HTTP/1.1").expect_err("port zero"),
        ConnectParseError::InvalidPort
    );
    assert_eq!(
        parse_connect_request_line("CONNECT host:https HTTP/1.1").expect_err("named port"),
        ConnectParseError::InvalidPort
    );
    assert_eq!(
        parse_connect_request_line("CONNECT host:70000 HTTP/1.1").expect_err("overflow"),
        ConnectParseError::InvalidPort
    );
}

#[test]
fn rejects_non_connect_methods() {
    assert_eq!(
        parse_connect_request_line("GET http://host/ HTTP/1.1").expect_err("wrong method"),
        ConnectParseError::MethodNotConnect
    );
    assert_eq!(
        parse_connect_request_line("connect host:443 HTTP/1.1").expect_err("lowercase method"),
        ConnectParseError::MethodNotConnect
    );
}

#[test]
fn rejects_malformed_request_lines() {
    assert_eq!(
        parse_connect_request_line("").expect_err("empty"),
        ConnectParseError::EmptyRequestLine
    );
    assert_eq!(
        parse_connect_request_line("CONNECT host:443").expect_err("missing version"),
        ConnectParseError::InvalidRequestLine
    );
    assert_eq!(
        parse_connect_request_line("CONNECT host:443 HTTP/1.1 extra").expect_err("extra token"),
        ConnectParseError::InvalidRequestLine
    );
    assert_eq!(
        parse_connect_request_line("CONNECT host:443 SPDY/3").expect_err("bad version"),
        ConnectParseError::InvalidHttpVersion
    );
}

#[test]
fn head_parser_reports_consumed_bytes() {
    let head = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nleftover";
    let (parsed, consumed) = parse_connect_request_head(head).expect("head parses");
    assert_eq!(parsed.server_host, "example.com");
    assert_eq!(&head[consumed..], b"leftover");
}

#[test]
fn head_parser_waits_for_header_terminator() {
    let error = parse_connect_request_head(b"CONNECT example.com:443 HTTP/1.1\r\nHost: e")
        .expect_err("incomplete head");
    assert_eq!(error, ConnectParseError::IncompleteHeaders);
}

#[test]
fn head_parser_rejects_non_utf8_head() {
    let error = parse_connect_request_head(b"CONNECT \xff\xfe:443 HTTP/1.1\r\n\r\n")
        .expect_err("invalid utf8");
    assert_eq!(error, ConnectParseError::InvalidUtf8);
}
