use midway_core::{parse_connect_request_head, parse_connect_request_line, ConnectParseError};
use proptest::prelude::*;

fn host_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9](?:[a-z0-9.-]{0,30}[a-z0-9])?")
        .expect("valid hostname regex")
}

proptest! {
    #[test]
    fn parser_accepts_canonical_connect_lines(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let line = format!("CONNECT {host}:{port} HTTP/1.1");
        let parsed = parse_connect_request_line(&line)
            .expect("canonical CONNECT line must parse");
        prop_assert_eq!(parsed.server_host, host);
        prop_assert_eq!(parsed.server_port, port);
    }

    #[test]
    fn parser_rejects_lowercase_method(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let line = format!("connect {host}:{port} HTTP/1.1");
        let error = parse_connect_request_line(&line)
            .expect_err("lowercase method must be rejected");
        prop_assert_eq!(error, ConnectParseError::MethodNotConnect);
    }

    #[test]
    fn head_parser_consumes_exactly_the_head(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let head = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: proptest\r\n\r\n"
        );
        let (parsed, consumed) = parse_connect_request_head(head.as_bytes())
            .expect("buffered head must parse");
        prop_assert_eq!(parsed.server_host, host);
        prop_assert_eq!(parsed.server_port, port);
        prop_assert_eq!(consumed, head.len());
    }

    #[test]
    fn head_parser_never_panics_on_arbitrary_bytes(input in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = parse_connect_request_head(&input);
    }
}
