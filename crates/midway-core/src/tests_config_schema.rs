#[test]
fn default_config_is_valid() {
    let config = super::ProxyConfig::default();
    assert!(config.validate().is_ok());
}

#[test]
fn config_round_trips_through_json() {
    let config = super::ProxyConfig {
        engine: super::EngineConfig::Remote {
            endpoint: super::EndpointConfig {
                host: "tunnel.example.net".to_string(),
                port: 443,
            },
        },
        suffix_file: Some("domains.txt".to_string()),
        ..super::ProxyConfig::default()
    };
    let json = serde_json::to_string(&config).expect("serialize config");
    let parsed = super::ProxyConfig::from_json_str(&json).expect("parse config");
    assert_eq!(parsed, config);
}

#[test]
fn engine_config_uses_tagged_kind() {
    let parsed = super::ProxyConfig::from_json_str(
        r#"{"engine": {"kind": "relay", "relay_url": "https://relay.example.com/midway"}}"#,
    )
    .expect("relay engine parses");
    assert_eq!(parsed.engine.kind(), "relay");

    let parsed = super::ProxyConfig::from_json_str(r#"{"engine": {"kind": "direct"}}"#)
        .expect("direct engine parses");
    assert_eq!(parsed.engine, super::EngineConfig::Direct);
}

#[test]
fn unknown_fields_are_rejected() {
    let error = super::ProxyConfig::from_json_str(r#"{"listen_address": "0.0.0.0"}"#)
        .expect_err("typo'd field must fail");
    assert!(matches!(error, super::ConfigError::Parse(_)));
}

#[test]
fn listener_port_collision_is_rejected() {
    let config = super::ProxyConfig {
        smart_listen_port: 9000,
        plain_listen_port: 9000,
        ..super::ProxyConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(super::ConfigError::ListenerPortCollision(9000))
    ));
}

#[test]
fn ca_paths_must_be_provided_together() {
    let config = super::ProxyConfig {
        ca_cert_pem_path: Some("root.pem".to_string()),
        ..super::ProxyConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(super::ConfigError::InvalidCaPathPair)
    ));
}

#[test]
fn relay_url_must_be_http() {
    let config = super::ProxyConfig {
        engine: super::EngineConfig::Relay {
            relay_url: "ftp://relay.example.com".to_string(),
        },
        ..super::ProxyConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(super::ConfigError::InvalidRelayUrl(_))
    ));
}

#[test]
fn remote_engine_requires_endpoint() {
    let config = super::ProxyConfig {
        engine: super::EngineConfig::Remote {
            endpoint: super::EndpointConfig::default(),
        },
        ..super::ProxyConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(super::ConfigError::EmptyValue("engine.endpoint.host"))
    ));
}

#[test]
fn expiry_margin_must_fit_inside_validity() {
    let config = super::ProxyConfig {
        leaf_validity_seconds: 60,
        expiry_margin_seconds: 60,
        ..super::ProxyConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(super::ConfigError::ExpiryMarginTooLarge)
    ));
}

#[test]
fn config_loads_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("midway.json");
    std::fs::write(&path, r#"{"smart_listen_port": 28087, "plain_listen_port": 28086}"#)
        .expect("write config");

    let config = super::ProxyConfig::load_from_path(&path).expect("load config");
    assert_eq!(config.smart_listen_port, 28087);
    assert_eq!(config.plain_listen_port, 28086);
    assert_eq!(config.engine, super::EngineConfig::Direct);
}

#[test]
fn missing_config_file_is_an_io_error() {
    let error = super::ProxyConfig::load_from_path("/nonexistent/midway.json")
        .expect_err("missing file");
    assert!(matches!(error, super::ConfigError::Io(_)));
}
