use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
        }
    }
}

/// Which upstream engine the smart listener hands matched traffic to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    /// Dial the destination ourselves.
    Direct,
    /// Forward proxied requests to a remote tunnel endpoint as-is.
    Remote { endpoint: EndpointConfig },
    /// Wrap proxied requests in an HTTP POST to a relay URL.
    Relay { relay_url: String },
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::Direct
    }
}

impl EngineConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Remote { .. } => "remote",
            Self::Relay { .. } => "relay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen_addr: String,
    /// Port of the smart listener that consults the domain suffix policy.
    pub smart_listen_port: u16,
    /// Port of the plain listener that always applies the configured engine.
    pub plain_listen_port: u16,
    pub engine: EngineConfig,
    pub cert_dir: String,
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub leaf_validity_seconds: u64,
    pub expiry_margin_seconds: u64,
    /// Domain suffix list, one suffix per line, `#` comments. Reloaded on
    /// SIGHUP. Absent means the smart listener matches nothing.
    pub suffix_file: Option<String>,
    pub max_http_head_bytes: usize,
    /// In-flight request cap per tunnel before the upstream loop blocks.
    pub pipeline_depth: usize,
    pub event_log_path: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            smart_listen_port: 18087,
            plain_listen_port: 18086,
            engine: EngineConfig::Direct,
            cert_dir: "certs".to_string(),
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "midway Local Root".to_string(),
            ca_organization: "midway".to_string(),
            leaf_validity_seconds: 398 * 24 * 60 * 60,
            expiry_margin_seconds: 48 * 60 * 60,
            suffix_file: None,
            max_http_head_bytes: 64 * 1024,
            pipeline_depth: 8,
            event_log_path: None,
        }
    }
}

impl ProxyConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyValue("listen_addr"));
        }
        if self.smart_listen_port == 0 {
            return Err(ConfigError::ZeroValue("smart_listen_port"));
        }
        if self.plain_listen_port == 0 {
            return Err(ConfigError::ZeroValue("plain_listen_port"));
        }
        if self.smart_listen_port == self.plain_listen_port {
            return Err(ConfigError::ListenerPortCollision(self.smart_listen_port));
        }
        if self.cert_dir.trim().is_empty() {
            return Err(ConfigError::EmptyValue("cert_dir"));
        }
        if self.ca_cert_pem_path.is_some() != self.ca_key_pem_path.is_some() {
            return Err(ConfigError::InvalidCaPathPair);
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(ConfigError::EmptyValue("ca_common_name"));
        }
        if self.ca_organization.trim().is_empty() {
            return Err(ConfigError::EmptyValue("ca_organization"));
        }
        if self.leaf_validity_seconds == 0 {
            return Err(ConfigError::ZeroValue("leaf_validity_seconds"));
        }
        if self.expiry_margin_seconds >= self.leaf_validity_seconds {
            return Err(ConfigError::ExpiryMarginTooLarge);
        }
        if let Some(path) = &self.suffix_file {
            if path.trim().is_empty() {
                return Err(ConfigError::EmptyValue("suffix_file"));
            }
        }
        if self.max_http_head_bytes == 0 {
            return Err(ConfigError::ZeroValue("max_http_head_bytes"));
        }
        if self.pipeline_depth == 0 {
            return Err(ConfigError::ZeroValue("pipeline_depth"));
        }
        match &self.engine {
            EngineConfig::Direct => {}
            EngineConfig::Remote { endpoint } => {
                if endpoint.host.trim().is_empty() {
                    return Err(ConfigError::EmptyValue("engine.endpoint.host"));
                }
                if endpoint.port == 0 {
                    return Err(ConfigError::ZeroValue("engine.endpoint.port"));
                }
            }
            EngineConfig::Relay { relay_url } => {
                if !relay_url.starts_with("http://") && !relay_url.starts_with("https://") {
                    return Err(ConfigError::InvalidRelayUrl(relay_url.clone()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must not be empty")]
    EmptyValue(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("smart and plain listeners both bind port {0}")]
    ListenerPortCollision(u16),
    #[error("ca_cert_pem_path and ca_key_pem_path must be provided together")]
    InvalidCaPathPair,
    #[error("expiry_margin_seconds must be smaller than leaf_validity_seconds")]
    ExpiryMarginTooLarge,
    #[error("engine.relay_url must be an http(s) URL, got {0}")]
    InvalidRelayUrl(String),
}
