use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_LEAF_VALIDITY: Duration = Duration::from_secs(398 * 24 * 60 * 60);
const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(48 * 60 * 60);
const ROOT_CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const LEAF_NOT_BEFORE_SKEW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate pool lock poisoned")]
    LockPoisoned,
    #[error("invalid root authority material: {0}")]
    InvalidRootAuthority(String),
    #[error("invalid certificate pool configuration: {0}")]
    InvalidConfiguration(String),
}

/// Coarse classification of TLS failure text, used to tag handshake failure
/// events with a stable reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailureReason {
    UnknownCa,
    CertValidation,
    HandshakeAlert,
    EofOrReset,
    Other,
}

impl TlsFailureReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownCa => "unknown_ca",
            Self::CertValidation => "cert_validation",
            Self::HandshakeAlert => "handshake",
            Self::EofOrReset => "eof_or_reset",
            Self::Other => "other",
        }
    }
}

pub fn classify_tls_error(error_text: &str) -> TlsFailureReason {
    let lower = error_text.to_ascii_lowercase();

    if contains_any(
        &lower,
        &["unknown ca", "unknown_ca", "unknown issuer", "unknown authority", "self signed", "self-signed"],
    ) {
        return TlsFailureReason::UnknownCa;
    }
    if contains_any(
        &lower,
        &["unexpected eof", "eof", "connection reset", "broken pipe", "connection aborted"],
    ) {
        return TlsFailureReason::EofOrReset;
    }
    if contains_any(
        &lower,
        &["certificate", "cert", "x509", "name mismatch", "expired", "not valid"],
    ) {
        return TlsFailureReason::CertValidation;
    }
    if contains_any(&lower, &["handshake", "alert", "protocol version", "decrypt error"]) {
        return TlsFailureReason::HandshakeAlert;
    }

    TlsFailureReason::Other
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Where the root certificate and its private key live on disk.
///
/// When neither file exists yet a fresh root authority is generated and
/// persisted to these paths; when both exist they are loaded as-is. A lone
/// cert or key file is a configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootAuthorityConfig {
    pub ca_cert_pem_path: PathBuf,
    pub ca_key_pem_path: PathBuf,
    pub ca_common_name: String,
    pub ca_organization: String,
}

impl RootAuthorityConfig {
    pub fn new(ca_cert_pem_path: impl Into<PathBuf>, ca_key_pem_path: impl Into<PathBuf>) -> Self {
        Self {
            ca_cert_pem_path: ca_cert_pem_path.into(),
            ca_key_pem_path: ca_key_pem_path.into(),
            ca_common_name: "midway Local Root".to_string(),
            ca_organization: "midway".to_string(),
        }
    }

    fn validate(&self) -> Result<(), TlsError> {
        if self.ca_cert_pem_path.as_os_str().is_empty() || self.ca_key_pem_path.as_os_str().is_empty()
        {
            return Err(TlsError::InvalidConfiguration(
                "root authority cert and key paths must not be empty".to_string(),
            ));
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "ca_common_name must not be empty".to_string(),
            ));
        }
        if self.ca_organization.trim().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "ca_organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePoolConfig {
    pub root: RootAuthorityConfig,
    /// Directory holding one persisted leaf (cert, key, meta) per host.
    pub cert_dir: PathBuf,
    pub leaf_validity: Duration,
    /// Leaves closer than this to expiry are discarded and re-issued.
    pub expiry_margin: Duration,
}

impl CertificatePoolConfig {
    pub fn new(root: RootAuthorityConfig, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            root,
            cert_dir: cert_dir.into(),
            leaf_validity: DEFAULT_LEAF_VALIDITY,
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
        }
    }

    fn validate(&self) -> Result<(), TlsError> {
        self.root.validate()?;
        if self.cert_dir.as_os_str().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "cert_dir must not be empty".to_string(),
            ));
        }
        if self.leaf_validity.is_zero() {
            return Err(TlsError::InvalidConfiguration(
                "leaf_validity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
    Disk,
}

impl LeafCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Disk => "disk",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
    pub leaf_cert_der: CertificateDer<'static>,
    pub serial_hex: String,
    pub not_after: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reloads: u64,
    pub leaves_issued: u64,
    pub expired_discarded: u64,
}

/// Issues, caches, and persists per-host leaf certificates signed by the
/// root authority loaded at construction time.
pub struct CertificatePool {
    config: CertificatePoolConfig,
    ca: CaMaterial,
    state: Mutex<PoolState>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    disk_reloads: AtomicU64,
    leaves_issued: AtomicU64,
    expired_discarded: AtomicU64,
}

impl std::fmt::Debug for CertificatePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificatePool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct PoolState {
    leaves: HashMap<String, CachedLeaf>,
}

struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
    serial_hex: String,
    not_after: SystemTime,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
    not_after: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeafMetaRecord {
    host: String,
    serial_hex: String,
    not_after_unix: u64,
    generated_at_unix: u64,
}

/// Client config trusting the public web PKI, for upstream connections made
/// on the client's behalf (direct dials, relay endpoints).
pub fn build_public_client_config() -> Arc<ClientConfig> {
    let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Client config trusting exactly one root certificate. Used by clients that
/// have installed this proxy's root authority.
pub fn build_client_config_with_root(
    ca_cert_der: &CertificateDer<'static>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let mut root_store = RootCertStore::empty();
    root_store
        .add(ca_cert_der.clone())
        .map_err(TlsError::ConfigBuild)?;
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

include!("certificate_pool_impl.rs");

#[cfg(test)]
mod tests_pool_basics {
    include!("tests_pool_basics.rs");
}

#[cfg(test)]
mod tests_pool_persistence {
    include!("tests_pool_persistence.rs");
}
