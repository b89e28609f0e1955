use super::*;

use std::thread;

use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

fn pool_in(dir: &Path) -> CertificatePool {
    let root = RootAuthorityConfig::new(dir.join("root.pem"), dir.join("root.key.pem"));
    CertificatePool::new(CertificatePoolConfig::new(root, dir.join("leaves")))
        .expect("pool construction")
}

#[test]
fn repeated_lookup_reuses_the_cached_leaf() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = pool_in(dir.path());

    let first = pool
        .server_config_for_host("example.com")
        .expect("first issue");
    let second = pool
        .server_config_for_host("example.com")
        .expect("second issue");

    assert_eq!(first.cache_status, LeafCacheStatus::Miss);
    assert_eq!(second.cache_status, LeafCacheStatus::Hit);
    assert_eq!(first.serial_hex, second.serial_hex);
    assert!(Arc::ptr_eq(&first.server_config, &second.server_config));

    let metrics = pool.metrics_snapshot();
    assert_eq!(metrics.leaves_issued, 1);
    assert_eq!(metrics.cache_hits, 1);
}

#[test]
fn host_case_and_trailing_dot_share_one_leaf() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = pool_in(dir.path());

    let lower = pool.server_config_for_host("example.com").expect("issue");
    let shouty = pool.server_config_for_host("EXAMPLE.COM.").expect("issue");

    assert_eq!(lower.serial_hex, shouty.serial_hex);
    assert_eq!(pool.metrics_snapshot().leaves_issued, 1);
}

#[test]
fn concurrent_lookups_issue_exactly_one_certificate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = Arc::new(pool_in(dir.path()));

    let handles = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.server_config_for_host("many.example.com")
                    .expect("issue")
                    .serial_hex
            })
        })
        .collect::<Vec<_>>();

    let serials = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker thread"))
        .collect::<Vec<_>>();

    assert!(serials.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(pool.metrics_snapshot().leaves_issued, 1);
}

#[test]
fn distinct_hosts_get_distinct_certificates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = pool_in(dir.path());

    let a = pool.server_config_for_host("a.example.com").expect("issue");
    let b = pool.server_config_for_host("b.example.com").expect("issue");

    assert_ne!(a.serial_hex, b.serial_hex);
    assert_ne!(a.leaf_cert_der, b.leaf_cert_der);
    assert_eq!(pool.metrics_snapshot().leaves_issued, 2);
}

#[test]
fn leaf_names_the_host_and_verifies_against_the_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = pool_in(dir.path());

    let issued = pool
        .server_config_for_host("secure.example.com")
        .expect("issue");

    let (_, leaf) =
        X509Certificate::from_der(issued.leaf_cert_der.as_ref()).expect("parse leaf der");
    let (_, root) =
        X509Certificate::from_der(pool.ca_certificate_der().as_ref()).expect("parse root der");

    leaf.verify_signature(Some(root.public_key()))
        .expect("leaf signed by pool root");
    assert_eq!(leaf.issuer(), root.subject());

    let san = leaf
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    assert!(san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::DNSName(dns) if *dns == "secure.example.com")));

    assert_eq!(hex_encode(leaf.raw_serial()), issued.serial_hex);
}

#[test]
fn ip_literal_host_gets_an_ip_san() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = pool_in(dir.path());

    let issued = pool.server_config_for_host("127.0.0.1").expect("issue");
    let (_, leaf) =
        X509Certificate::from_der(issued.leaf_cert_der.as_ref()).expect("parse leaf der");

    let san = leaf
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    assert!(san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(octets) if *octets == [127, 0, 0, 1])));
}

#[test]
fn leaf_inside_the_expiry_margin_is_reissued() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = RootAuthorityConfig::new(dir.path().join("root.pem"), dir.path().join("root.key.pem"));
    let mut config = CertificatePoolConfig::new(root, dir.path().join("leaves"));
    // Validity shorter than the margin makes every leaf immediately stale.
    config.leaf_validity = Duration::from_secs(60 * 60);
    config.expiry_margin = Duration::from_secs(48 * 60 * 60);
    let pool = CertificatePool::new(config).expect("pool construction");

    let first = pool.server_config_for_host("stale.example.com").expect("issue");
    let second = pool.server_config_for_host("stale.example.com").expect("issue");

    assert_eq!(first.cache_status, LeafCacheStatus::Miss);
    assert_eq!(second.cache_status, LeafCacheStatus::Miss);

    let metrics = pool.metrics_snapshot();
    assert_eq!(metrics.leaves_issued, 2);
    assert!(metrics.expired_discarded >= 1);
}

#[test]
fn zero_leaf_validity_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = RootAuthorityConfig::new(dir.path().join("root.pem"), dir.path().join("root.key.pem"));
    let mut config = CertificatePoolConfig::new(root, dir.path().join("leaves"));
    config.leaf_validity = Duration::ZERO;

    let error = CertificatePool::new(config).expect_err("zero validity must fail");
    assert!(matches!(error, TlsError::InvalidConfiguration(_)));
}
