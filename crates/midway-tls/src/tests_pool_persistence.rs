use super::*;

fn pool_config(dir: &Path) -> CertificatePoolConfig {
    let root = RootAuthorityConfig::new(dir.join("root.pem"), dir.join("root.key.pem"));
    CertificatePoolConfig::new(root, dir.join("leaves"))
}

#[test]
fn restart_prewarms_persisted_leaves() {
    let dir = tempfile::tempdir().expect("tempdir");

    let first_serial = {
        let pool = CertificatePool::new(pool_config(dir.path())).expect("first pool");
        let issued = pool.server_config_for_host("persist.example.com").expect("issue");
        assert_eq!(issued.cache_status, LeafCacheStatus::Miss);
        issued.serial_hex
    };

    let pool = CertificatePool::new(pool_config(dir.path())).expect("second pool");
    let issued = pool.server_config_for_host("persist.example.com").expect("issue");

    // Pre-warm loaded the persisted leaf into memory, so the lookup is a hit
    // and no new certificate is minted.
    assert_eq!(issued.cache_status, LeafCacheStatus::Hit);
    assert_eq!(issued.serial_hex, first_serial);
    assert_eq!(pool.metrics_snapshot().leaves_issued, 0);
}

#[test]
fn sibling_pool_reloads_a_leaf_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Both pools exist before any leaf does, so the second pool's pre-warm
    // sees an empty directory and its lookup exercises the disk fallback.
    let writer = CertificatePool::new(pool_config(dir.path())).expect("writer pool");
    let reader = CertificatePool::new(pool_config(dir.path())).expect("reader pool");

    let written = writer.server_config_for_host("shared.example.com").expect("issue");
    let reloaded = reader.server_config_for_host("shared.example.com").expect("reload");

    assert_eq!(written.cache_status, LeafCacheStatus::Miss);
    assert_eq!(reloaded.cache_status, LeafCacheStatus::Disk);
    assert_eq!(reloaded.serial_hex, written.serial_hex);
    assert_eq!(reloaded.leaf_cert_der, written.leaf_cert_der);
    assert_eq!(reader.metrics_snapshot().disk_reloads, 1);
    assert_eq!(reader.metrics_snapshot().leaves_issued, 0);
}

#[test]
fn corrupted_meta_record_forces_reissue() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let pool = CertificatePool::new(pool_config(dir.path())).expect("first pool");
        pool.server_config_for_host("corrupt.example.com").expect("issue");
    }

    let meta_path = dir.path().join("leaves").join("corrupt.example.com.meta.json");
    fs::write(&meta_path, b"{ not json").expect("corrupt meta file");

    let pool = CertificatePool::new(pool_config(dir.path())).expect("second pool");
    let issued = pool.server_config_for_host("corrupt.example.com").expect("reissue");

    assert_eq!(issued.cache_status, LeafCacheStatus::Miss);
    assert_eq!(pool.metrics_snapshot().leaves_issued, 1);
    // The rewritten meta record must parse again.
    let meta_text = fs::read_to_string(&meta_path).expect("rewritten meta");
    let meta = serde_json::from_str::<LeafMetaRecord>(&meta_text).expect("meta parses");
    assert_eq!(meta.serial_hex, issued.serial_hex);
}

#[test]
fn expired_leaf_on_disk_is_discarded_at_startup() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let pool = CertificatePool::new(pool_config(dir.path())).expect("first pool");
        pool.server_config_for_host("old.example.com").expect("issue");
    }

    let meta_path = dir.path().join("leaves").join("old.example.com.meta.json");
    let meta_text = fs::read_to_string(&meta_path).expect("meta file");
    let mut meta = serde_json::from_str::<LeafMetaRecord>(&meta_text).expect("meta parses");
    meta.not_after_unix = 1;
    fs::write(&meta_path, serde_json::to_string(&meta).expect("encode")).expect("rewrite meta");

    let pool = CertificatePool::new(pool_config(dir.path())).expect("second pool");
    assert!(!meta_path.exists(), "expired leaf files are removed");

    let issued = pool.server_config_for_host("old.example.com").expect("reissue");
    assert_eq!(issued.cache_status, LeafCacheStatus::Miss);
}

#[test]
fn root_authority_round_trips_through_pem() {
    let dir = tempfile::tempdir().expect("tempdir");

    let generated_pem = {
        let pool = CertificatePool::new(pool_config(dir.path())).expect("first pool");
        pool.ca_certificate_pem().to_string()
    };
    assert!(dir.path().join("root.pem").exists());
    assert!(dir.path().join("root.key.pem").exists());

    let pool = CertificatePool::new(pool_config(dir.path())).expect("second pool");
    assert_eq!(pool.ca_certificate_pem(), generated_pem);

    // Leaves minted after the reload still chain to the same root.
    let issued = pool.server_config_for_host("chained.example.com").expect("issue");
    assert_eq!(issued.cache_status, LeafCacheStatus::Miss);
}

#[test]
fn lone_root_key_file_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("root.key.pem"), b"not a key").expect("stray key file");

    let error = CertificatePool::new(pool_config(dir.path())).expect_err("must fail");
    assert!(matches!(error, TlsError::InvalidRootAuthority(_)));
}

#[test]
fn client_config_with_pool_root_builds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = CertificatePool::new(pool_config(dir.path())).expect("pool");
    let config = build_client_config_with_root(pool.ca_certificate_der()).expect("client config");
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
}
