impl CertificatePool {
    pub fn new(config: CertificatePoolConfig) -> Result<Self, TlsError> {
        config.validate()?;
        fs::create_dir_all(&config.cert_dir)?;
        let ca = load_or_generate_ca_material(&config.root)?;
        let pool = Self {
            config,
            ca,
            state: Mutex::new(PoolState {
                leaves: HashMap::new(),
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            disk_reloads: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
            expired_discarded: AtomicU64::new(0),
        };
        pool.prewarm_from_disk()?;
        Ok(pool)
    }

    /// Returns a server-side TLS config whose leaf certificate names `host`.
    ///
    /// One leaf exists per distinct host: concurrent and repeated lookups for
    /// the same host share one cached entry, and the check-then-generate
    /// sequence runs under the pool mutex so at most one certificate is ever
    /// minted per host. Entries within the expiry margin of their validity
    /// window are discarded and re-issued.
    pub fn server_config_for_host(&self, host: &str) -> Result<IssuedLeaf, TlsError> {
        let normalized = normalize_host(host);
        let now = SystemTime::now();
        let mut state = self.state.lock().map_err(|_| TlsError::LockPoisoned)?;

        if let Some(cached) = state.leaves.get(&normalized) {
            if self.is_usable(cached.not_after, now) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(issued_from_cached(cached, LeafCacheStatus::Hit));
            }
            state.leaves.remove(&normalized);
            self.expired_discarded.fetch_add(1, Ordering::Relaxed);
            discard_leaf_files(&self.config.cert_dir, &normalized);
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        if let Some(loaded) = self.load_leaf_from_disk(&normalized, now) {
            self.disk_reloads.fetch_add(1, Ordering::Relaxed);
            let issued = issued_from_cached(&loaded, LeafCacheStatus::Disk);
            state.leaves.insert(normalized, loaded);
            return Ok(issued);
        }

        let minted = issue_leaf(&self.ca, &normalized, self.config.leaf_validity, now)?;
        persist_leaf(&self.config.cert_dir, &normalized, &minted, now)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);

        let cached = CachedLeaf {
            server_config: Arc::clone(&minted.server_config),
            leaf_cert_der: minted.leaf_cert_der.clone(),
            serial_hex: minted.serial_hex.clone(),
            not_after: minted.not_after,
        };
        let issued = issued_from_cached(&cached, LeafCacheStatus::Miss);
        state.leaves.insert(normalized, cached);
        Ok(issued)
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    pub fn ca_certificate_der(&self) -> &CertificateDer<'static> {
        &self.ca.cert_der
    }

    pub fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            disk_reloads: self.disk_reloads.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            expired_discarded: self.expired_discarded.load(Ordering::Relaxed),
        }
    }

    fn is_usable(&self, not_after: SystemTime, now: SystemTime) -> bool {
        now.checked_add(self.config.expiry_margin)
            .map(|deadline| deadline < not_after)
            .unwrap_or(false)
    }

    fn prewarm_from_disk(&self) -> Result<usize, TlsError> {
        let now = SystemTime::now();
        let mut state = self.state.lock().map_err(|_| TlsError::LockPoisoned)?;
        let mut loaded = 0_usize;

        for entry in fs::read_dir(&self.config.cert_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".meta.json") else {
                continue;
            };
            let Ok(meta_text) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(meta) = serde_json::from_str::<LeafMetaRecord>(&meta_text) else {
                continue;
            };
            if sanitize_host_stem(&meta.host) != stem {
                continue;
            }
            let host = normalize_host(&meta.host);
            let Some(cached) = self.load_leaf_from_disk(&host, now) else {
                continue;
            };
            state.leaves.insert(host, cached);
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Best-effort reload of a persisted leaf. Anything unreadable, mismatched,
    /// or too close to expiry is treated as absent.
    fn load_leaf_from_disk(&self, host: &str, now: SystemTime) -> Option<CachedLeaf> {
        let stem = sanitize_host_stem(host);
        let (cert_path, key_path, meta_path) = leaf_paths(&self.config.cert_dir, &stem);

        let meta_text = fs::read_to_string(&meta_path).ok()?;
        let meta = serde_json::from_str::<LeafMetaRecord>(&meta_text).ok()?;
        if normalize_host(&meta.host) != host {
            return None;
        }
        let not_after = system_time_from_unix(meta.not_after_unix);
        if !self.is_usable(not_after, now) {
            self.expired_discarded.fetch_add(1, Ordering::Relaxed);
            discard_leaf_files(&self.config.cert_dir, host);
            return None;
        }

        let cert_pem = fs::read(&cert_path).ok()?;
        let key_pem = fs::read(&key_path).ok()?;
        let leaf_cert_der = CertificateDer::from_pem_slice(&cert_pem).ok()?;
        let key_der = PrivateKeyDer::from_pem_slice(&key_pem).ok()?;
        let server_config = assemble_server_config(&self.ca, leaf_cert_der.clone(), key_der).ok()?;

        Some(CachedLeaf {
            server_config,
            leaf_cert_der,
            serial_hex: meta.serial_hex,
            not_after,
        })
    }
}

struct MintedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
    serial_hex: String,
    not_after: SystemTime,
    cert_pem: String,
    key_pem: String,
}

fn issued_from_cached(cached: &CachedLeaf, cache_status: LeafCacheStatus) -> IssuedLeaf {
    IssuedLeaf {
        server_config: Arc::clone(&cached.server_config),
        cache_status,
        leaf_cert_der: cached.leaf_cert_der.clone(),
        serial_hex: cached.serial_hex.clone(),
        not_after: cached.not_after,
    }
}

fn load_or_generate_ca_material(config: &RootAuthorityConfig) -> Result<CaMaterial, TlsError> {
    let cert_exists = config.ca_cert_pem_path.exists();
    let key_exists = config.ca_key_pem_path.exists();

    match (cert_exists, key_exists) {
        (true, true) => load_ca_material(config),
        (false, false) => {
            let generated = generate_ca_material(config)?;
            persist_ca_material(config, &generated)?;
            Ok(generated)
        }
        _ => Err(TlsError::InvalidRootAuthority(
            "root certificate and key files must both exist or both be absent".to_string(),
        )),
    }
}

fn generate_ca_material(config: &RootAuthorityConfig) -> Result<CaMaterial, TlsError> {
    let ca_key = KeyPair::generate()?;
    let ca_key_pem = ca_key.serialize_pem();
    let now = SystemTime::now();
    let not_after = now
        .checked_add(ROOT_CA_VALIDITY)
        .unwrap_or(now);

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.not_before = time::OffsetDateTime::from(now - LEAF_NOT_BEFORE_SKEW);
    params.not_after = time::OffsetDateTime::from(not_after);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.ca_common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.ca_organization.clone());
    params.distinguished_name = distinguished_name;

    let ca_cert = params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let issuer = Issuer::new(params, ca_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem: ca_key_pem,
        not_after: Some(not_after),
    })
}

fn load_ca_material(config: &RootAuthorityConfig) -> Result<CaMaterial, TlsError> {
    let cert_pem = fs::read_to_string(&config.ca_cert_pem_path)?;
    let key_pem = fs::read_to_string(&config.ca_key_pem_path)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsError::InvalidRootAuthority(format!(
            "failed to parse root certificate PEM from {}: {error}",
            config.ca_cert_pem_path.display()
        ))
    })?;
    let ca_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
        TlsError::InvalidRootAuthority(format!(
            "failed to parse issuer metadata from root certificate {}: {error}",
            config.ca_cert_pem_path.display()
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
        not_after: None,
    })
}

fn persist_ca_material(config: &RootAuthorityConfig, ca: &CaMaterial) -> Result<(), TlsError> {
    ensure_parent_exists(&config.ca_cert_pem_path)?;
    ensure_parent_exists(&config.ca_key_pem_path)?;
    fs::write(&config.ca_cert_pem_path, ca.cert_pem.as_bytes())?;
    fs::write(&config.ca_key_pem_path, ca.key_pem.as_bytes())?;
    Ok(())
}

fn ensure_parent_exists(path: &Path) -> Result<(), TlsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn issue_leaf(
    ca: &CaMaterial,
    host: &str,
    leaf_validity: Duration,
    now: SystemTime,
) -> Result<MintedLeaf, TlsError> {
    let mut not_after = now.checked_add(leaf_validity).unwrap_or(now);
    if let Some(ca_not_after) = ca.not_after {
        not_after = not_after.min(ca_not_after);
    }

    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = time::OffsetDateTime::from(now - LEAF_NOT_BEFORE_SKEW);
    params.not_after = time::OffsetDateTime::from(not_after);

    let serial_bytes = derive_serial_bytes(host, now);
    params.serial_number = Some(SerialNumber::from_slice(&serial_bytes));

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    let leaf_key = KeyPair::generate()?;
    let leaf_cert = params.signed_by(&leaf_key, &ca.issuer)?;
    let leaf_cert_der = leaf_cert.der().clone();
    let cert_pem = leaf_cert.pem();
    let key_pem = leaf_key.serialize_pem();
    let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
        .map_err(|error| TlsError::InvalidConfiguration(format!("leaf key encoding: {error}")))?;

    let server_config = assemble_server_config(ca, leaf_cert_der.clone(), key_der)?;

    Ok(MintedLeaf {
        server_config,
        leaf_cert_der,
        serial_hex: hex_encode(&serial_bytes),
        not_after,
        cert_pem,
        key_pem,
    })
}

fn assemble_server_config(
    ca: &CaMaterial,
    leaf_cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let chain = vec![leaf_cert_der, ca.cert_der.clone()];
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key_der)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(server_config))
}

fn persist_leaf(
    cert_dir: &Path,
    host: &str,
    minted: &MintedLeaf,
    now: SystemTime,
) -> Result<(), TlsError> {
    let stem = sanitize_host_stem(host);
    let (cert_path, key_path, meta_path) = leaf_paths(cert_dir, &stem);

    let meta = LeafMetaRecord {
        host: host.to_string(),
        serial_hex: minted.serial_hex.clone(),
        not_after_unix: unix_seconds(minted.not_after),
        generated_at_unix: unix_seconds(now),
    };
    let meta_json = serde_json::to_string_pretty(&meta)
        .map_err(|error| TlsError::InvalidConfiguration(format!("leaf meta encoding: {error}")))?;

    fs::write(&cert_path, minted.cert_pem.as_bytes())?;
    fs::write(&key_path, minted.key_pem.as_bytes())?;
    fs::write(&meta_path, meta_json.as_bytes())?;
    Ok(())
}

fn discard_leaf_files(cert_dir: &Path, host: &str) {
    let stem = sanitize_host_stem(host);
    let (cert_path, key_path, meta_path) = leaf_paths(cert_dir, &stem);
    let _ = fs::remove_file(cert_path);
    let _ = fs::remove_file(key_path);
    let _ = fs::remove_file(meta_path);
}

fn leaf_paths(cert_dir: &Path, stem: &str) -> (PathBuf, PathBuf, PathBuf) {
    (
        cert_dir.join(format!("{stem}.pem")),
        cert_dir.join(format!("{stem}.key.pem")),
        cert_dir.join(format!("{stem}.meta.json")),
    )
}

/// Deterministic, collision-free file stem for a host. Hosts are DNS names or
/// IP literals, so only IPv6 colons and stray characters need mapping.
fn sanitize_host_stem(host: &str) -> String {
    let stem = normalize_host(host)
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' => c,
            _ => '_',
        })
        .collect::<String>();
    if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}

fn normalize_host(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('.');
    match trimmed.parse::<IpAddr>() {
        Ok(_) => trimmed.to_string(),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

/// Serial = host hash prefix + unix timestamp suffix, so serials never
/// collide across restarts for the same or different hosts. The leading byte
/// is forced into `0x40..=0x7f` to keep the DER integer positive and free of
/// strippable leading zeros, so the recorded hex matches the certificate.
fn derive_serial_bytes(host: &str, now: SystemTime) -> [u8; 16] {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    host.hash(&mut hasher);
    let host_hash = hasher.finish();

    let mut bytes = [0_u8; 16];
    bytes[..8].copy_from_slice(&host_hash.to_be_bytes());
    bytes[8..].copy_from_slice(&unix_seconds(now).to_be_bytes());
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    bytes
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn unix_seconds(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    }
}

fn system_time_from_unix(seconds: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds)
}
