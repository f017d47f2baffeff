// Session CA and per-host leaf certificates
//
// Each session generates a fresh CA in memory; the certificate PEM is
// published for the child runtime to trust and the private key never leaves
// the process. Leaf certificates are minted per CONNECT host, signed by the
// session CA, and cached in a bounded LRU. Hosts that refuse our leaf
// (certificate pinning) go on a pin-list so later tunnels skip termination.

use crate::error::TraceError;
use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

pub struct CertAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    leaf_cache: Mutex<LeafCache>,
    pinned: Mutex<HashSet<String>>,
}

impl CertAuthority {
    /// Generate the session CA. The key pair lives only in this struct and
    /// is dropped with the session.
    pub fn generate(cache_size: usize) -> Result<Self> {
        let ca_key = KeyPair::generate().context("generating session CA key")?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "agent-trace session CA");
        dn.push(DnType::OrganizationName, "agent-trace");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_cert = params
            .self_signed(&ca_key)
            .context("self-signing session CA")?;
        let ca_cert_pem = ca_cert.pem();

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            leaf_cache: Mutex::new(LeafCache::new(cache_size)),
            pinned: Mutex::new(HashSet::new()),
        })
    }

    /// PEM of the CA certificate, exposed to the child via its CA-bundle
    /// environment variable.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// A rustls server config presenting a leaf for `host`, from cache or
    /// freshly minted.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, TraceError> {
        if let Some(config) = self.leaf_cache.lock().unwrap().get(host) {
            return Ok(config);
        }

        let config = self.mint_leaf(host).map_err(|e| TraceError::TlsTermination {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        self.leaf_cache
            .lock()
            .unwrap()
            .insert(host.to_string(), config.clone());
        Ok(config)
    }

    fn mint_leaf(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let leaf_key = KeyPair::generate().context("generating leaf key")?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            host.try_into().context("host is not a valid DNS name")?,
        )];

        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .context("signing leaf certificate")?;

        let chain = vec![
            CertificateDer::from(leaf.der().to_vec()),
            CertificateDer::from(self.ca_cert.der().to_vec()),
        ];
        let key = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("leaf key conversion: {e}"))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .context("building TLS server config")?;

        Ok(Arc::new(config))
    }

    /// Remember a host whose client-side handshake failed so later CONNECTs
    /// tunnel blindly instead of breaking the client again.
    pub fn pin(&self, host: &str) {
        self.pinned.lock().unwrap().insert(host.to_string());
    }

    pub fn is_pinned(&self, host: &str) -> bool {
        self.pinned.lock().unwrap().contains(host)
    }
}

/// Plain bounded LRU: lookup refreshes recency, insert evicts the oldest.
struct LeafCache {
    capacity: usize,
    entries: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
}

impl LeafCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, host: &str) -> Option<Arc<ServerConfig>> {
        let config = self.entries.get(host)?.clone();
        if let Some(pos) = self.order.iter().position(|h| h == host) {
            let key = self.order.remove(pos).unwrap();
            self.order.push_back(key);
        }
        Some(config)
    }

    fn insert(&mut self, host: String, config: Arc<ServerConfig>) {
        if self.entries.insert(host.clone(), config).is_none() {
            self.order.push_back(host);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}
