//! Server-side TLS: certificate selection keyed by local bind endpoint.
//!
//! Multiple bind addresses may carry distinct certificates, so the host asks
//! a [`CertificateProvider`] for the rustls configuration of the endpoint a
//! connection arrived on. Client certificates are not requested and
//! revocation is not checked; a failed handshake is reported as a TLS
//! authentication error, distinct from ordinary I/O failures.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_rustls::rustls::{Certificate, NoClientAuth, PrivateKey, ServerConfig};

use super::pem;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificate is configured for local endpoint {0}")]
    NoCertificate(SocketAddr),
    #[error("unusable certificate: {0}")]
    InvalidCertificate(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Source of rustls server configurations, keyed by the local endpoint a
/// connection was accepted on. The host clears the cache when it stops so
/// private keys do not outlive it.
pub trait CertificateProvider: Send + Sync {
    fn server_config(&self, local_endpoint: SocketAddr) -> Result<Arc<ServerConfig>, TlsError>;

    fn clear_cache(&self);
}

struct IdentitySource {
    certificate: PathBuf,
    private_key: PathBuf,
}

/// A [`CertificateProvider`] backed by per-endpoint PEM files, loaded lazily
/// and cached until [`CertificateProvider::clear_cache`].
pub struct PemCertificateProvider {
    sources: HashMap<SocketAddr, IdentitySource>,
    cache: Mutex<HashMap<SocketAddr, Arc<ServerConfig>>>,
}

impl PemCertificateProvider {
    pub fn new() -> PemCertificateProvider {
        PemCertificateProvider {
            sources: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register the identity served on `endpoint`.
    pub fn add_identity(
        &mut self,
        endpoint: SocketAddr,
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
    ) {
        self.sources.insert(
            endpoint,
            IdentitySource {
                certificate: certificate.into(),
                private_key: private_key.into(),
            },
        );
    }

    /// Exact endpoint match first, then the wildcard-address entry for the
    /// same port: a listener bound to `0.0.0.0:443` serves every interface.
    fn source_for(&self, local_endpoint: SocketAddr) -> Option<&IdentitySource> {
        self.sources.get(&local_endpoint).or_else(|| {
            let wildcard = SocketAddr::new(unspecified(local_endpoint.ip()), local_endpoint.port());
            self.sources.get(&wildcard)
        })
    }
}

impl Default for PemCertificateProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn unspecified(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

impl CertificateProvider for PemCertificateProvider {
    fn server_config(&self, local_endpoint: SocketAddr) -> Result<Arc<ServerConfig>, TlsError> {
        if let Some(config) = self.cache.lock().unwrap().get(&local_endpoint) {
            return Ok(config.clone());
        }

        let source = self
            .source_for(local_endpoint)
            .ok_or(TlsError::NoCertificate(local_endpoint))?;
        let (certificates, private_key) =
            pem::read_identity(&source.certificate, &source.private_key)?;
        let config = build_config(certificates, private_key)?;

        self.cache
            .lock()
            .unwrap()
            .insert(local_endpoint, config.clone());
        Ok(config)
    }

    fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}

/// A [`CertificateProvider`] that serves one in-memory identity for every
/// bind endpoint. Useful when a single certificate covers all listeners.
pub struct SingleCertificateProvider {
    config: Arc<ServerConfig>,
}

impl SingleCertificateProvider {
    pub fn new(
        certificates: Vec<Certificate>,
        private_key: PrivateKey,
    ) -> Result<SingleCertificateProvider, TlsError> {
        Ok(SingleCertificateProvider {
            config: build_config(certificates, private_key)?,
        })
    }
}

impl CertificateProvider for SingleCertificateProvider {
    fn server_config(&self, _local_endpoint: SocketAddr) -> Result<Arc<ServerConfig>, TlsError> {
        Ok(self.config.clone())
    }

    fn clear_cache(&self) {}
}

fn build_config(
    certificates: Vec<Certificate>,
    private_key: PrivateKey,
) -> Result<Arc<ServerConfig>, TlsError> {
    let mut config = ServerConfig::new(NoClientAuth::new());
    config
        .set_single_cert(certificates, private_key)
        .map_err(|error| TlsError::InvalidCertificate(error.to_string()))?;
    Ok(Arc::new(config))
}
