//! Client TLS for upstream connections.

use cluster_proxy_tunnel::Connection;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use std::{path::Path, sync::Arc};
use tokio_rustls::TlsConnector;

/// Wraps tunneled connections in TLS.
///
/// Only HTTP/1.1 is offered via ALPN so that upstreams may upgrade the
/// connection to a non-HTTP protocol.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    server_name: Option<ServerName<'static>>,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read trust roots from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PEM: {0}")]
    Pem(#[source] std::io::Error),

    #[error("no trust roots found")]
    NoRoots,

    #[error("invalid trust root: {0}")]
    Root(#[source] rustls::Error),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("invalid TLS server name {0:?}")]
    ServerName(String),

    #[error("TLS handshake with {name} failed: {source}")]
    Handshake {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoServerVerification(Arc<CryptoProvider>);

// === impl TlsClient ===

impl TlsClient {
    /// Verifies servers against `roots`.
    pub fn verified(roots: RootCertStore) -> Result<Self, TlsError> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::new(config))
    }

    /// Does not authenticate servers.
    pub fn insecure() -> Result<Self, TlsError> {
        let provider = provider();
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification(provider)))
            .with_no_client_auth();
        Ok(Self::new(config))
    }

    fn new(mut config: ClientConfig) -> Self {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name: None,
        }
    }

    /// Authenticates every server as `name` regardless of the host dialed.
    pub fn with_server_name(mut self, name: &str) -> Result<Self, TlsError> {
        self.server_name = Some(server_name(name)?);
        Ok(self)
    }

    pub async fn connect(&self, host: &str, io: Connection) -> Result<Connection, TlsError> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => server_name(host)?,
        };
        let tls = self
            .connector
            .connect(name, io)
            .await
            .map_err(|source| TlsError::Handshake {
                name: host.to_string(),
                source,
            })?;
        Ok(Box::new(tls))
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string()).map_err(|_| TlsError::ServerName(name.to_string()))
}

/// Builds a root store from the certificates in PEM documents.
pub fn roots_from_pem<'a>(
    pems: impl IntoIterator<Item = &'a [u8]>,
) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for mut pem in pems {
        for cert in rustls_pemfile::certs(&mut pem) {
            let cert = cert.map_err(TlsError::Pem)?;
            roots.add(cert).map_err(TlsError::Root)?;
        }
    }
    if roots.is_empty() {
        return Err(TlsError::NoRoots);
    }
    Ok(roots)
}

/// Reads trust roots from PEM files.
pub async fn load_roots(paths: &[impl AsRef<Path>]) -> Result<RootCertStore, TlsError> {
    let mut pems = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let pem = tokio::fs::read(path).await.map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        pems.push(pem);
    }
    roots_from_pem(pems.iter().map(Vec::as_slice))
}

// === impl NoServerVerification ===

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
