//! Mutual TLS configuration.
//!
//! The hub presents its own certificate and requires every node to present one issued by the
//! configured CA. Only the `ring` provider is used; nothing here touches process-wide rustls state.

use super::TransportError;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(context: &str, err: impl std::fmt::Debug) -> TransportError {
    TransportError::Tls(format!("{context}: {err:?}"))
}

/// Parse every certificate in a PEM bundle.
pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err("invalid certificate PEM", e))?;
    if certs.is_empty() {
        return Err(TransportError::Tls("no certificates found in PEM".into()));
    }
    Ok(certs)
}

/// Trust anchors from a CA bundle.
pub fn root_store(ca_pem: &[u8]) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(ca_pem)? {
        roots.add(cert).map_err(|e| tls_err("invalid CA certificate", e))?;
    }
    Ok(roots)
}

/// Verifier accepting client certificates that chain to `ca_pem`.
pub fn client_verifier(ca_pem: &[u8]) -> Result<Arc<dyn ClientCertVerifier>, TransportError> {
    WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(ca_pem)?), provider())
        .build()
        .map_err(|e| tls_err("client verifier", e))
}

/// PEM material for one side of a mutual TLS link.
#[derive(Clone)]
pub struct TlsMaterial {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_pem", &self.ca_pem.len())
            .field("cert_pem", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    pub fn from_pem(ca_pem: impl Into<Vec<u8>>, cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self { ca_pem: ca_pem.into(), cert_pem: cert_pem.into(), key_pem: key_pem.into() }
    }

    pub fn from_files(ca: &Path, cert: &Path, key: &Path) -> Result<Self, TransportError> {
        let read = |p: &Path| {
            std::fs::read(p).map_err(|e| TransportError::Tls(format!("read {}: {e}", p.display())))
        };
        Ok(Self::from_pem(read(ca)?, read(cert)?, read(key)?))
    }

    pub fn ca_pem(&self) -> &[u8] {
        &self.ca_pem
    }

    fn identity(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
        let certs = parse_certificates(&self.cert_pem)?;
        let key = PrivateKeyDer::from_pem_slice(&self.key_pem).map_err(|e| tls_err("invalid private key", e))?;
        Ok((certs, key))
    }

    /// Hub-side configuration requiring client certificates.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TransportError> {
        let (certs, key) = self.identity()?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_err("protocol versions", e))?
            .with_client_cert_verifier(client_verifier(&self.ca_pem)?)
            .with_single_cert(certs, key)
            .map_err(|e| tls_err("server certificate", e))?;
        Ok(Arc::new(config))
    }

    /// Node-side configuration presenting a client certificate.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let (certs, key) = self.identity()?;
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(root_store(&self.ca_pem)?), provider())
            .build()
            .map_err(|e| tls_err("server verifier", e))?;
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_err("protocol versions", e))?
            .with_webpki_verifier(verifier)
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_err("client certificate", e))?;
        Ok(Arc::new(config))
    }
}
