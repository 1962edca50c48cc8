//! Client certificate checks performed once per connection.

use super::{node_user, AuthError};
use crate::session::HubInfo;
use crate::transport::tls::client_verifier;
use crate::transport::{Connection, PeerHeaders};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use std::fmt;
use std::sync::Arc;

/// Common name of the certificate subject.
pub fn common_name(cert: &CertificateDer<'_>) -> Result<String, AuthError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| AuthError::Certificate(format!("parse: {e}")))?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| AuthError::Certificate("subject has no common name".into()))?;
    cn.as_str()
        .map(str::to_string)
        .map_err(|e| AuthError::Certificate(format!("common name: {e}")))
}

/// Verifies that a connecting node presents exactly one certificate, issued by the hub's CA,
/// naming the node it claims to be.
#[derive(Clone)]
pub struct CertificateAuthenticator {
    verifier: Arc<dyn ClientCertVerifier>,
    enabled: bool,
    debug: bool,
}

impl fmt::Debug for CertificateAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthenticator")
            .field("enabled", &self.enabled)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthenticator {
    pub fn new(ca_pem: &[u8], enabled: bool, debug: bool) -> Result<Self, AuthError> {
        let verifier = client_verifier(ca_pem).map_err(|e| AuthError::Certificate(e.to_string()))?;
        Ok(Self { verifier, enabled, debug })
    }

    /// Identity of the peer on `conn`.
    pub fn authenticate(&self, conn: &dyn Connection) -> Result<HubInfo, AuthError> {
        self.authenticate_parts(conn.peer_headers(), conn.peer_certificates())
    }

    pub fn authenticate_parts(
        &self,
        headers: &PeerHeaders,
        certificates: &[CertificateDer<'static>],
    ) -> Result<HubInfo, AuthError> {
        let node_id = headers
            .node_id()
            .ok_or_else(|| AuthError::Unauthenticated("missing node_id header".into()))?;
        let info = HubInfo::new(node_id, headers.project_id().unwrap_or_default());
        if !self.enabled {
            return Ok(info);
        }
        match self.verify(node_id, certificates) {
            Ok(()) => Ok(info),
            Err(err) if self.debug => {
                tracing::warn!(
                    target: "cloudhub::auth",
                    node_id = %node_id,
                    error = %err,
                    "certificate check failed, admitting in debug mode"
                );
                Ok(info)
            }
            Err(err) => Err(err),
        }
    }

    fn verify(&self, node_id: &str, certificates: &[CertificateDer<'static>]) -> Result<(), AuthError> {
        let cert = match certificates {
            [cert] => cert,
            [] => return Err(AuthError::Unauthenticated("no client certificate".into())),
            many => {
                return Err(AuthError::Unauthenticated(format!(
                    "expected one client certificate, got {}",
                    many.len()
                )))
            }
        };
        self.verifier
            .verify_client_cert(cert, &[], UnixTime::now())
            .map_err(|e| AuthError::Certificate(format!("verify: {e}")))?;
        let cn = common_name(cert)?;
        let expected = node_user(node_id);
        if cn != expected {
            return Err(AuthError::Unauthenticated(format!(
                "common name {cn:?} does not match {expected:?}"
            )));
        }
        Ok(())
    }
}
