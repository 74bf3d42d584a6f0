//! TLS certificate-verification policy
//!
//! The transport always runs TLS. How the server certificate is checked is
//! a policy chosen by the caller:
//!
//! - [`TlsPolicy::WebPki`]: standard chain validation against the Mozilla
//!   root set (default)
//! - [`TlsPolicy::Custom`]: any [`ServerCertVerifier`] supplied by the host
//! - [`TlsPolicy::InsecureAcceptAny`]: accepts every certificate. Opt-in
//!   only; this leaves the tunnel open to interception.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Certificate-verification policy for the TLS layer
#[derive(Clone, Default)]
pub enum TlsPolicy {
    /// Validate against the bundled web PKI roots
    #[default]
    WebPki,
    /// Host-provided verifier
    Custom(Arc<dyn ServerCertVerifier>),
    /// Accept any certificate without checking it
    InsecureAcceptAny,
}

impl TlsPolicy {
    /// Build the rustls client configuration for this policy
    pub fn client_config(&self) -> ClientConfig {
        match self {
            TlsPolicy::WebPki => {
                let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            TlsPolicy::Custom(verifier) => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(verifier.clone())
                .with_no_client_auth(),
            TlsPolicy::InsecureAcceptAny => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth(),
        }
    }

    /// Does this policy skip verification entirely?
    pub fn is_insecure(&self) -> bool {
        matches!(self, TlsPolicy::InsecureAcceptAny)
    }
}

impl fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsPolicy::WebPki => f.write_str("WebPki"),
            TlsPolicy::Custom(_) => f.write_str("Custom(..)"),
            TlsPolicy::InsecureAcceptAny => f.write_str("InsecureAcceptAny"),
        }
    }
}

/// Serializable subset of [`TlsPolicy`] used by settings files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    #[default]
    Webpki,
    InsecureAcceptAny,
}

impl From<TlsMode> for TlsPolicy {
    fn from(mode: TlsMode) -> Self {
        match mode {
            TlsMode::Webpki => TlsPolicy::WebPki,
            TlsMode::InsecureAcceptAny => TlsPolicy::InsecureAcceptAny,
        }
    }
}

/// Verifier that trusts every certificate
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
