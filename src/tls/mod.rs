//! Certificate handling subsystem.
//!
//! # Data Flow
//! ```text
//! EndpointConfig (cert/key/CA sources, client certificate mode)
//!     → trust.rs (parse CA material into a TrustAnchorSet)
//!     → server.rs (derive the rustls ServerConfig for the handshake policy)
//!
//! Per request, XFCC mode only:
//!     X-Forwarded-Client-Cert header
//!         → xfcc.rs (url-decode, PEM parse)
//!         → trust.rs verify() against the TrustAnchorSet
//! ```
//!
//! # Design Decisions
//! - All certificate material is parsed once, at endpoint construction;
//!   parse failures prevent the endpoint from starting
//! - Verification failures against one anchor never abort the whole trust
//!   check; the next anchor is consulted
//! - XFCC validation happens at the application layer, not the handshake,
//!   because the certificate arrives via header from an intermediary

pub mod server;
pub mod trust;
pub mod xfcc;

use thiserror::Error;

use crate::config::CertificateSource;
use rustls::pki_types::CertificateDer;

pub use trust::TrustAnchorSet;
pub use xfcc::{extract_candidate, XFCC_HEADER};

/// Error type for certificate and TLS configuration operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load certificate: {0}")]
    CertificateLoad(String),

    #[error("failed to load private key: {0}")]
    KeyLoad(String),

    #[error("failed to build TLS config: {0}")]
    ConfigBuild(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("encrypted private keys are not supported; provide the key unencrypted and drop server_key_password")]
    EncryptedKey,
}

/// Parse every certificate in a PEM source.
pub(crate) fn read_cert_chain(
    source: &CertificateSource,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = source
        .read()
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", source.describe(), e)))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", source.describe(), e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad(format!(
            "{}: no certificates found",
            source.describe()
        )));
    }

    Ok(certs)
}
