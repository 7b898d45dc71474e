//! Handshake policy derivation.
//!
//! Maps the configured client certificate mode onto a rustls
//! `ServerConfig`:
//!
//! - `none` and `xfcc`: no certificate is requested at the handshake
//! - `request`: a certificate is requested but never rejected; the
//!   application decides what to do with it
//! - `trust`: a certificate is required and must chain to a configured
//!   trust anchor, enforced by webpki during the handshake

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};

use crate::config::{CertificateSource, ClientCertificateMode};
use crate::tls::{read_cert_chain, TlsError, TrustAnchorSet};

/// Build the rustls server configuration for a TLS listener.
pub fn build_server_config(
    server_certificate: &CertificateSource,
    server_key: &CertificateSource,
    server_key_password: Option<&str>,
    mode: ClientCertificateMode,
    trust: Option<&TrustAnchorSet>,
) -> Result<ServerConfig, TlsError> {
    if server_key_password.is_some() {
        return Err(TlsError::EncryptedKey);
    }

    let cert_chain = read_cert_chain(server_certificate)?;
    let key = load_private_key(server_key)?;

    let builder = ServerConfig::builder();
    let mut config = match mode {
        ClientCertificateMode::None | ClientCertificateMode::Xfcc => builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| TlsError::ConfigBuild(e.to_string()))?,

        ClientCertificateMode::Request => builder
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
            .with_single_cert(cert_chain, key)
            .map_err(|e| TlsError::ConfigBuild(e.to_string()))?,

        ClientCertificateMode::Trust => {
            let trust = trust.ok_or_else(|| {
                TlsError::ConfigBuild(
                    "client certificate mode 'trust' requires CA certificates".to_string(),
                )
            })?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(trust.root_store()))
                .build()
                .map_err(|e| TlsError::ConfigBuild(e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert_chain, key)
                .map_err(|e| TlsError::ConfigBuild(e.to_string()))?
        }
    };

    // WebSocket upgrades need HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

fn load_private_key(source: &CertificateSource) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = source
        .read()
        .map_err(|e| TlsError::KeyLoad(format!("{}: {}", source.describe(), e)))?;

    if pem.windows(9).any(|w| w == b"ENCRYPTED") {
        return Err(TlsError::EncryptedKey);
    }

    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TlsError::KeyLoad(format!("{}: {}", source.describe(), e)))?
        .ok_or_else(|| {
            TlsError::KeyLoad(format!("{}: no private key found", source.describe()))
        })
}

fn default_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Verifier for `request` mode: asks the peer for a certificate during the
/// handshake but accepts whatever arrives, including nothing at all.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyClientCert {
    fn new() -> Self {
        Self {
            provider: default_provider(),
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
