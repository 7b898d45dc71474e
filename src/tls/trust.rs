//! Trust anchor evaluation for client certificates.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tracing::{trace, warn};

use crate::config::CertificateSource;
use crate::tls::{read_cert_chain, TlsError};

/// One configured CA certificate together with its single-anchor verifier.
///
/// The verifier is optional: an anchor that webpki cannot consume (for
/// example an unsupported signature algorithm) stays in the set but never
/// trusts anything.
struct TrustAnchor {
    der: CertificateDer<'static>,
    verifier: Option<Arc<dyn ClientCertVerifier>>,
}

/// An ordered set of trust anchors built from configured CA material.
///
/// A candidate certificate is trusted when it chains to at least one
/// anchor. Each anchor is evaluated independently so a failure against
/// one never masks a match against another.
pub struct TrustAnchorSet {
    anchors: Vec<TrustAnchor>,
}

impl TrustAnchorSet {
    /// Parse all configured CA sources into a trust anchor set.
    ///
    /// Unparseable PEM is a hard error; the caller must not start serving
    /// with a partially loaded trust configuration.
    pub fn load(sources: &[CertificateSource]) -> Result<Self, TlsError> {
        let mut anchors = Vec::new();

        for source in sources {
            for der in read_cert_chain(source)? {
                let verifier = build_anchor_verifier(&der);
                if verifier.is_none() {
                    warn!(
                        source = %source.describe(),
                        "trust anchor not usable for verification, it will never match"
                    );
                }
                anchors.push(TrustAnchor { der, verifier });
            }
        }

        Ok(Self { anchors })
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Check whether `candidate` chains to any anchor in the set.
    ///
    /// Anchors are consulted in configuration order. A verification error
    /// against one anchor is expected for any multi-CA setup and only
    /// traced; the next anchor is consulted.
    pub fn verify(&self, candidate: &CertificateDer<'_>) -> bool {
        let now = UnixTime::now();

        for (index, anchor) in self.anchors.iter().enumerate() {
            let Some(verifier) = &anchor.verifier else {
                continue;
            };

            match verifier.verify_client_cert(candidate, &[], now) {
                Ok(_) => return true,
                Err(e) => {
                    trace!(anchor = index, error = %e, "candidate did not chain to anchor");
                }
            }
        }

        false
    }

    /// A root store holding every anchor, for handshake-level verification.
    pub fn root_store(&self) -> RootCertStore {
        let mut store = RootCertStore::empty();
        for anchor in &self.anchors {
            if let Err(e) = store.add(anchor.der.clone()) {
                warn!(error = %e, "trust anchor rejected by root store");
            }
        }
        store
    }
}

impl std::fmt::Debug for TrustAnchorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchorSet")
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

fn build_anchor_verifier(der: &CertificateDer<'static>) -> Option<Arc<dyn ClientCertVerifier>> {
    let mut store = RootCertStore::empty();
    if let Err(e) = store.add(der.clone()) {
        warn!(error = %e, "cannot use certificate as trust anchor");
        return None;
    }

    match WebPkiClientVerifier::builder(Arc::new(store)).build() {
        Ok(verifier) => Some(verifier),
        Err(e) => {
            warn!(error = %e, "cannot build verifier for trust anchor");
            None
        }
    }
}
