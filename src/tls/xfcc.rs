//! Extraction of proxy-forwarded client certificates.
//!
//! Terminating proxies (nginx with `$ssl_client_escaped_cert`, Envoy) pass
//! the peer certificate as a url-encoded PEM blob in the
//! `X-Forwarded-Client-Cert` header. Extraction is tolerant: any missing,
//! repeated or malformed header simply yields no candidate, and the
//! request is then rejected by the caller's trust check.

use axum::http::HeaderMap;
use rustls::pki_types::CertificateDer;
use tracing::debug;

/// Header carrying the url-encoded PEM certificate from the proxy.
pub const XFCC_HEADER: &str = "x-forwarded-client-cert";

/// Pull the forwarded certificate out of the request headers, if any.
///
/// Returns `None` when the header is absent, occurs more than once, is not
/// valid url-encoded text, or does not decode to a PEM certificate block.
pub fn extract_candidate(headers: &HeaderMap) -> Option<CertificateDer<'static>> {
    let mut values = headers.get_all(XFCC_HEADER).iter();
    let value = match (values.next(), values.next()) {
        (Some(value), None) => value,
        (None, _) => return None,
        (Some(_), Some(_)) => {
            debug!("repeated X-Forwarded-Client-Cert header, ignoring all of them");
            return None;
        }
    };

    let Ok(raw) = value.to_str() else {
        debug!("X-Forwarded-Client-Cert header is not valid text");
        return None;
    };

    let pem = match urlencoding::decode(raw) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(error = %e, "X-Forwarded-Client-Cert header is not valid url-encoding");
            return None;
        }
    };

    let candidate = match rustls_pemfile::certs(&mut pem.as_bytes()).next() {
        Some(Ok(der)) => Some(der),
        Some(Err(e)) => {
            debug!(error = %e, "forwarded client certificate is not parseable PEM");
            None
        }
        None => {
            debug!("X-Forwarded-Client-Cert header holds no certificate block");
            None
        }
    };
    candidate
}
