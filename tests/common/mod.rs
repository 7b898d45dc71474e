//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ws_hosting::{EndpointConfig, HostingEndpoint};

/// Install the process-wide crypto provider exactly once.
pub fn ensure_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Start a plain-HTTP hosting endpoint on an ephemeral port.
pub async fn start_http_endpoint() -> Arc<HostingEndpoint> {
    let endpoint =
        Arc::new(HostingEndpoint::new(EndpointConfig::http("test", "127.0.0.1", 0)).unwrap());
    endpoint.init().await.unwrap();
    endpoint
}

pub fn http_url(endpoint: &HostingEndpoint, path: &str) -> String {
    format!("http://{}{}", endpoint.local_addr().unwrap(), path)
}

pub fn ws_url(endpoint: &HostingEndpoint, path: &str) -> String {
    format!("ws://{}{}", endpoint.local_addr().unwrap(), path)
}
