//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the hosting
//! layer. All types derive Serde traits for deserialization from config files.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration: a set of listening servers and the websocket
/// endpoints bound across them.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HostingConfig {
    /// Listening server definitions.
    pub server: Vec<EndpointConfig>,

    /// WebSocket endpoint definitions.
    pub websocket: Vec<WebSocketEndpointConfig>,
}

/// Configuration for one listening endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Endpoint identifier for logging.
    pub name: String,

    /// Bind host (e.g. "0.0.0.0").
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Bind port. Use 0 to let the OS pick one.
    pub listen_port: u16,

    /// How peer certificates are requested and validated.
    #[serde(default)]
    pub client_certificate_mode: ClientCertificateMode,

    /// Trust anchors for `trust` and `xfcc` modes (optional for `request`).
    #[serde(default)]
    pub ca_certificates: Vec<CertificateSource>,

    /// Plain TCP or TLS, tagged by `type`.
    #[serde(flatten)]
    pub transport: Transport,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

impl EndpointConfig {
    /// Build a plain-HTTP endpoint config with defaults suitable for tests
    /// and programmatic use.
    pub fn http(name: impl Into<String>, listen_host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            name: name.into(),
            listen_host: listen_host.into(),
            listen_port,
            client_certificate_mode: ClientCertificateMode::None,
            ca_certificates: Vec::new(),
            transport: Transport::Http,
        }
    }
}

/// Transport variant for a listening endpoint.
///
/// Behavior differences between plain and TLS listeners (listen options,
/// handshake policy) are a pure function of this tag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    /// Plain TCP listener.
    Http,

    /// TLS listener with server certificate material.
    Https {
        /// Server certificate chain (PEM).
        server_certificate: CertificateSource,

        /// Server private key (PEM).
        server_key: CertificateSource,

        /// Passphrase for an encrypted private key. Present for
        /// compatibility with upstream configs; rustls only consumes
        /// unencrypted keys, so a set passphrase fails at construction.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_key_password: Option<String>,
    },
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Https { .. })
    }
}

/// How the endpoint requests and validates peer certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientCertificateMode {
    /// Do not request a certificate and do not validate anything.
    #[default]
    None,

    /// Request a certificate at the handshake but accept any; validation
    /// is the application's business.
    Request,

    /// Request a certificate at the handshake and reject peers whose
    /// certificate does not chain to a configured trust anchor.
    Trust,

    /// Validate a certificate forwarded by an upstream proxy via the
    /// `X-Forwarded-Client-Cert` header; the handshake itself requests
    /// nothing. Hint: nginx's `$ssl_client_escaped_cert` variable produces
    /// a compatible header value.
    Xfcc,
}

impl ClientCertificateMode {
    /// Modes that validate against trust anchors and therefore require CA
    /// material at construction.
    pub fn requires_trust_anchors(&self) -> bool {
        matches!(self, ClientCertificateMode::Trust | ClientCertificateMode::Xfcc)
    }
}

/// Certificate or key material: a file path resolved at construction time,
/// or inline PEM.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CertificateSource {
    File(PathBuf),
    Inline { pem: String },
}

impl CertificateSource {
    pub fn from_pem(pem: impl Into<String>) -> Self {
        CertificateSource::Inline { pem: pem.into() }
    }

    /// Resolve the raw PEM bytes.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        match self {
            CertificateSource::File(path) => std::fs::read(path),
            CertificateSource::Inline { pem } => Ok(pem.clone().into_bytes()),
        }
    }

    /// Human-readable origin for error messages.
    pub fn describe(&self) -> String {
        match self {
            CertificateSource::File(path) => path.display().to_string(),
            CertificateSource::Inline { .. } => "<inline PEM>".to_string(),
        }
    }
}

impl From<PathBuf> for CertificateSource {
    fn from(path: PathBuf) -> Self {
        CertificateSource::File(path)
    }
}

/// Configuration for one websocket channel endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketEndpointConfig {
    /// URL path the endpoint binds on (e.g. "/ws").
    pub bind_path: String,

    /// Sub-protocol assumed when the peer proposes none.
    pub default_protocol: String,

    /// Additional accepted sub-protocols. The default protocol is always
    /// accepted and need not be repeated here.
    #[serde(default)]
    pub allowed_protocols: Vec<String>,

    /// Names of servers to bind on. Empty means every configured server.
    #[serde(default)]
    pub servers: Vec<String>,
}

impl WebSocketEndpointConfig {
    pub fn new(bind_path: impl Into<String>, default_protocol: impl Into<String>) -> Self {
        Self {
            bind_path: bind_path.into(),
            default_protocol: default_protocol.into(),
            allowed_protocols: Vec::new(),
            servers: Vec::new(),
        }
    }

    pub fn with_allowed_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }
}
