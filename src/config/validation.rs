//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check trust-mode invariants (CA material where required)
//! - Check referential integrity (websocket endpoints reference existing servers)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HostingConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use crate::config::schema::{ClientCertificateMode, HostingConfig};

/// One semantic configuration problem.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The config entry the problem belongs to.
    pub subject: String,
    pub message: String,
}

impl ValidationError {
    fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

/// Validate the whole configuration, collecting every problem found.
pub fn validate_config(config: &HostingConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut seen_names = HashSet::new();
    for server in &config.server {
        let subject = format!("server '{}'", server.name);

        if !seen_names.insert(server.name.as_str()) {
            errors.push(ValidationError::new(&subject, "duplicate server name"));
        }

        if server.client_certificate_mode.requires_trust_anchors()
            && server.ca_certificates.is_empty()
        {
            errors.push(ValidationError::new(
                &subject,
                format!(
                    "client certificate mode '{:?}' requires at least one CA certificate",
                    server.client_certificate_mode
                ),
            ));
        }

        let handshake_mode = matches!(
            server.client_certificate_mode,
            ClientCertificateMode::Request | ClientCertificateMode::Trust
        );
        if handshake_mode && !server.transport.is_tls() {
            errors.push(ValidationError::new(
                &subject,
                "client certificate modes 'request' and 'trust' need a TLS listener",
            ));
        }
    }

    let known_servers: HashSet<&str> = config.server.iter().map(|s| s.name.as_str()).collect();
    for ws in &config.websocket {
        let subject = format!("websocket '{}'", ws.bind_path);

        if !ws.bind_path.starts_with('/') {
            errors.push(ValidationError::new(&subject, "bind path must start with '/'"));
        }
        if ws.default_protocol.is_empty() {
            errors.push(ValidationError::new(&subject, "default protocol must not be empty"));
        }
        for name in &ws.servers {
            if !known_servers.contains(name.as_str()) {
                errors.push(ValidationError::new(
                    &subject,
                    format!("references unknown server '{}'", name),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
