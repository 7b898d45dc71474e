//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → HostingConfig (validated, immutable)
//!     → endpoint construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - Validation separates syntactic (serde) from semantic checks
//! - Trust-mode invariants are checked both here and at endpoint
//!   construction, so programmatically built configs fail just as loudly

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    CertificateSource, ClientCertificateMode, EndpointConfig, HostingConfig, Transport,
    WebSocketEndpointConfig,
};
pub use validation::{validate_config, ValidationError};
