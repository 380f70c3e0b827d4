//! Error types for the TLS core.
//!
//! Mirrors the teacher's hand-rolled `enum` + `Display` style (no
//! `thiserror`/`anyhow` anywhere in this crate) — every fallible operation
//! returns one of these, never panics, except for the programming-error
//! assertions called out in spec.md §7 (fd out of range, missing registry
//! entry), which use `assert!`/`debug_assert!` directly at the call site.

use std::fmt;

/// Coarse classification of an engine-level TLS error, matching spec.md
/// §4.1 ("an engine-wide error code plus a classification").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    Io,
    Blocked,
    Protocol,
    Internal,
}

#[derive(Debug, Clone)]
pub struct EngineError {
    pub code: i32,
    pub kind: EngineErrorKind,
    pub detail: String,
}

impl EngineError {
    pub fn new(code: i32, kind: EngineErrorKind, detail: impl Into<String>) -> Self {
        Self { code, kind, detail: detail.into() }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::new(0, EngineErrorKind::Protocol, detail)
    }

    pub fn io(code: i32, detail: impl Into<String>) -> Self {
        Self::new(code, EngineErrorKind::Io, detail)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS engine error ({:?}, code {}): {}", self.kind, self.code, self.detail)
    }
}

impl std::error::Error for EngineError {}

#[derive(Debug, Clone)]
pub enum CertError {
    InvalidPem(String),
    MissingCommonName,
    NameTooLong,
    ZeroSerial,
    SerialOverflow,
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertError::InvalidPem(e) => write!(f, "invalid PEM certificate: {e}"),
            CertError::MissingCommonName => write!(f, "certificate has no subject common name"),
            CertError::NameTooLong => write!(f, "certificate field exceeds maximum length"),
            CertError::ZeroSerial => write!(f, "certificate serial is zero"),
            CertError::SerialOverflow => write!(f, "certificate serial does not fit in 128 bits"),
        }
    }
}

impl std::error::Error for CertError {}

#[derive(Debug, Clone)]
pub enum ConfigError {
    MissingCertChain,
    MissingPrivateKey,
    Rustls(String),
    BadTrustStore(String),
    Cert(CertError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingCertChain => write!(f, "server config requires a certificate chain"),
            ConfigError::MissingPrivateKey => write!(f, "server config requires a private key"),
            ConfigError::Rustls(e) => write!(f, "TLS config error: {e}"),
            ConfigError::BadTrustStore(e) => write!(f, "trust store error: {e}"),
            ConfigError::Cert(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<CertError> for ConfigError {
    fn from(e: CertError) -> Self {
        ConfigError::Cert(e)
    }
}

#[derive(Debug, Clone)]
pub enum RegistryError {
    CapacityExceeded { max_occupied: usize, requested_size: usize },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapacityExceeded { max_occupied, requested_size } => write!(
                f,
                "cannot resize registry to {requested_size}: fd {max_occupied} is still occupied"
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Clone)]
pub enum InitError {
    Config(ConfigError),
    Engine(EngineError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Config(e) => write!(f, "TLS init failed: {e}"),
            InitError::Engine(e) => write!(f, "TLS init failed: {e}"),
        }
    }
}

impl std::error::Error for InitError {}

impl From<ConfigError> for InitError {
    fn from(e: ConfigError) -> Self {
        InitError::Config(e)
    }
}

#[derive(Debug, Clone)]
pub enum RotationError {
    Config(ConfigError),
}

impl fmt::Display for RotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationError::Config(e) => write!(f, "certificate rotation rejected: {e}"),
        }
    }
}

impl std::error::Error for RotationError {}

impl From<ConfigError> for RotationError {
    fn from(e: ConfigError) -> Self {
        RotationError::Config(e)
    }
}
