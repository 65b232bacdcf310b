//! Error types for the compiler

use thiserror::Error;

/// Compile error type
///
/// Fatal variants abort the whole compilation; no partial document is
/// emitted. Degraded conditions (dropped chain members, unsupported per-app
/// rules) are not errors — they surface as [`crate::compiler::Alert`]s.
#[derive(Error, Debug)]
pub enum Error {
    #[error("profile {0} not found")]
    ProfileNotFound(i64),

    #[error("profile {id}: unsupported protocol: {kind}")]
    UnsupportedProtocol { id: i64, kind: String },

    #[error("profile {id}: missing required field: {field}")]
    MissingField { id: i64, field: &'static str },

    #[error("chain {0} expands to zero concrete hops")]
    EmptyChain(i64),

    #[error("chain {0} references itself (directly or through a nested chain)")]
    ChainCycle(i64),

    #[error("rule {rule} targets unresolved profile {target}")]
    UnresolvedRuleTarget { rule: i64, target: i64 },

    #[error("no free local port after {0} attempts")]
    PortExhausted(u32),

    #[error("profile store unavailable: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

impl Error {
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Error::Store(msg.into())
    }

    pub fn missing(id: i64, field: &'static str) -> Self {
        Error::MissingField { id, field }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialize(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
