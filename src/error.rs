use std::sync::Arc;

use crate::properties::PropertyViolation;

/// Represents a result type for operations in the Abby engine.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// abby-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Abby engine.
///
/// Evaluation (flags, remote config, test variants) never returns an error. Errors are only
/// produced by operations where the caller is expected to react: invalid user properties, codec
/// failures and the network fetch (which the engine itself swallows and logs).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// One or more user properties did not match their declared validators. Lists every
    /// violation, not only the first one.
    #[error("invalid user properties: {}", format_violations(.0))]
    InvalidUserProperties(Vec<PropertyViolation>),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The delivery endpoint answered with a non-success status.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// Payload could not be encoded or decoded.
    #[error("error (de)serializing abby data: {0}")]
    Codec(Arc<serde_json::Error>),

    /// Base64 wrapper of the compact payload is invalid.
    #[error("invalid base64 payload")]
    InvalidBase64(#[source] base64::DecodeError),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

fn format_violations(violations: &[PropertyViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Codec(Arc::new(value))
    }
}
