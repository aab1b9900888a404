//! Server-level errors.

use nerve_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced by the engine and handlers.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Error from the core runtime.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Missing or malformed required fields in command params.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Proxy bring-up failed after retries.
    #[error("proxy start failed: {0}")]
    ProxyStart(String),

    /// Proxy never became healthy.
    #[error("proxy health check failed: {0}")]
    ProxyHealth(String),
}

impl ServerError {
    /// Taxonomy tag carried in `data.error_type` of failed results.
    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Core(e) => e.error_type(),
            ServerError::InvalidParams(_) => "InvalidParams",
            ServerError::ProxyStart(_) => "ProxyStartError",
            ServerError::ProxyHealth(_) => "ProxyHealthError",
        }
    }
}
