// Error types for the Trestle pipeline

use crate::registry::Registry;
use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Not in registry: {0}")]
    NotInRegistry(&'static str),

    #[error("No renderer registered for: {0}")]
    NoSuchRenderer(&'static str),

    #[error("Invalid path pattern: {0}")]
    InvalidPathPattern(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Blocking operation failed: {0}")]
    Blocking(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // 4xx Client Errors
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Method Not Allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    // 5xx Server Errors
    #[error("Service Unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),

    /// A handler failure captured by the chain engine, together with the
    /// registry that was in effect at the failing step.
    #[error("{}", .0.source)]
    Pipeline(Box<PipelineFailure>),
}

/// Failure raised inside a handler chain.
#[derive(Debug)]
pub struct PipelineFailure {
    pub source: Error,
    pub registry: Registry,
}

impl Error {
    /// Wrap an arbitrary error type.
    pub fn custom<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Custom(Box::new(err))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Wrap this error with the registry of the step that raised it.
    ///
    /// Errors that are already wrapped are returned unchanged, so the
    /// registry of the innermost failing step is the one that survives.
    pub fn in_pipeline(self, registry: &Registry) -> Self {
        match self {
            Error::Pipeline(_) => self,
            source => Error::Pipeline(Box::new(PipelineFailure {
                source,
                registry: registry.clone(),
            })),
        }
    }

    /// Strip pipeline wrapping, returning the underlying error and the
    /// registry captured at the failure point (if any).
    pub fn into_parts(self) -> (Error, Option<Registry>) {
        match self {
            Error::Pipeline(failure) => {
                let PipelineFailure { source, registry } = *failure;
                (source, Some(registry))
            }
            other => (other, None),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        self.status().as_u16()
    }

    /// Get the StatusCode for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Pipeline(failure) => failure.source.status(),

            // Default to 500 for unmapped errors
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::Http(err.to_string())
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::Http(err.to_string())
    }
}
