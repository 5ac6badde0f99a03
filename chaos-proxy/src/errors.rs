use crate::config::ValidationError;
use hyper::StatusCode;
use std::io;

/// Errors produced while serving a proxied request.
///
/// Every variant is terminal for its request; nothing here is retried.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("missing access key")]
    MissingKey,
    #[error("invalid or inactive access key")]
    KeyNotFound,
    #[error("invalid or inactive access key")]
    KeyInactive,
    #[error("no target matches the request path")]
    NoMatchingTarget,
    #[error("method {method} not allowed (allowed: {allowed})")]
    MethodNotAllowed { method: String, allowed: String },
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream {0} timed out")]
    UpstreamTimeout(String),
    /// Carries a sanitized description, never the raw transport error.
    #[error("upstream {0} failed: {1}")]
    UpstreamError(String, String),
    #[error("configuration store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingKey | ProxyError::KeyNotFound | ProxyError::KeyInactive => {
                StatusCode::UNAUTHORIZED
            }
            ProxyError::NoMatchingTarget => StatusCode::NOT_FOUND,
            ProxyError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamError(..) => StatusCode::BAD_GATEWAY,
            ProxyError::Store(_)
            | ProxyError::Config(_)
            | ProxyError::HttpClient(_)
            | ProxyError::Io(_)
            | ProxyError::Hyper(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::Store(_)
            | ProxyError::Config(_)
            | ProxyError::HttpClient(_)
            | ProxyError::Io(_)
            | ProxyError::Hyper(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Short label used for metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MissingKey => "missing_key",
            ProxyError::KeyNotFound => "key_not_found",
            ProxyError::KeyInactive => "key_inactive",
            ProxyError::NoMatchingTarget => "no_matching_target",
            ProxyError::MethodNotAllowed { .. } => "method_not_allowed",
            ProxyError::BodyTooLarge(_) => "body_too_large",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::UpstreamError(..) => "upstream_error",
            ProxyError::Store(_) => "store",
            ProxyError::Config(_) => "config",
            ProxyError::HttpClient(_) => "http_client",
            ProxyError::Io(_) => "io",
            ProxyError::Hyper(_) => "hyper",
        }
    }
}

/// Faults reported by the configuration store collaborator.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown key id: {0}")]
    UnknownKey(String),
    #[error("unknown target id: {0}")]
    UnknownTarget(String),
}
