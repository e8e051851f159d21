use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TurnId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RunId(pub String);

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for TurnId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TurnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl ConversationId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    /// No credential, or the credential could not be refreshed.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// An `error` event arrived inside an otherwise healthy stream.
    #[error("Stream protocol error: {0}")]
    StreamProtocol(String),

    /// Never leaves the decoder; bad `data:` lines are skipped.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Request aborted")]
    Aborted,

    /// A persisted run exists but carries no section data.
    #[error("No saved detail for run {0}")]
    RunDetailMissing(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl RelayError {
    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::Internal(msg.into(), SpanTrace::capture())
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Unauthenticated(_) => "UNAUTHENTICATED",
            RelayError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            RelayError::StreamProtocol(_) => "STREAM_PROTOCOL_ERROR",
            RelayError::MalformedFrame(_) => "MALFORMED_FRAME",
            RelayError::Aborted => "ABORTED",
            RelayError::RunDetailMissing(_) => "RUN_DETAIL_MISSING",
            RelayError::Network(_) => "NETWORK_ERROR",
            RelayError::Serialization(_) => "SERIALIZATION_ERROR",
            RelayError::Io(_) => "IO_ERROR",
            RelayError::Internal(_, _) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg) = match &self.inner {
            RelayError::Unauthenticated(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            RelayError::UpstreamUnavailable(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            RelayError::StreamProtocol(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            RelayError::MalformedFrame(m) => (StatusCode::BAD_REQUEST, m.clone()),
            RelayError::Aborted => (
                // 499: client closed request
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                "Request aborted".to_string(),
            ),
            RelayError::RunDetailMissing(_) => (StatusCode::NOT_FOUND, self.inner.to_string()),
            RelayError::Network(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            RelayError::Serialization(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            RelayError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            RelayError::Internal(m, _) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };

        if status.is_server_error() {
            tracing::error!(code = self.inner.code(), "{}", self);
        }

        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": self.inner.code(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self.inner, RelayError::Unauthenticated(_))
    }
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
