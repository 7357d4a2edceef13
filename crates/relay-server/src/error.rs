use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::{fmt, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("body stream already exists: {0}")]
    Conflict(String),

    #[error("body stream not found: {0}")]
    NotFound(String),

    #[error("invalid body stream id: {0}")]
    InvalidId(String),

    #[error("body store io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(Arc::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Request => f.write_str("request"),
            Phase::Response => f.write_str("response"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("no connector available for tenant: {0}")]
    NoConnector(String),

    #[error("timed out waiting for response to request: {0}")]
    Timeout(String),

    #[error("connector link lost while handling request: {0}")]
    ConnectionLost(String),

    #[error("no pending call for request: {0}")]
    CorrelationNotFound(String),

    #[error("{phase} interceptor {name} failed: {message}")]
    Interceptor {
        phase: Phase,
        name: String,
        message: String,
    },

    #[error("request was cancelled: {0}")]
    Cancelled(String),

    #[error("request id is already in flight: {0}")]
    DuplicateRequest(String),

    #[error("failed to hand message to connector link: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RelayError {
    /// Whether the edge may safely try the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::NoConnector(_) | RelayError::ConnectionLost(_) | RelayError::Transport(_)
        )
    }

    /// Serializable shape used to report a failure to another relay instance.
    pub fn kind(&self) -> FailureKind {
        match self {
            RelayError::NoConnector(_) => FailureKind::NoConnector,
            RelayError::Timeout(_) => FailureKind::Timeout,
            RelayError::ConnectionLost(_) => FailureKind::ConnectionLost,
            RelayError::Cancelled(_) => FailureKind::Cancelled,
            _ => FailureKind::Transport,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NoConnector,
    Timeout,
    ConnectionLost,
    Cancelled,
    Transport,
}

impl FailureKind {
    pub fn into_error(self, id: &str) -> RelayError {
        let id = id.to_string();
        match self {
            FailureKind::NoConnector => RelayError::NoConnector(id),
            FailureKind::Timeout => RelayError::Timeout(id),
            FailureKind::ConnectionLost => RelayError::ConnectionLost(id),
            FailureKind::Cancelled => RelayError::Cancelled(id),
            FailureKind::Transport => RelayError::Transport(id),
        }
    }
}

pub enum HttpError {
    BadRequest(String),
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
    NotFound(String),
    ServiceUnavailable(String),
    Unauthorized(String),
}

impl From<RelayError> for HttpError {
    fn from(err: RelayError) -> Self {
        let message = err.to_string();
        match err {
            RelayError::NoConnector(_) => HttpError::ServiceUnavailable(message),
            RelayError::Timeout(_) => HttpError::GatewayTimeout(message),
            RelayError::Interceptor {
                phase: Phase::Request,
                ..
            }
            | RelayError::DuplicateRequest(_) => HttpError::BadRequest(message),
            RelayError::Interceptor { .. }
            | RelayError::ConnectionLost(_)
            | RelayError::Transport(_) => HttpError::BadGateway(message),
            RelayError::CorrelationNotFound(_) | RelayError::Cancelled(_) => {
                HttpError::NotFound(message)
            }
            RelayError::Store(StoreError::NotFound(_)) => HttpError::NotFound(message),
            RelayError::Store(_) => HttpError::Internal(message),
        }
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        RelayError::Store(err).into()
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match self {
            HttpError::BadRequest(m) => (StatusCode::BAD_REQUEST, m).into_response(),
            HttpError::BadGateway(m) => (StatusCode::BAD_GATEWAY, m).into_response(),
            HttpError::GatewayTimeout(m) => (StatusCode::GATEWAY_TIMEOUT, m).into_response(),
            HttpError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m).into_response(),
            HttpError::NotFound(m) => (StatusCode::NOT_FOUND, m).into_response(),
            HttpError::ServiceUnavailable(m) => {
                (StatusCode::SERVICE_UNAVAILABLE, m).into_response()
            }
            HttpError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m).into_response(),
        }
    }
}
