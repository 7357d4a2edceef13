use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum Error {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::error::Error),

    #[error("header value error: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("header name error: {0}")]
    InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error("failed to parse relay message: {0}")]
    ParseFailed(#[from] serde_json::Error),

    #[error("invalid HTTP method: {0}")]
    InvalidMethod(#[from] tungstenite::http::method::InvalidMethod),

    #[error("server did not accept the handshake in time")]
    HandshakeTimeout,

    #[error("server rejected the connection")]
    Rejected,

    #[error("no traffic from server, link considered dead")]
    LinkDead,

    #[error("unexpected message from server: {0}")]
    UnexpectedMessage(String),
}
