use hyper::StatusCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Reasons a request is turned away before any socket is opened.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid hostname or port")]
    InvalidTarget,
    #[error("Expected Upgrade: websocket")]
    UpgradeRequired,
    #[error("missing Sec-WebSocket-Key")]
    MissingWebSocketKey,
    #[error("invalid accept key")]
    InvalidAcceptKey,
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::InvalidTarget | RequestError::MissingWebSocketKey => {
                StatusCode::BAD_REQUEST
            }
            RequestError::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            RequestError::InvalidAcceptKey => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failures after the upgrade has been committed. These only ever end the
/// session; the client sees the channel close.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tcp read error: {0}")]
    TcpRead(#[source] std::io::Error),
    #[error("tcp write error: {0}")]
    TcpWrite(#[source] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),
}
