use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use qlink_common::HandshakeError;
use serde::Serialize;
use std::net::IpAddr;
use thiserror::Error;

/// Errors that stop the proxy server.
#[derive(Error, Debug)]
pub enum QlinksError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the `POST /signal` endpoint.
#[derive(Error, Debug)]
pub enum SignalError {
    /// The requested robot address is not a valid IP.
    #[error("invalid robot address: {0}")]
    InvalidAddress(String),
    /// The robot address is outside the allow-list.
    #[error("robot {0} is not allowed")]
    Forbidden(IpAddr),
    /// The robot already has an active peer.
    #[error("session rejected by robot (another peer is connected)")]
    Rejected,
    /// The handshake with the robot failed.
    #[error("handshake failed: {0}")]
    Handshake(HandshakeError),
}

impl From<HandshakeError> for SignalError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::SessionRejected => Self::Rejected,
            other => Self::Handshake(other),
        }
    }
}

impl SignalError {
    /// HTTP status reported for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Rejected => StatusCode::CONFLICT,
            Self::Handshake(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qlink_common::signaling::PROXY_REJECT_STATUS;

    #[test]
    fn rejection_uses_the_status_clients_expect() {
        let err = SignalError::from(HandshakeError::SessionRejected);
        assert_eq!(err.status().as_u16(), PROXY_REJECT_STATUS);
    }

    #[test]
    fn other_handshake_failures_are_bad_gateway() {
        let err = SignalError::from(HandshakeError::Http {
            phase: 1,
            status: 500,
        });
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("phase 1"));
    }
}
