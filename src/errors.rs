use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use thiserror::Error;

/// Classified outcome of an upstream call. The bridge relays upstream errors
/// without reinterpreting them, so both transport-level and business-level
/// failures keep the exact status/content-type/body that came off the wire.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Structured error returned by the homeserver with its own code/message.
    #[error("upstream error {status}: {code} {message}")]
    Business {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
        code: String,
        message: String,
    },
    /// Non-2xx response with no decodable error structure, or a network-level
    /// failure before any response was received (status 502, empty body).
    #[error("upstream transport failure ({status})")]
    Transport {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },
    /// Condition the bridge itself cannot classify: undecodable 2xx body,
    /// missing resumption token. Rendered as a fixed generic failure.
    #[error("internal bridge failure: {0}")]
    Internal(String),
}

const INTERNAL_BODY: &[u8] = b"internal bridge error";

impl SyncError {
    pub fn internal(reason: impl Into<String>) -> Self {
        SyncError::Internal(reason.into())
    }

    /// Map this failure to the (status, content-type, body) triple written to
    /// the client. Business and Transport pass the upstream triple through
    /// verbatim; Internal never leaks diagnostic detail.
    pub fn classify(&self) -> (StatusCode, Option<&str>, Bytes) {
        match self {
            SyncError::Business {
                status,
                content_type,
                body,
                ..
            }
            | SyncError::Transport {
                status,
                content_type,
                body,
            } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                content_type.as_deref(),
                body.clone(),
            ),
            SyncError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("text/plain; charset=utf-8"),
                Bytes::from_static(INTERNAL_BODY),
            ),
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, content_type, body) = self.classify();
        let mut builder = Response::builder().status(status);
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder
            .body(axum::body::Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
