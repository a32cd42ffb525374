//! Room Controller error types.
//!
//! Errors map to signaling `ErrorCode` values for peer responses and to
//! HTTP status codes for the admin surface. Internal details are logged
//! server-side but not exposed to clients.

use crate::media::EngineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::types::{ConsumerId, PeerId, ProducerId};
use serde::Serialize;
use signaling_protocol::{ErrorBody, ErrorCode};
use thiserror::Error;

/// Room Controller error type.
///
/// Maps to signaling `ErrorCode` values:
/// - `BadRequest`: `BAD_REQUEST`
/// - `*NotFound`, closed transports: `NOT_FOUND`
/// - `Conflict`, `TransportNotConnected`, `RoomFull`, `Draining`: `CONFLICT`
/// - `Incompatible`: `INCOMPATIBLE`
/// - `AlreadyConsuming`: `ALREADY_CONSUMING`
/// - `SelfConsume`, `Forbidden`, `InvalidToken`: `FORBIDDEN`
/// - `Internal`, `RoomCreation`, engine failures: `INTERNAL_ERROR`
#[derive(Debug, Error)]
pub enum RcError {
    /// Room reached its configured peer capacity.
    #[error("Room is full: {0}")]
    RoomFull(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Router assignment for a new room failed.
    #[error("Room creation failed: {0}")]
    RoomCreation(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// The peer has no transport in the requested slot.
    #[error("{0} transport not found")]
    TransportNotFound(&'static str),

    #[error("{0} transport not connected")]
    TransportNotConnected(&'static str),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// A consumer for this producer exists or is being created.
    #[error("Already consuming producer {0}")]
    AlreadyConsuming(ProducerId),

    #[error("Cannot consume own producer {0}")]
    SelfConsume(ProducerId),

    /// Receiving capabilities cannot handle the producer's codec.
    #[error("Incompatible capabilities for producer {0}")]
    Incompatible(ProducerId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Controller is shutting down.
    #[error("Room controller is draining")]
    Draining,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RcError {
    /// Returns the signaling `ErrorCode` for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RcError::BadRequest(_) => ErrorCode::BadRequest,
            RcError::RoomNotFound(_)
            | RcError::PeerNotFound(_)
            | RcError::TransportNotFound(_)
            | RcError::ProducerNotFound(_)
            | RcError::ConsumerNotFound(_) => ErrorCode::NotFound,
            RcError::Conflict(_)
            | RcError::TransportNotConnected(_)
            | RcError::RoomFull(_)
            | RcError::Draining => ErrorCode::Conflict,
            RcError::Incompatible(_) => ErrorCode::Incompatible,
            RcError::AlreadyConsuming(_) => ErrorCode::AlreadyConsuming,
            RcError::SelfConsume(_) | RcError::Forbidden(_) | RcError::InvalidToken(_) => {
                ErrorCode::Forbidden
            }
            RcError::Engine(e) => match e {
                EngineError::ProducerNotFound(_) | EngineError::TransportClosed => {
                    ErrorCode::NotFound
                }
                EngineError::CannotConsume(_) => ErrorCode::Incompatible,
                EngineError::AlreadyConnected => ErrorCode::Conflict,
                EngineError::InvalidParameters(_) => ErrorCode::BadRequest,
                EngineError::WorkerClosed | EngineError::RouterClosed | EngineError::Failed(_) => {
                    ErrorCode::InternalError
                }
            },
            RcError::RoomCreation(_) | RcError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RcError::RoomCreation(_) | RcError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            RcError::Engine(e) => match e {
                EngineError::ProducerNotFound(_) => "Producer not found".to_string(),
                EngineError::TransportClosed => "Transport is closed".to_string(),
                EngineError::CannotConsume(_) => "Cannot consume".to_string(),
                EngineError::AlreadyConnected => "Transport already connected".to_string(),
                EngineError::InvalidParameters(reason) => reason.clone(),
                EngineError::WorkerClosed | EngineError::RouterClosed | EngineError::Failed(_) => {
                    "An internal error occurred".to_string()
                }
            },
            RcError::RoomFull(_) => "Room is full".to_string(),
            RcError::RoomNotFound(_) => "Room not found".to_string(),
            RcError::PeerNotFound(_) => "Peer not found".to_string(),
            RcError::ProducerNotFound(_) => "Producer not found".to_string(),
            RcError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            RcError::AlreadyConsuming(_) => "Already consuming producer".to_string(),
            RcError::SelfConsume(_) => "Cannot consume own producer".to_string(),
            RcError::Incompatible(_) => "Cannot consume".to_string(),
            RcError::Draining => "Server is shutting down, please reconnect".to_string(),
            RcError::InvalidToken(_) => "Invalid or expired token".to_string(),
            RcError::TransportNotFound(_)
            | RcError::TransportNotConnected(_)
            | RcError::Conflict(_)
            | RcError::BadRequest(_)
            | RcError::Forbidden(_) => self.to_string(),
        }
    }

    /// Error body carried on a signaling response.
    #[must_use]
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.error_code(), self.client_message())
    }

    /// Returns the HTTP status code for this error (admin surface).
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            RcError::InvalidToken(_) => return StatusCode::UNAUTHORIZED,
            RcError::Draining => return StatusCode::SERVICE_UNAVAILABLE,
            _ => {}
        }
        match self.error_code() {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict | ErrorCode::AlreadyConsuming => StatusCode::CONFLICT,
            ErrorCode::Incompatible => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::InternalError | ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: ErrorCode,
    message: String,
}

impl IntoResponse for RcError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Log actual error server-side, return generic message to client
            tracing::error!(target: "rc.admin", error = %self, "Admin request failed");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(body)).into_response();

        // Add WWW-Authenticate header for 401 responses
        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) =
                "Bearer realm=\"huddle-admin\", error=\"invalid_token\"".parse()
            {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}
