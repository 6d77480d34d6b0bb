//! Error types for the detection engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::alert::TransitionError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Detection engine error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid MSISDN: {0}")]
    InvalidMsisdn(#[from] acm_core::MsisdnError),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("Alert is already {0}")]
    AlreadyInState(crate::alert::AlertStatus),

    #[error("Illegal alert transition from {from} on {command}")]
    IllegalTransition { from: crate::alert::AlertStatus, command: &'static str },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("SBC timeout: {0}")]
    SbcTimeout(String),

    #[error("SBC transport error: {0}")]
    SbcTransport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TransitionError> for Error {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::AlreadyInState(status) => Error::AlreadyInState(status),
            TransitionError::IllegalTransition { from, command } => {
                Error::IllegalTransition { from, command }
            }
        }
    }
}

impl Error {
    fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) | Error::InvalidMsisdn(_) => "validation_error",
            Error::NotFound(_, _) => "not_found",
            Error::AlreadyInState(_) => "already_in_state",
            Error::IllegalTransition { .. } => "illegal_transition",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::Store(_) => "store_error",
            Error::SbcTimeout(_) => "sbc_timeout",
            Error::SbcTransport(_) => "sbc_transport_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidRequest(_) | Error::InvalidMsisdn(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_, _) => StatusCode::NOT_FOUND,
            Error::AlreadyInState(_) | Error::IllegalTransition { .. } => StatusCode::CONFLICT,
            Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::SbcTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::SbcTransport(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) | Error::Internal(_) => {
                tracing::error!("Internal error: {:?}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
