//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`AppError`]: failures of the plain HTTP routes. They implement actix's
//!   `ResponseError`, so a handler can return `Result<HttpResponse, AppError>`
//!   and the client gets a JSON body with a matching status code.
//! - [`RelayError`]: reasons a relay session could not be established. A session
//!   has no HTTP response to speak of once the socket is upgraded, so each variant
//!   maps to the WebSocket close code the browser receives instead.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "No route for GET /nope",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::relay::frame::CloseNotice;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Client sent a request we cannot serve (e.g. a broken WebSocket upgrade)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::BadRequest(msg) | AppError::NotFound(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Why a relay session could not be opened or kept alive.
///
/// None of these are retried; every variant ends the session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream credential is not configured")]
    MissingCredential,

    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    #[error("upstream refused the credential (HTTP {0})")]
    Unauthorized(u16),

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("upstream rejected session setup: {0}")]
    SetupRejected(String),

    #[error("upstream did not acknowledge setup within {0:?}")]
    SetupTimeout(Duration),

    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimit(usize),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl RelayError {
    /// Close code and reason reported to the browser.
    pub fn close_notice(&self) -> CloseNotice {
        let code = match self {
            RelayError::MissingCredential
            | RelayError::Unauthorized(_)
            | RelayError::SetupRejected(_) => CloseNotice::POLICY,
            RelayError::SessionLimit(_) => CloseNotice::TRY_AGAIN_LATER,
            RelayError::InvalidUrl(_)
            | RelayError::Connect(_)
            | RelayError::ConnectTimeout(_)
            | RelayError::SetupTimeout(_)
            | RelayError::Upstream(_) => CloseNotice::INTERNAL_ERROR,
        };
        CloseNotice::new(code, self.to_string())
    }
}
