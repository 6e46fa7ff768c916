//! Authentication failure types.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Transport-level category of an authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Unauthorized,
    BadRequest,
    Internal,
}

/// Why credential resolution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No credential source produced anything
    MissingCredential,
    /// Session token signature is valid but it has expired
    TokenExpired,
    /// Session token could not be verified
    TokenMalformed,
    /// Session token verified but lacks identity claims
    InvalidPayload,
    /// Ticket unknown, expired, or scoped to another resource
    TicketRejected,
    /// Ticket presented on a path that is not a streaming resource
    TicketPathUnrecognized,
    /// Verification failed for an unexpected reason
    Internal,
}

impl AuthFailure {
    pub fn category(&self) -> FailureCategory {
        match self {
            AuthFailure::MissingCredential
            | AuthFailure::TokenExpired
            | AuthFailure::TokenMalformed
            | AuthFailure::InvalidPayload
            | AuthFailure::TicketRejected => FailureCategory::Unauthorized,
            AuthFailure::TicketPathUnrecognized => FailureCategory::BadRequest,
            AuthFailure::Internal => FailureCategory::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.category() {
            FailureCategory::Unauthorized => StatusCode::UNAUTHORIZED,
            FailureCategory::BadRequest => StatusCode::BAD_REQUEST,
            FailureCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredential => "missing credential",
            AuthFailure::TokenExpired => "token expired",
            AuthFailure::TokenMalformed => "invalid token",
            AuthFailure::InvalidPayload => "invalid token payload",
            AuthFailure::TicketRejected => "invalid or expired ticket",
            AuthFailure::TicketPathUnrecognized => "ticket is not valid for this path",
            AuthFailure::Internal => "authentication failed",
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for AuthFailure {}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
        }

        (
            self.status_code(),
            Json(ErrorResponse {
                error: self.message(),
            }),
        )
            .into_response()
    }
}
