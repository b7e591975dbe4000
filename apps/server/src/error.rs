use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application error taxonomy. Each variant carries a stable `code` that
/// clients branch on; the HTTP status tells retry semantics (4xx terminal
/// for the attempt, 5xx retry-safe).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("customer name and phone are required")]
    ContactRequired,

    #[error("consent to the booking terms is required")]
    ConsentRequired,

    #[error("the requested slot is no longer available")]
    SlotTaken,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("invalid webhook signature")]
    BadSignature,

    #[error("payment does not correlate with this reservation")]
    CorrelationMismatch,

    #[error("reservation cannot move from '{from}' to '{to}'")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("database error")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::ContactRequired | Self::ConsentRequired => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::SlotTaken | Self::IllegalTransition { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized | Self::BadSignature => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::CorrelationMismatch => StatusCode::BAD_REQUEST,
            Self::Db(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ContactRequired => "CONTACT_REQUIRED",
            Self::ConsentRequired => "CONSENT_REQUIRED",
            Self::SlotTaken => "SLOT_TAKEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::CorrelationMismatch => "CORRELATION_MISMATCH",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::Db(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error body in the same envelope shape as `ApiResponse`, plus the code.
#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }

        // Internal details stay in the log, not the response
        let message = if status.is_server_error() {
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorBody {
            ok: false,
            error: message,
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}
