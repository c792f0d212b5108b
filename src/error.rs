//! Central application error type and its RFC-7807 Problem Details mapping.
//!
//! Generalizes the teacher's per-service `thiserror::Error` enums
//! (`SettlementError`, `OracleError`) into the one cross-cutting type the
//! HTTP layer needs, the way `utils::response::AppError` used to sit at the
//! axum boundary there.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The request body or query string did not parse into the expected
    /// shape at all (bad JSON, wrong field types, unparsable query params).
    /// Kept distinct from `Validation` — §6 calls this out as 422 on a
    /// per-endpoint basis while §7's general taxonomy folds "malformed
    /// input" into the same 400 bucket as semantic validation failures.
    /// Reconciled here by reserving 422 for "didn't parse" and 400 for
    /// "parsed fine, but fails a constraint" (see DESIGN.md).
    #[error("{0}")]
    Malformed(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    BusinessValidation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PaymentFailed(String),

    #[error("{0}")]
    PaymentUnavailable(String),

    #[error("internal error")]
    Internal(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Other(#[source] anyhow::Error),
}

impl AppError {
    fn kind(&self) -> ErrorKind {
        match self {
            AppError::Malformed(_) => ErrorKind::Malformed,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::BusinessValidation(_) => ErrorKind::BusinessValidation,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::PaymentFailed(_) => ErrorKind::PaymentFailed,
            AppError::PaymentUnavailable(_) => ErrorKind::PaymentUnavailable,
            AppError::Internal(_) | AppError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Low-cardinality label for the `orders_rejected_total` metric.
    pub fn metric_reason(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Malformed => "malformed",
            ErrorKind::Validation => "validation",
            ErrorKind::BusinessValidation => "business_validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PaymentFailed => "payment_failed",
            ErrorKind::PaymentUnavailable => "payment_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ErrorKind {
    Malformed,
    Validation,
    BusinessValidation,
    NotFound,
    Conflict,
    PaymentFailed,
    PaymentUnavailable,
    Internal,
}

impl ErrorKind {
    fn status(self) -> StatusCode {
        match self {
            ErrorKind::Malformed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Validation | ErrorKind::BusinessValidation | ErrorKind::PaymentFailed => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::PaymentUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn type_uri(self) -> &'static str {
        match self {
            ErrorKind::Malformed => "/errors/malformed-request",
            ErrorKind::Validation => "/errors/validation-error",
            ErrorKind::BusinessValidation => "/errors/business-validation-error",
            ErrorKind::NotFound => "/errors/resource-not-found",
            ErrorKind::Conflict => "/errors/conflict",
            ErrorKind::PaymentFailed => "/errors/payment-failed",
            ErrorKind::PaymentUnavailable => "/errors/payment-unavailable",
            ErrorKind::Internal => "/errors/internal-error",
        }
    }

    fn title(self) -> &'static str {
        match self {
            ErrorKind::Malformed => "Unprocessable Entity",
            ErrorKind::Validation => "Bad Request",
            ErrorKind::BusinessValidation => "Business Rule Violation",
            ErrorKind::NotFound => "Resource Not Found",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::PaymentFailed => "Payment Failed",
            ErrorKind::PaymentUnavailable => "External Service Unavailable",
            ErrorKind::Internal => "Internal Server Error",
        }
    }
}

/// RFC-7807 Problem Details body.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
}

/// Wraps an [`AppError`] together with the request path it occurred on, so
/// `instance` can be populated per §6. Handlers fetch the path via axum's
/// `OriginalUri` extractor and attach it through [`AppError::into_problem`]
/// (or [`AppError::into_problem_at`] when only the path string is at hand,
/// as in the custom extractors in `api::extract`).
impl AppError {
    pub fn into_problem(self, instance: &Uri) -> Response {
        self.into_problem_at(instance.path())
    }

    pub fn into_problem_at(self, path: &str) -> Response {
        let kind = self.kind();
        tracing::error!(error = %self, kind = ?kind, "request failed");
        let body = ProblemDetails {
            type_uri: kind.type_uri().to_string(),
            title: kind.title().to_string(),
            status: kind.status().as_u16(),
            detail: self.to_string(),
            instance: path.to_string(),
        };
        (kind.status(), Json(body)).into_response()
    }
}

/// Fallback `IntoResponse` for contexts without access to the request URI
/// (e.g. the background worker's own error logging path is not through
/// axum at all). `instance` is left empty in that case.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        tracing::error!(error = %self, kind = ?kind, "request failed");
        let body = ProblemDetails {
            type_uri: kind.type_uri().to_string(),
            title: kind.title().to_string(),
            status: kind.status().as_u16(),
            detail: self.to_string(),
            instance: String::new(),
        };
        (kind.status(), Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Malformed(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Malformed(rejection.body_text())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Runs a handler body and turns its error, if any, into a Problem Details
/// response carrying `instance` — the common shape every handler in
/// `api::handlers` returns through.
pub fn respond<T: IntoResponse>(uri: &Uri, result: AppResult<T>) -> Response {
    match result {
        Ok(value) => value.into_response(),
        Err(err) => err.into_problem(uri),
    }
}
