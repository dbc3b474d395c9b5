use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::response::{ApiResponse, Meta};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not Found")]
    NotFound,

    #[error("Bad Request {0}")]
    BadRequest(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Only {available} items available in stock")]
    StockExceeded { available: i32 },

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Payment record not found")]
    PaymentRecordNotFound,

    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Cart merge conflicted with a concurrent update, retry")]
    MergeConflict,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error")]
    DbError(#[from] sqlx::Error),

    #[error("ORM error")]
    OrmError(#[from] sea_orm::DbErr),

    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Conflicts from lock contention or lost races are safe for the caller
    /// to retry as-is; validation and not-found errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::MergeConflict | AppError::Conflict(_) | AppError::GatewayUnavailable(_)
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound | AppError::PaymentRecordNotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::InvalidQuantity(_) | AppError::EmptyCart => {
                StatusCode::BAD_REQUEST
            }
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            AppError::StockExceeded { .. } | AppError::MergeConflict | AppError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            AppError::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::DbError(_) | AppError::OrmError(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorData {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    available: Option<i32>,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }

        let available = match &self {
            AppError::StockExceeded { available } => Some(*available),
            _ => None,
        };

        let body = ApiResponse {
            message: self.to_string(),
            data: Some(ErrorData {
                error: self.to_string(),
                available,
                retryable: self.is_retryable(),
            }),
            meta: Some(Meta::empty()),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
