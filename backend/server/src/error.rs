use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{database::StoreError, payments::PaymentError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload(String),

    #[error("Invalid input")]
    InvalidInput(String),

    #[error("Invalid webhook signature")]
    InvalidSignature(String),

    #[error("Order not found")]
    NotFound(String),

    #[error("Order conflict")]
    Conflict(String),

    #[error("Payment processing failed")]
    Payment(#[from] PaymentError),

    #[error("Database error")]
    Store(StoreError),

    #[error("Internal error")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedPayload(_) | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Payment(_) | AppError::Store(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn details(&self) -> String {
        match self {
            AppError::MalformedPayload(details)
            | AppError::InvalidInput(details)
            | AppError::InvalidSignature(details)
            | AppError::NotFound(details)
            | AppError::Conflict(details)
            | AppError::Internal(details) => details.clone(),
            AppError::Payment(e) => e.to_string(),
            AppError::Store(e) => e.to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => AppError::NotFound(e.to_string()),
            StoreError::Conflict { .. } | StoreError::SignatureInUse(_) => {
                AppError::Conflict(e.to_string())
            }
            other => AppError::Store(other),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::MalformedPayload(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, details = %self.details(), "Request failed");
        }

        let body = json!({
            "error": self.to_string(),
            "details": self.details(),
        });

        (status, Json(body)).into_response()
    }
}
