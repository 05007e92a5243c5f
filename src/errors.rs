use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

/// Message shown for every signature-related rejection. The precise reason
/// only goes to the security log.
pub const PAYMENT_NOT_VERIFIED: &str = "Payment could not be verified";

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Conflict",
    "code": "out_of_stock",
    "message": "Out of stock: only 1 more available",
    "details": {"product_id": "550e8400-e29b-41d4-a716-446655440000", "remaining": 1},
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Structured context, e.g. the remaining stock for `out_of_stock`
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Out of stock: only {remaining} more available")]
    OutOfStock { product_id: Uuid, remaining: i32 },

    #[error("Order {0} has no payable items")]
    EmptyOrder(Uuid),

    #[error("Order {order_id} has a non-positive total")]
    InvalidOrderAmount { order_id: Uuid },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidWebhookSignature(String),

    #[error("Amount mismatch for order {order_id}: expected {expected}, reported {reported}")]
    AmountMismatch {
        order_id: Uuid,
        expected: i64,
        reported: i64,
    },

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::BadRequest(_)
            | Self::SignatureMismatch(_)
            | Self::InvalidWebhookSignature(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::OutOfStock { .. } | Self::InvalidStatus(_) => StatusCode::CONFLICT,
            Self::EmptyOrder(_) | Self::InvalidOrderAmount { .. } | Self::AmountMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::OutOfStock { .. } => "out_of_stock",
            Self::EmptyOrder(_) => "empty_order",
            Self::InvalidOrderAmount { .. } => "invalid_order_amount",
            Self::InvalidStatus(_) => "invalid_status",
            Self::GatewayUnavailable(_) => "gateway_unavailable",
            Self::SignatureMismatch(_) => "signature_mismatch",
            Self::InvalidWebhookSignature(_) => "invalid_webhook_signature",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::ExternalServiceError(_) => "external_service_error",
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                "internal_error"
            }
        }
    }

    /// Whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_) | Self::DatabaseError(_))
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors and signature failures return generic messages.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::SignatureMismatch(_)
            | Self::InvalidWebhookSignature(_)
            | Self::AmountMismatch { .. } => PAYMENT_NOT_VERIFIED.to_string(),
            Self::GatewayUnavailable(_) => {
                "Payment gateway is temporarily unavailable, please retry".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Structured details for variants that carry client-actionable data.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::OutOfStock {
                product_id,
                remaining,
            } => Some(json!({ "product_id": product_id, "remaining": remaining })),
            Self::EmptyOrder(order_id) | Self::InvalidOrderAmount { order_id } => {
                Some(json!({ "order_id": order_id }))
            }
            Self::GatewayUnavailable(_) => Some(json!({ "retryable": true })),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
