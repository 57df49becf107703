//! HTTP mapping of [`StorefrontError`].

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::StorefrontError;

impl StorefrontError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidQuantity | Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ProductNotFound { .. } | Self::OrderNotFound | Self::LineItemNotFound => StatusCode::NOT_FOUND,
            Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            Self::OrderNotEditable | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::ConcurrentModification => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) if self.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidQuantity => "invalid_quantity",
            Self::ProductNotFound { .. } => "product_not_found",
            Self::OrderNotFound => "order_not_found",
            Self::LineItemNotFound => "line_item_not_found",
            Self::InvalidSignature => "invalid_signature",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::ConcurrentModification => "concurrent_modification",
            Self::OrderNotEditable => "order_not_editable",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Validation(_) => "validation_failed",
            Self::Config(_) | Self::Database(_) | Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for StorefrontError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() && !self.is_retryable() {
            tracing::error!(error = %self, "request failed");
            "An internal error occurred".to_string()
        } else if let Self::Database(_) = self {
            tracing::error!(error = %self, "database error");
            "Temporary storage failure, retry later".to_string()
        } else {
            tracing::debug!(error = %self, code = self.code(), "request rejected");
            self.to_string()
        };

        let body = Json(json!({ "error": self.code(), "message": message, "retryable": self.is_retryable() }));
        let mut response = (status, body).into_response();
        if self.is_retryable() {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::OrderStatus;

    #[test]
    fn test_status_mapping() {
        assert_eq!(StorefrontError::InvalidSignature.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(StorefrontError::OrderNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(StorefrontError::ConcurrentModification.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            StorefrontError::InvalidTransition { from: OrderStatus::Delivered, to: OrderStatus::Cancelled }.status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_retryable_response_has_retry_after() {
        let resp = StorefrontError::ConcurrentModification.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "1");

        let resp = StorefrontError::InvalidSignature.into_response();
        assert!(resp.headers().get(header::RETRY_AFTER).is_none());

        let resp = StorefrontError::Database(sqlx::Error::PoolTimedOut).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "1");

        let resp = StorefrontError::Database(sqlx::Error::RowNotFound).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.headers().get(header::RETRY_AFTER).is_none());
    }
}
