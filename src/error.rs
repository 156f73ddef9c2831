//! Gateway error taxonomy.
//! Mission: one typed enum at the HTTP edge, `anyhow` everywhere internal.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// Errors surfaced to the UI across every component boundary.
#[derive(Debug)]
pub enum GatewayError {
    NotInitialized,
    ValidationError { field: String, reason: String },
    PrecisionError(String),
    PriceDeviation {
        order_price: String,
        market_price: String,
        deviation: f64,
        suggested_price: String,
    },
    TwapSizeTooSmall(String),
    TwapDurationOutOfRange(String),
    TwapIntervalsOutOfRange(String),
    TwapNotFound(u64),
    TwapNotActive(u64),
    TwapFirstOrderFailed(String),
    InvalidPrice(String),
    OrderTooLarge(String),
    InsufficientBalance(String),
    Upstream {
        original_message: String,
        mapped_message: Option<String>,
    },
}

impl GatewayError {
    /// Map a raw upstream error string to a stable, user-readable taxonomy.
    ///
    /// The first three variants below are substring-matched against the
    /// upstream's free-text error; anything else passes through as `Upstream`.
    pub fn from_upstream(original: impl Into<String>) -> Self {
        let original = original.into();
        let lower = original.to_lowercase();
        if lower.contains("price") && (lower.contains("deviat") || lower.contains("far")) {
            return GatewayError::InvalidPrice(original);
        }
        if lower.contains("too large") || lower.contains("order too big") {
            return GatewayError::OrderTooLarge(original);
        }
        if lower.contains("insufficient") || lower.contains("not enough margin") {
            return GatewayError::InsufficientBalance(original);
        }
        GatewayError::Upstream {
            mapped_message: None,
            original_message: original,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::NotInitialized => write!(f, "service booted without upstream"),
            GatewayError::ValidationError { field, reason } => {
                write!(f, "validation error on {field}: {reason}")
            }
            GatewayError::PrecisionError(msg) => write!(f, "precision error: {msg}"),
            GatewayError::PriceDeviation { deviation, .. } => {
                write!(f, "price deviates {:.1}% from market", deviation * 100.0)
            }
            GatewayError::TwapSizeTooSmall(msg) => write!(f, "twap size too small: {msg}"),
            GatewayError::TwapDurationOutOfRange(msg) => {
                write!(f, "twap duration out of range: {msg}")
            }
            GatewayError::TwapIntervalsOutOfRange(msg) => {
                write!(f, "twap intervals out of range: {msg}")
            }
            GatewayError::TwapNotFound(id) => write!(f, "twap task {id} not found"),
            GatewayError::TwapNotActive(id) => write!(f, "twap task {id} is not active"),
            GatewayError::TwapFirstOrderFailed(msg) => {
                write!(f, "first twap sub-order failed: {msg}")
            }
            GatewayError::InvalidPrice(msg) => write!(f, "invalid price: {msg}"),
            GatewayError::OrderTooLarge(msg) => write!(f, "order too large: {msg}"),
            GatewayError::InsufficientBalance(msg) => write!(f, "insufficient balance: {msg}"),
            GatewayError::Upstream { original_message, .. } => {
                write!(f, "upstream error: {original_message}")
            }
        }
    }
}

impl std::error::Error for GatewayError {}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind, details): (StatusCode, &'static str, Option<serde_json::Value>) =
            match &self {
                GatewayError::NotInitialized => {
                    (StatusCode::SERVICE_UNAVAILABLE, "not_initialized", None)
                }
                GatewayError::ValidationError { field, reason } => (
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    Some(json!({ "field": field, "reason": reason })),
                ),
                GatewayError::PrecisionError(_) => {
                    (StatusCode::BAD_REQUEST, "precision_error", None)
                }
                GatewayError::PriceDeviation {
                    order_price,
                    market_price,
                    deviation,
                    suggested_price,
                } => (
                    StatusCode::BAD_REQUEST,
                    "price_deviation",
                    Some(json!({
                        "orderPrice": order_price,
                        "marketPrice": market_price,
                        "deviation": deviation,
                        "suggestedPrice": suggested_price,
                    })),
                ),
                GatewayError::TwapSizeTooSmall(_) => {
                    (StatusCode::BAD_REQUEST, "twap_size_too_small", None)
                }
                GatewayError::TwapDurationOutOfRange(_) => {
                    (StatusCode::BAD_REQUEST, "twap_duration_out_of_range", None)
                }
                GatewayError::TwapIntervalsOutOfRange(_) => {
                    (StatusCode::BAD_REQUEST, "twap_intervals_out_of_range", None)
                }
                GatewayError::TwapNotFound(_) => (StatusCode::NOT_FOUND, "twap_not_found", None),
                GatewayError::TwapNotActive(_) => {
                    (StatusCode::CONFLICT, "twap_not_active", None)
                }
                GatewayError::TwapFirstOrderFailed(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "twap_first_order_failed",
                    None,
                ),
                GatewayError::InvalidPrice(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_price", None)
                }
                GatewayError::OrderTooLarge(_) => {
                    (StatusCode::BAD_REQUEST, "order_too_large", None)
                }
                GatewayError::InsufficientBalance(_) => {
                    (StatusCode::BAD_REQUEST, "insufficient_balance", None)
                }
                GatewayError::Upstream { .. } => (StatusCode::BAD_GATEWAY, "upstream_error", None),
            };

        tracing::warn!(kind, error = %self, "request failed");

        let body = ErrorBody {
            error: kind,
            message: self.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}
