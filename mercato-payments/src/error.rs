//! Error types for payment processing

use crate::types::{PaymentOperation, PaymentStatus};
use thiserror::Error;

/// Payment error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// Missing or invalid provider configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Gateway refused our credentials, even after a token refresh
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Transport failure, timeout or 5xx. The gateway-side outcome is unknown.
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Gateway rejected the request (4xx)
    #[error("Gateway rejected request ({status}): {message}")]
    GatewayRejected {
        /// HTTP status returned by the gateway
        status: u16,
        /// Gateway-provided issue or message
        message: String,
    },

    /// Gateway has no such object
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not legal in the session's current status
    #[error("Cannot {operation} a payment in status {status}")]
    InvalidTransition {
        operation: PaymentOperation,
        status: PaymentStatus,
    },

    /// Capture attempted before the payer approved the payment
    #[error("Payment is not authorized")]
    NotAuthorized,

    /// Cancel attempted after funds were captured
    #[error("Payment already captured")]
    AlreadyCaptured,

    /// Refund larger than what remains of the capture
    #[error("Refund of {requested} exceeds remaining captured amount {available}")]
    InsufficientCaptureAmount { requested: i64, available: i64 },

    /// Invalid amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid webhook signature
    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,

    /// No adapter registered under this identifier
    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    /// No session with this id
    #[error("Payment session not found: {0}")]
    SessionNotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PaymentError {
    /// Build a rejection from a gateway status code and message.
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::GatewayRejected {
            status,
            message: message.into(),
        }
    }

    /// The outcome may have succeeded on the gateway; poll before retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_))
    }

    /// Whether a gateway mutation failing with this error leaves the
    /// session in `errored`.
    pub fn marks_session_errored(&self) -> bool {
        matches!(
            self,
            Self::GatewayUnavailable(_) | Self::GatewayRejected { .. } | Self::NotFound(_)
        )
    }

    /// Short machine-readable code stored alongside the session.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::GatewayUnavailable(_) => "gateway_unavailable",
            Self::GatewayRejected { .. } => "gateway_rejected",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotAuthorized => "not_authorized",
            Self::AlreadyCaptured => "already_captured",
            Self::InsufficientCaptureAmount { .. } => "insufficient_capture_amount",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidWebhookSignature => "invalid_webhook_signature",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Text safe to show the shopper. Operational detail stays in
    /// `raw_provider_data`.
    pub fn customer_message(&self) -> &'static str {
        match self {
            Self::GatewayUnavailable(_) => {
                "We could not confirm your payment yet. Please check your order status shortly."
            }
            Self::InvalidAmount(_) | Self::InsufficientCaptureAmount { .. } => {
                "The payment amount is not valid."
            }
            _ => "Your payment could not be processed. Please try another payment method.",
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PaymentError::GatewayUnavailable(format!("request timed out: {}", err))
        } else if err.is_decode() {
            PaymentError::Serialization(err.to_string())
        } else {
            PaymentError::GatewayUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        PaymentError::Serialization(err.to_string())
    }
}

/// Result type for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;
