//! Payment types and data structures

use crate::money::{Currency, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Canonical, provider-neutral payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    RequiresAction,
    Authorized,
    Captured,
    PartiallyRefunded,
    Refunded,
    Canceled,
    Errored,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RequiresAction => "requires_action",
            Self::Authorized => "authorized",
            Self::Captured => "captured",
            Self::PartiallyRefunded => "partially_refunded",
            Self::Refunded => "refunded",
            Self::Canceled => "canceled",
            Self::Errored => "errored",
        }
    }

    /// Funds have been taken from the payer
    pub fn is_captured(&self) -> bool {
        matches!(self, Self::Captured | Self::PartiallyRefunded | Self::Refunded)
    }

    /// No further forward movement is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Refunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical operations the order subsystem can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOperation {
    Initiate,
    Update,
    Authorize,
    Capture,
    Cancel,
    Refund,
}

impl fmt::Display for PaymentOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initiate => "initiate",
            Self::Update => "update",
            Self::Authorize => "authorize",
            Self::Capture => "capture",
            Self::Cancel => "cancel",
            Self::Refund => "refund",
        })
    }
}

/// The failed transition recorded while a session is `errored`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    /// Operation that failed
    pub operation: PaymentOperation,
    /// Status the session had before the failure
    pub previous_status: PaymentStatus,
    /// Error code (see `PaymentError::code`)
    pub code: String,
    /// Operational detail, never shown to the shopper
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// One payment attempt tied to an order or cart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    /// Reference assigned by the order subsystem
    pub id: String,
    /// Identifier of the owning adapter
    pub provider_id: String,
    /// Provider order id, set once by a successful initiation
    pub gateway_reference: Option<String>,
    /// Cart/order reference forwarded to the gateway
    pub resource_id: String,
    pub amount: Money,
    pub status: PaymentStatus,
    pub captured_amount: i64,
    pub refunded_amount: i64,
    pub capture_id: Option<String>,
    /// Gateway refund ids already counted in `refunded_amount`
    pub refund_ids: Vec<String>,
    pub last_error: Option<SessionError>,
    /// Gateway payloads kept verbatim for support and audit
    pub raw_provider_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentSession {
    /// Create a fresh pending session
    pub fn new(
        id: impl Into<String>,
        provider_id: impl Into<String>,
        resource_id: impl Into<String>,
        amount: Money,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            gateway_reference: None,
            resource_id: resource_id.into(),
            amount,
            status: PaymentStatus::Pending,
            captured_amount: 0,
            refunded_amount: 0,
            capture_id: None,
            refund_ids: Vec::new(),
            last_error: None,
            raw_provider_data: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn currency(&self) -> Currency {
        self.amount.currency
    }

    /// Status the transition table is evaluated against. An errored session
    /// behaves as the status it failed from.
    pub fn effective_status(&self) -> PaymentStatus {
        match (&self.status, &self.last_error) {
            (PaymentStatus::Errored, Some(err)) => err.previous_status,
            (status, _) => *status,
        }
    }

    /// Captured funds not yet refunded
    pub fn refundable_amount(&self) -> i64 {
        self.captured_amount - self.refunded_amount
    }

    /// Store a gateway payload under `key`
    pub fn record_raw(&mut self, key: &str, value: Value) {
        self.raw_provider_data.insert(key.to_string(), value);
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Request to start a payment for an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePaymentRequest {
    /// Session reference assigned by the order subsystem
    pub session_id: String,
    /// Amount in minor units
    pub amount: Money,
    /// Cart or order the payment belongs to
    pub resource_id: String,
}

impl InitiatePaymentRequest {
    pub fn new(
        session_id: impl Into<String>,
        amount: Money,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            amount,
            resource_id: resource_id.into(),
        }
    }
}

/// Order data as reported by a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOrder {
    /// Provider order id
    pub gateway_reference: String,
    /// Provider status vocabulary ("CREATED", "APPROVED", ...)
    pub gateway_status: String,
    /// First capture on the order, if any
    pub capture_id: Option<String>,
    /// Captured amount reported for that capture
    pub captured_amount: Option<Money>,
    pub raw: Value,
}

/// Result of capturing an order
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub capture_id: String,
    pub gateway_status: String,
    /// Amount the gateway reports as captured, when present
    pub amount: Option<Money>,
    pub raw: Value,
}

/// Result of refunding a capture
#[derive(Debug, Clone, PartialEq)]
pub struct RefundResult {
    pub refund_id: String,
    pub gateway_status: String,
    pub raw: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session() {
        let session = PaymentSession::new("ps_1", "paypal", "cart_1", Money::usd(5000));
        assert_eq!(session.status, PaymentStatus::Pending);
        assert_eq!(session.gateway_reference, None);
        assert_eq!(session.refundable_amount(), 0);
    }

    #[test]
    fn test_effective_status_of_errored_session() {
        let mut session = PaymentSession::new("ps_1", "paypal", "cart_1", Money::usd(5000));
        session.status = PaymentStatus::Errored;
        session.last_error = Some(SessionError {
            operation: PaymentOperation::Capture,
            previous_status: PaymentStatus::Authorized,
            code: "gateway_unavailable".into(),
            message: "timeout".into(),
            occurred_at: Utc::now(),
        });
        assert_eq!(session.effective_status(), PaymentStatus::Authorized);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&PaymentStatus::PartiallyRefunded).unwrap(),
            "\"partially_refunded\""
        );
        assert!(PaymentStatus::Refunded.is_captured());
        assert!(!PaymentStatus::Authorized.is_terminal());
    }
}
