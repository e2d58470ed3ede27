//! In-process provider for manual and test payments
//!
//! Orders are approved on creation and captures settle immediately. Status
//! notifications are HMAC-SHA256 signed in the `t=<unix>,v1=<hex>` form and
//! carried in the `x-mercato-signature` header.

use crate::{
    config::ManualConfig,
    error::{PaymentError, PaymentResult},
    money::{Currency, Money},
    provider::PaymentGatewayAdapter,
    types::{CaptureResult, GatewayOrder, RefundResult},
    webhook::{WebhookEvent, WebhookEventType, WebhookRequest},
};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signature header for manual provider notifications
pub const SIGNATURE_HEADER: &str = "x-mercato-signature";

const UNPROCESSABLE: u16 = 422;

#[derive(Debug, Clone)]
struct ManualOrder {
    id: String,
    reference_id: String,
    amount: Money,
    status: &'static str,
    capture_id: Option<String>,
    refunded: i64,
}

impl ManualOrder {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "reference_id": self.reference_id,
            "status": self.status,
            "amount": {
                "currency_code": self.amount.currency.code(),
                "value": self.amount.to_gateway_value(),
            },
            "capture_id": self.capture_id,
            "refunded": self.refunded,
        })
    }

    fn to_gateway_order(&self) -> GatewayOrder {
        GatewayOrder {
            gateway_reference: self.id.clone(),
            gateway_status: self.status.to_string(),
            capture_id: self.capture_id.clone(),
            captured_amount: self.capture_id.as_ref().map(|_| self.amount),
            raw: self.to_json(),
        }
    }
}

#[derive(Default)]
struct Ledger {
    orders: HashMap<String, ManualOrder>,
    /// Idempotency key to order id
    created: HashMap<String, String>,
    /// Idempotency key to completed refund
    refunds: HashMap<String, RefundResult>,
}

impl Ledger {
    fn order_mut(&mut self, order_id: &str) -> PaymentResult<&mut ManualOrder> {
        self.orders
            .get_mut(order_id)
            .ok_or_else(|| PaymentError::NotFound(format!("order {}", order_id)))
    }
}

/// Manual payment provider
pub struct ManualProvider {
    config: ManualConfig,
    ledger: Mutex<Ledger>,
}

impl ManualProvider {
    pub fn new(config: ManualConfig) -> PaymentResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ledger: Mutex::new(Ledger::default()),
        })
    }

    fn mac(&self) -> PaymentResult<HmacSha256> {
        HmacSha256::new_from_slice(self.config.webhook_secret.expose_secret().as_bytes())
            .map_err(|e| PaymentError::Configuration(format!("webhook secret: {}", e)))
    }

    /// Sign a notification payload with the current time
    pub fn sign(&self, payload: &[u8]) -> PaymentResult<String> {
        self.sign_with_timestamp(payload, Utc::now().timestamp())
    }

    /// Sign a notification payload with an explicit timestamp
    pub fn sign_with_timestamp(&self, payload: &[u8], timestamp: i64) -> PaymentResult<String> {
        let mut mac = self.mac()?;
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }
}

#[async_trait]
impl PaymentGatewayAdapter for ManualProvider {
    fn identifier(&self) -> &'static str {
        "manual"
    }

    async fn create_order(
        &self,
        amount: Money,
        reference_id: &str,
        idempotency_key: &str,
    ) -> PaymentResult<GatewayOrder> {
        let mut ledger = self.ledger.lock();
        if let Some(existing) = ledger
            .created
            .get(idempotency_key)
            .and_then(|id| ledger.orders.get(id))
        {
            return Ok(existing.to_gateway_order());
        }

        let order = ManualOrder {
            id: format!("man_{}", Uuid::new_v4().simple()),
            reference_id: reference_id.to_string(),
            amount,
            status: "APPROVED",
            capture_id: None,
            refunded: 0,
        };
        debug!(order_id = %order.id, amount = %amount, "Created manual order");
        let result = order.to_gateway_order();
        ledger
            .created
            .insert(idempotency_key.to_string(), order.id.clone());
        ledger.orders.insert(order.id.clone(), order);
        Ok(result)
    }

    async fn get_order(&self, gateway_reference: &str) -> PaymentResult<GatewayOrder> {
        let mut ledger = self.ledger.lock();
        Ok(ledger.order_mut(gateway_reference)?.to_gateway_order())
    }

    async fn update_order_amount(
        &self,
        gateway_reference: &str,
        _reference_id: &str,
        amount: Money,
    ) -> PaymentResult<()> {
        let mut ledger = self.ledger.lock();
        let order = ledger.order_mut(gateway_reference)?;
        if order.status != "APPROVED" {
            return Err(PaymentError::rejected(
                UNPROCESSABLE,
                format!("ORDER_NOT_EDITABLE: order is {}", order.status),
            ));
        }
        order.amount = amount;
        Ok(())
    }

    async fn capture_order(
        &self,
        gateway_reference: &str,
        _idempotency_key: &str,
    ) -> PaymentResult<CaptureResult> {
        let mut ledger = self.ledger.lock();
        let order = ledger.order_mut(gateway_reference)?;
        match order.status {
            "APPROVED" => {
                order.status = "COMPLETED";
                order.capture_id = Some(format!("mcap_{}", Uuid::new_v4().simple()));
            }
            "COMPLETED" => {}
            other => {
                return Err(PaymentError::rejected(
                    UNPROCESSABLE,
                    format!("ORDER_NOT_APPROVED: order is {}", other),
                ));
            }
        }

        let capture_id = order.capture_id.clone().ok_or_else(|| {
            PaymentError::Serialization(format!("order {} carries no capture", order.id))
        })?;
        Ok(CaptureResult {
            capture_id,
            gateway_status: "COMPLETED".to_string(),
            amount: Some(order.amount),
            raw: order.to_json(),
        })
    }

    async fn refund_capture(
        &self,
        capture_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> PaymentResult<RefundResult> {
        let mut ledger = self.ledger.lock();
        if let Some(previous) = ledger.refunds.get(idempotency_key) {
            return Ok(previous.clone());
        }

        let order = ledger
            .orders
            .values_mut()
            .find(|o| o.capture_id.as_deref() == Some(capture_id))
            .ok_or_else(|| PaymentError::NotFound(format!("capture {}", capture_id)))?;
        amount.ensure_same_currency(order.amount.currency)?;
        if order.refunded + amount.amount > order.amount.amount {
            return Err(PaymentError::rejected(
                UNPROCESSABLE,
                "REFUND_AMOUNT_EXCEEDED: refund exceeds captured amount",
            ));
        }
        order.refunded += amount.amount;

        let refund_id = format!("mref_{}", Uuid::new_v4().simple());
        let result = RefundResult {
            raw: json!({
                "id": refund_id,
                "status": "COMPLETED",
                "capture_id": capture_id,
                "amount": {
                    "currency_code": amount.currency.code(),
                    "value": amount.to_gateway_value(),
                },
            }),
            refund_id,
            gateway_status: "COMPLETED".to_string(),
        };
        ledger
            .refunds
            .insert(idempotency_key.to_string(), result.clone());
        Ok(result)
    }

    async fn cancel_order(&self, gateway_reference: &str) -> PaymentResult<()> {
        let mut ledger = self.ledger.lock();
        let order = ledger.order_mut(gateway_reference)?;
        if order.status == "COMPLETED" {
            return Err(PaymentError::AlreadyCaptured);
        }
        order.status = "VOIDED";
        Ok(())
    }

    async fn verify_webhook(&self, request: &WebhookRequest) -> PaymentResult<()> {
        let header = request
            .header(SIGNATURE_HEADER)
            .ok_or(PaymentError::InvalidWebhookSignature)?;

        let mut timestamp = None;
        let mut signature = None;
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
                Some(("v1", v)) => signature = hex::decode(v).ok(),
                _ => {}
            }
        }
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return Err(PaymentError::InvalidWebhookSignature);
        };

        let Some(age) = Utc::now()
            .timestamp()
            .checked_sub(timestamp)
            .map(i64::unsigned_abs)
        else {
            return Err(PaymentError::InvalidWebhookSignature);
        };
        if age > self.config.signature_tolerance_secs {
            warn!(age, "Manual webhook timestamp outside tolerance");
            return Err(PaymentError::InvalidWebhookSignature);
        }

        let mut mac = self.mac()?;
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(&request.body);
        mac.verify_slice(&signature)
            .map_err(|_| PaymentError::InvalidWebhookSignature)
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let notification: ManualNotification = serde_json::from_slice(payload)?;
        let event_type = match notification.kind.as_str() {
            "order.approved" => WebhookEventType::OrderApproved,
            "order.voided" => WebhookEventType::OrderVoided,
            "capture.completed" => WebhookEventType::CaptureCompleted,
            "capture.denied" => WebhookEventType::CaptureDenied,
            "capture.refunded" => WebhookEventType::CaptureRefunded,
            other => WebhookEventType::Unknown(other.to_string()),
        };

        let amount = match (notification.amount, notification.currency) {
            (Some(amount), Some(currency)) => Some(Money::new(amount, currency)),
            _ => None,
        };

        Ok(WebhookEvent {
            id: notification.id,
            event_type,
            created_at: Some(Utc::now()),
            gateway_reference: notification.order_id,
            capture_id: notification.capture_id,
            refund_id: notification.refund_id,
            amount,
            summary: notification.reason,
            raw: serde_json::from_slice(payload)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ManualNotification {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    order_id: Option<String>,
    capture_id: Option<String>,
    refund_id: Option<String>,
    amount: Option<i64>,
    currency: Option<Currency>,
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ManualProvider {
        ManualProvider::new(ManualConfig::new("whsec_test")).unwrap()
    }

    #[test]
    fn test_requires_secret() {
        assert!(ManualProvider::new(ManualConfig::new("")).is_err());
    }

    #[tokio::test]
    async fn test_order_lifecycle() {
        let provider = provider();
        let order = provider
            .create_order(Money::usd(5000), "cart_1", "ps_1-create")
            .await
            .unwrap();
        assert_eq!(order.gateway_status, "APPROVED");

        // Same key, same order
        let again = provider
            .create_order(Money::usd(5000), "cart_1", "ps_1-create")
            .await
            .unwrap();
        assert_eq!(again.gateway_reference, order.gateway_reference);

        let capture = provider
            .capture_order(&order.gateway_reference, "ps_1-capture")
            .await
            .unwrap();
        let recapture = provider
            .capture_order(&order.gateway_reference, "ps_1-capture")
            .await
            .unwrap();
        assert_eq!(capture.capture_id, recapture.capture_id);

        provider
            .refund_capture(&capture.capture_id, Money::usd(3000), "r1")
            .await
            .unwrap();
        let err = provider
            .refund_capture(&capture.capture_id, Money::usd(3000), "r2")
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::GatewayRejected { status: 422, .. }));

        assert_eq!(
            provider.cancel_order(&order.gateway_reference).await,
            Err(PaymentError::AlreadyCaptured)
        );
    }

    #[tokio::test]
    async fn test_signature_round_trip() {
        let provider = provider();
        let body = br#"{"id":"evt_1","type":"order.approved","order_id":"man_1"}"#;
        let signature = provider.sign(body).unwrap();

        let request = WebhookRequest::new(body.to_vec()).with_header(SIGNATURE_HEADER, signature);
        assert!(provider.verify_webhook(&request).await.is_ok());

        let tampered = WebhookRequest::new(br#"{"id":"evt_1","type":"order.voided"}"#.to_vec())
            .with_header(SIGNATURE_HEADER, provider.sign(body).unwrap());
        assert_eq!(
            provider.verify_webhook(&tampered).await,
            Err(PaymentError::InvalidWebhookSignature)
        );
    }

    #[tokio::test]
    async fn test_stale_signature_rejected() {
        let provider = provider();
        let body = br#"{"id":"evt_1","type":"order.approved"}"#;
        let old = Utc::now().timestamp() - 3600;
        let request = WebhookRequest::new(body.to_vec())
            .with_header(SIGNATURE_HEADER, provider.sign_with_timestamp(body, old).unwrap());
        assert!(provider.verify_webhook(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_rejected() {
        let provider = provider();
        for header in ["t=-9223372036854775808,v1=00", "t=9223372036854775807,v1=00"] {
            let request = WebhookRequest::new(b"{}".to_vec()).with_header(SIGNATURE_HEADER, header);
            assert_eq!(
                provider.verify_webhook(&request).await,
                Err(PaymentError::InvalidWebhookSignature)
            );
        }
    }

    #[test]
    fn test_parse_refund_notification() {
        let event = provider()
            .parse_webhook(
                br#"{"id":"evt_2","type":"capture.refunded","capture_id":"mcap_1","refund_id":"mref_1","amount":2000,"currency":"USD"}"#,
            )
            .unwrap();
        assert_eq!(event.event_type, WebhookEventType::CaptureRefunded);
        assert_eq!(event.amount, Some(Money::usd(2000)));
        assert_eq!(event.refund_id.as_deref(), Some("mref_1"));
    }
}
