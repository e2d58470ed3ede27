//! Webhook handling for payment events

use crate::{
    error::PaymentResult,
    money::Money,
    provider::PaymentGatewayAdapter,
    state::{Applied, Observation, apply_observation},
    store::{SessionLocks, SessionStore},
    types::PaymentStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inbound webhook as received by the HTTP layer
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    headers: HashMap<String, String>,
    /// Raw body, byte for byte
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn from_parts<I, K, V>(headers: I, body: impl Into<Vec<u8>>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut request = Self::new(body);
        for (name, value) in headers {
            request.insert_header(name.as_ref(), value);
        }
        request
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Gateway events the reconciler understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    OrderApproved,
    OrderCompleted,
    OrderVoided,
    CaptureCompleted,
    CapturePending,
    CaptureDenied,
    CaptureRefunded,
    CaptureReversed,
    Unknown(String),
}

impl WebhookEventType {
    /// Parse a PayPal event name
    pub fn from_paypal(s: &str) -> Self {
        match s {
            "CHECKOUT.ORDER.APPROVED" => Self::OrderApproved,
            "CHECKOUT.ORDER.COMPLETED" => Self::OrderCompleted,
            "CHECKOUT.ORDER.VOIDED" => Self::OrderVoided,
            "PAYMENT.CAPTURE.COMPLETED" => Self::CaptureCompleted,
            "PAYMENT.CAPTURE.PENDING" => Self::CapturePending,
            "PAYMENT.CAPTURE.DENIED" => Self::CaptureDenied,
            "PAYMENT.CAPTURE.REFUNDED" => Self::CaptureRefunded,
            "PAYMENT.CAPTURE.REVERSED" => Self::CaptureReversed,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Event resource is an order (as opposed to a capture or refund)
    pub fn is_order_event(&self) -> bool {
        matches!(
            self,
            Self::OrderApproved | Self::OrderCompleted | Self::OrderVoided
        )
    }

    /// Event resource is a refund
    pub fn is_refund_event(&self) -> bool {
        matches!(self, Self::CaptureRefunded | Self::CaptureReversed)
    }
}

/// A verified, provider-neutral webhook event
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// Gateway event id
    pub id: String,
    pub event_type: WebhookEventType,
    pub created_at: Option<DateTime<Utc>>,
    /// Order the event is about, when the payload names it
    pub gateway_reference: Option<String>,
    pub capture_id: Option<String>,
    pub refund_id: Option<String>,
    /// Captured or refunded amount carried by the event
    pub amount: Option<Money>,
    /// Gateway's human readable summary
    pub summary: Option<String>,
    pub raw: Value,
}

impl WebhookEvent {
    /// State the event asks the session to converge to
    pub fn observation(&self) -> Observation {
        use WebhookEventType as E;

        match &self.event_type {
            E::OrderApproved => Observation::Authorized,
            E::OrderCompleted | E::CaptureCompleted => Observation::Captured {
                capture_id: self.capture_id.clone(),
                amount: self.amount.map(|m| m.amount),
            },
            E::OrderVoided => Observation::Canceled,
            E::CaptureDenied => Observation::Failed {
                reason: self
                    .summary
                    .clone()
                    .unwrap_or_else(|| "capture denied by gateway".to_string()),
            },
            E::CaptureRefunded | E::CaptureReversed => match (&self.refund_id, self.amount) {
                (Some(refund_id), Some(amount)) => Observation::Refunded {
                    refund_id: refund_id.clone(),
                    amount: amount.amount,
                },
                _ => Observation::Unchanged,
            },
            E::CapturePending | E::Unknown(_) => Observation::Unchanged,
        }
    }
}

/// Why a verified webhook did not change anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Event type carries no state change
    NotActionable,
    /// No session matches the event's references
    UnknownReference,
    /// Session already reflects the event
    AlreadyReflected,
}

/// Result of handling one webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied {
        session_id: String,
        status: PaymentStatus,
    },
    Ignored {
        event_id: String,
        reason: IgnoreReason,
    },
}

impl WebhookOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Applies verified gateway events to stored sessions.
///
/// Shares the session locks with the processor, so a webhook and a
/// synchronous operation on the same session never interleave.
pub struct WebhookReconciler {
    store: Arc<dyn SessionStore>,
    locks: Arc<SessionLocks>,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn SessionStore>, locks: Arc<SessionLocks>) -> Self {
        Self { store, locks }
    }

    /// Verify, parse and apply one webhook.
    ///
    /// A failed verification is returned as an error and nothing is read
    /// from the payload. Replays and out-of-order events come back as
    /// `Ignored`.
    pub async fn reconcile(
        &self,
        adapter: &dyn PaymentGatewayAdapter,
        request: &WebhookRequest,
    ) -> PaymentResult<WebhookOutcome> {
        let provider_id = adapter.identifier();

        if let Err(err) = adapter.verify_webhook(request).await {
            warn!(provider = provider_id, error = %err, "Rejected webhook");
            return Err(err);
        }

        let event = adapter.parse_webhook(&request.body)?;
        debug!(
            provider = provider_id,
            event_id = %event.id,
            event_type = ?event.event_type,
            "Received webhook"
        );

        let observation = event.observation();
        if observation == Observation::Unchanged {
            return Ok(ignored(&event, IgnoreReason::NotActionable));
        }

        let Some(session_id) = self.find_session(provider_id, &event).await? else {
            warn!(
                provider = provider_id,
                event_id = %event.id,
                gateway_reference = ?event.gateway_reference,
                capture_id = ?event.capture_id,
                "Webhook references no known session"
            );
            return Ok(ignored(&event, IgnoreReason::UnknownReference));
        };

        let _guard = self.locks.acquire(&session_id).await;
        // Reload under the lock; the lookup copy may be stale
        let Some(mut session) = self.store.load(&session_id).await? else {
            return Ok(ignored(&event, IgnoreReason::UnknownReference));
        };

        match apply_observation(&mut session, observation) {
            Applied::Changed => {
                session.record_raw("last_webhook", event.raw.clone());
                self.store.save(&session).await?;
                info!(
                    provider = provider_id,
                    event_id = %event.id,
                    session_id = %session.id,
                    status = %session.status,
                    "Webhook applied"
                );
                Ok(WebhookOutcome::Applied {
                    session_id: session.id,
                    status: session.status,
                })
            }
            Applied::Unchanged => Ok(ignored(&event, IgnoreReason::AlreadyReflected)),
        }
    }

    async fn find_session(
        &self,
        provider_id: &str,
        event: &WebhookEvent,
    ) -> PaymentResult<Option<String>> {
        if let Some(reference) = &event.gateway_reference
            && let Some(session) = self
                .store
                .find_by_gateway_reference(provider_id, reference)
                .await?
        {
            return Ok(Some(session.id));
        }
        if let Some(capture_id) = &event.capture_id
            && let Some(session) = self.store.find_by_capture_id(provider_id, capture_id).await?
        {
            return Ok(Some(session.id));
        }
        Ok(None)
    }
}

fn ignored(event: &WebhookEvent, reason: IgnoreReason) -> WebhookOutcome {
    debug!(event_id = %event.id, reason = ?reason, "Webhook ignored");
    WebhookOutcome::Ignored {
        event_id: event.id.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: WebhookEventType) -> WebhookEvent {
        WebhookEvent {
            id: "WH-1".into(),
            event_type,
            created_at: None,
            gateway_reference: Some("ORD-1".into()),
            capture_id: Some("CAP-1".into()),
            refund_id: None,
            amount: Some(Money::usd(5000)),
            summary: None,
            raw: Value::Null,
        }
    }

    #[test]
    fn test_event_type_parsing() {
        assert_eq!(
            WebhookEventType::from_paypal("CHECKOUT.ORDER.APPROVED"),
            WebhookEventType::OrderApproved
        );
        assert_eq!(
            WebhookEventType::from_paypal("PAYMENT.CAPTURE.REFUNDED"),
            WebhookEventType::CaptureRefunded
        );
        assert!(matches!(
            WebhookEventType::from_paypal("BILLING.SUBSCRIPTION.CREATED"),
            WebhookEventType::Unknown(_)
        ));
        assert!(WebhookEventType::OrderVoided.is_order_event());
        assert!(WebhookEventType::CaptureReversed.is_refund_event());
    }

    #[test]
    fn test_observations() {
        assert_eq!(
            event(WebhookEventType::OrderApproved).observation(),
            Observation::Authorized
        );
        assert_eq!(
            event(WebhookEventType::CaptureCompleted).observation(),
            Observation::Captured {
                capture_id: Some("CAP-1".into()),
                amount: Some(5000)
            }
        );
        assert!(matches!(
            event(WebhookEventType::CaptureDenied).observation(),
            Observation::Failed { .. }
        ));
        assert_eq!(
            event(WebhookEventType::CapturePending).observation(),
            Observation::Unchanged
        );
    }

    #[test]
    fn test_refund_without_id_is_not_actionable() {
        let mut refund = event(WebhookEventType::CaptureRefunded);
        assert_eq!(refund.observation(), Observation::Unchanged);

        refund.refund_id = Some("RF-1".into());
        assert_eq!(
            refund.observation(),
            Observation::Refunded {
                refund_id: "RF-1".into(),
                amount: 5000
            }
        );
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = WebhookRequest::from_parts([("PAYPAL-TRANSMISSION-ID", "abc")], "{}");
        assert_eq!(request.header("paypal-transmission-id"), Some("abc"));
        assert_eq!(request.header("Paypal-Transmission-Id"), Some("abc"));
        assert_eq!(request.header("missing"), None);
    }
}
