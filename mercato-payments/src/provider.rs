//! Gateway adapter contract and common HTTP plumbing

use crate::{
    error::{PaymentError, PaymentResult},
    money::Money,
    types::{CaptureResult, GatewayOrder, RefundResult},
    webhook::{WebhookEvent, WebhookRequest},
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Payment gateway adapter
///
/// Implement this trait for each payment gateway (PayPal, ...). The order
/// subsystem only ever talks to adapters through the processor, which
/// applies the canonical state machine around every call.
///
/// Adapters never retry on their own: a retried money mutation without an
/// idempotency key can charge twice. Callers pass the key explicitly.
#[async_trait]
pub trait PaymentGatewayAdapter: Send + Sync {
    /// Identifier sessions are tagged with ("paypal", "manual")
    fn identifier(&self) -> &'static str;

    /// Create a gateway order for `amount`
    async fn create_order(
        &self,
        amount: Money,
        reference_id: &str,
        idempotency_key: &str,
    ) -> PaymentResult<GatewayOrder>;

    /// Fetch the current state of an order
    async fn get_order(&self, gateway_reference: &str) -> PaymentResult<GatewayOrder>;

    /// Change the amount of an order that has not been captured yet
    async fn update_order_amount(
        &self,
        gateway_reference: &str,
        reference_id: &str,
        amount: Money,
    ) -> PaymentResult<()>;

    /// Capture an approved order. Capturing an order that is already
    /// captured returns the existing capture.
    async fn capture_order(
        &self,
        gateway_reference: &str,
        idempotency_key: &str,
    ) -> PaymentResult<CaptureResult>;

    /// Refund part or all of a capture
    async fn refund_capture(
        &self,
        capture_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> PaymentResult<RefundResult>;

    /// Void an order that was never captured. Gateways whose orders simply
    /// expire keep the default.
    async fn cancel_order(&self, _gateway_reference: &str) -> PaymentResult<()> {
        Ok(())
    }

    /// Check the authenticity of a webhook before anything in it is trusted
    async fn verify_webhook(&self, request: &WebhookRequest) -> PaymentResult<()>;

    /// Parse a verified webhook payload
    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<WebhookEvent>;
}

/// A gateway response that made it back over the wire
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    /// JSON body, `Value::Null` when empty, a string when not JSON
    pub body: Value,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Common HTTP client for providers
pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
}

impl ProviderClient {
    /// Create a client bound to `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> PaymentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mercato-payments/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PaymentError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request to `path` relative to the base URL
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    /// Send a request. Transport failures, timeouts and 5xx responses become
    /// `GatewayUnavailable`; every other status is handed back for the
    /// provider to interpret.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> PaymentResult<GatewayResponse> {
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        debug!(status = status.as_u16(), "Gateway response");

        if status.is_server_error() {
            return Err(PaymentError::GatewayUnavailable(format!(
                "gateway returned {}",
                status
            )));
        }

        Ok(GatewayResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_server_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = ProviderClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client
            .send(client.request(reqwest::Method::GET, "/boom"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_errors_are_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({"name": "RESOURCE_NOT_FOUND"})),
            )
            .mount(&server)
            .await;

        let client = ProviderClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let response = client
            .send(client.request(reqwest::Method::GET, "/missing"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.body["name"], "RESOURCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = ProviderClient::new(server.uri(), Duration::from_millis(50)).unwrap();
        let err = client
            .send(client.request(reqwest::Method::GET, "/slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::GatewayUnavailable(_)));
    }
}
