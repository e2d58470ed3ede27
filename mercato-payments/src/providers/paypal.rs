//! PayPal payment provider implementation
//!
//! Talks to the PayPal Orders v2 API with client-credential bearer tokens.
//! Sessions map one-to-one onto PayPal orders created with the `CAPTURE`
//! intent; the order id is the session's gateway reference.

use crate::{
    config::PayPalConfig,
    error::{PaymentError, PaymentResult},
    money::{Currency, Money},
    provider::{GatewayResponse, PaymentGatewayAdapter, ProviderClient},
    token::{AccessToken, TokenCache, TokenSource},
    types::{CaptureResult, GatewayOrder, RefundResult},
    webhook::{WebhookEvent, WebhookEventType, WebhookRequest},
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json, value::RawValue};
use tracing::{debug, error, info, warn};

/// Idempotency header honoured by PayPal on order and refund calls
const REQUEST_ID_HEADER: &str = "PayPal-Request-Id";

/// PayPal provider
pub struct PayPalProvider {
    config: PayPalConfig,
    http: ProviderClient,
    tokens: TokenCache,
}

impl PayPalProvider {
    /// Create a new PayPal provider. Fails on missing credentials.
    pub fn new(config: PayPalConfig) -> PaymentResult<Self> {
        config.validate()?;
        let http = ProviderClient::new(config.resolve_base_url(), config.timeout())?;
        info!(
            base_url = http.base_url(),
            sandbox = config.sandbox,
            "PayPal provider configured"
        );
        Ok(Self {
            config,
            http,
            tokens: TokenCache::new(),
        })
    }

    /// Build from `PAYPAL_*` environment variables
    pub fn from_env() -> PaymentResult<Self> {
        Self::new(PayPalConfig::from_env()?)
    }

    pub fn config(&self) -> &PayPalConfig {
        &self.config
    }

    /// Send a request with a bearer token. A 401 invalidates the token and
    /// the request is sent once more with a fresh one.
    async fn send_authorized<F>(&self, build: F) -> PaymentResult<GatewayResponse>
    where
        F: Fn(&SecretString) -> RequestBuilder + Send + Sync,
    {
        let token = self.tokens.get(self).await?;
        let response = self.http.send(build(&token)).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("PayPal rejected access token; refreshing");
        self.tokens.invalidate(&token).await;
        let token = self.tokens.get(self).await?;
        let response = self.http.send(build(&token)).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            error!("PayPal rejected a freshly issued access token");
            return Err(PaymentError::AuthenticationFailed(
                PayPalErrorBody::from_response(&response).describe(),
            ));
        }
        Ok(response)
    }

    async fn fetch_order(&self, order_id: &str) -> PaymentResult<(PayPalOrder, Value)> {
        let path = format!("/v2/checkout/orders/{}", order_id);
        let response = self
            .send_authorized(|token| {
                self.http
                    .request(Method::GET, &path)
                    .bearer_auth(token.expose_secret())
            })
            .await?;
        if !response.is_success() {
            return Err(gateway_error(&response, "order", order_id));
        }
        let order: PayPalOrder = serde_json::from_value(response.body.clone())?;
        Ok((order, response.body))
    }
}

#[async_trait]
impl TokenSource for PayPalProvider {
    async fn fetch_token(&self) -> PaymentResult<AccessToken> {
        let credentials = STANDARD.encode(format!(
            "{}:{}",
            self.config.client_id,
            self.config.client_secret.expose_secret()
        ));

        let request = self
            .http
            .request(Method::POST, "/v1/oauth2/token")
            .header("Authorization", format!("Basic {}", credentials))
            .form(&[("grant_type", "client_credentials")]);
        let response = self.http.send(request).await?;

        if !response.is_success() {
            let detail = PayPalErrorBody::from_response(&response).describe();
            error!(status = response.status.as_u16(), error = %detail, "PayPal token request failed");
            return Err(PaymentError::AuthenticationFailed(format!(
                "token request returned {}: {}",
                response.status, detail
            )));
        }

        let token: PayPalTokenResponse = serde_json::from_value(response.body)?;
        debug!(expires_in = token.expires_in, "Obtained PayPal access token");
        Ok(AccessToken::expiring_in(token.access_token, token.expires_in))
    }
}

#[async_trait]
impl PaymentGatewayAdapter for PayPalProvider {
    fn identifier(&self) -> &'static str {
        "paypal"
    }

    async fn create_order(
        &self,
        amount: Money,
        reference_id: &str,
        idempotency_key: &str,
    ) -> PaymentResult<GatewayOrder> {
        let body = PayPalOrderRequest {
            intent: "CAPTURE",
            purchase_units: vec![PayPalPurchaseUnitRequest {
                reference_id,
                amount: PayPalAmount::from_money(amount),
            }],
        };

        let response = self
            .send_authorized(|token| {
                self.http
                    .request(Method::POST, "/v2/checkout/orders")
                    .bearer_auth(token.expose_secret())
                    .header(REQUEST_ID_HEADER, idempotency_key)
                    .header("Prefer", "return=representation")
                    .json(&body)
            })
            .await?;
        if !response.is_success() {
            return Err(gateway_error(&response, "order", reference_id));
        }

        let order: PayPalOrder = serde_json::from_value(response.body.clone())?;
        debug!(order_id = %order.id, status = %order.status, "Created PayPal order");
        Ok(order.into_gateway_order(response.body))
    }

    async fn get_order(&self, gateway_reference: &str) -> PaymentResult<GatewayOrder> {
        let (order, raw) = self.fetch_order(gateway_reference).await?;
        Ok(order.into_gateway_order(raw))
    }

    async fn update_order_amount(
        &self,
        gateway_reference: &str,
        reference_id: &str,
        amount: Money,
    ) -> PaymentResult<()> {
        let path = format!("/v2/checkout/orders/{}", gateway_reference);
        let patch = json!([{
            "op": "replace",
            "path": format!("/purchase_units/@reference_id=='{}'/amount", reference_id),
            "value": PayPalAmount::from_money(amount),
        }]);

        let response = self
            .send_authorized(|token| {
                self.http
                    .request(Method::PATCH, &path)
                    .bearer_auth(token.expose_secret())
                    .json(&patch)
            })
            .await?;
        if !response.is_success() {
            return Err(gateway_error(&response, "order", gateway_reference));
        }
        Ok(())
    }

    async fn capture_order(
        &self,
        gateway_reference: &str,
        idempotency_key: &str,
    ) -> PaymentResult<CaptureResult> {
        let path = format!("/v2/checkout/orders/{}/capture", gateway_reference);
        let response = self
            .send_authorized(|token| {
                self.http
                    .request(Method::POST, &path)
                    .bearer_auth(token.expose_secret())
                    .header(REQUEST_ID_HEADER, idempotency_key)
                    .header("Prefer", "return=representation")
                    .json(&json!({}))
            })
            .await?;

        if response.is_success() {
            let order: PayPalOrder = serde_json::from_value(response.body.clone())?;
            return capture_result(order, response.body);
        }

        let detail = PayPalErrorBody::from_response(&response);
        if response.status == StatusCode::UNPROCESSABLE_ENTITY
            && detail.issue() == Some("ORDER_ALREADY_CAPTURED")
        {
            info!(order_id = gateway_reference, "Order already captured; reading existing capture");
            let (order, raw) = self.fetch_order(gateway_reference).await?;
            return capture_result(order, raw);
        }

        Err(gateway_error(&response, "order", gateway_reference))
    }

    async fn refund_capture(
        &self,
        capture_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> PaymentResult<RefundResult> {
        let path = format!("/v2/payments/captures/{}/refund", capture_id);
        let body = json!({ "amount": PayPalAmount::from_money(amount) });

        let response = self
            .send_authorized(|token| {
                self.http
                    .request(Method::POST, &path)
                    .bearer_auth(token.expose_secret())
                    .header(REQUEST_ID_HEADER, idempotency_key)
                    .json(&body)
            })
            .await?;
        if !response.is_success() {
            return Err(gateway_error(&response, "capture", capture_id));
        }

        let refund: PayPalRefund = serde_json::from_value(response.body.clone())?;
        if matches!(refund.status.as_str(), "FAILED" | "CANCELLED") {
            return Err(PaymentError::rejected(
                StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
                format!("REFUND_{}: refund {} was not completed", refund.status, refund.id),
            ));
        }

        debug!(refund_id = %refund.id, status = %refund.status, "Created PayPal refund");
        Ok(RefundResult {
            refund_id: refund.id,
            gateway_status: refund.status,
            raw: response.body,
        })
    }

    async fn verify_webhook(&self, request: &WebhookRequest) -> PaymentResult<()> {
        let webhook_id = self.config.webhook_id.as_deref().ok_or_else(|| {
            PaymentError::Configuration("PayPal webhook_id is required to verify webhooks".into())
        })?;

        let header = |name: &str| {
            request.header(name).ok_or_else(|| {
                warn!(header = name, "PayPal webhook missing signature header");
                PaymentError::InvalidWebhookSignature
            })
        };

        // The event is forwarded byte for byte; re-serializing can break the signature
        let webhook_event: &RawValue = serde_json::from_slice(&request.body)
            .map_err(|_| PaymentError::InvalidWebhookSignature)?;

        let body = VerifySignatureRequest {
            auth_algo: header("paypal-auth-algo")?,
            cert_url: header("paypal-cert-url")?,
            transmission_id: header("paypal-transmission-id")?,
            transmission_sig: header("paypal-transmission-sig")?,
            transmission_time: header("paypal-transmission-time")?,
            webhook_id,
            webhook_event,
        };

        let response = self
            .send_authorized(|token| {
                self.http
                    .request(Method::POST, "/v1/notifications/verify-webhook-signature")
                    .bearer_auth(token.expose_secret())
                    .json(&body)
            })
            .await?;

        let verified = response.is_success()
            && response.body.get("verification_status").and_then(Value::as_str)
                == Some("SUCCESS");
        if !verified {
            warn!(
                status = response.status.as_u16(),
                transmission_id = body.transmission_id,
                "PayPal webhook signature verification failed"
            );
            return Err(PaymentError::InvalidWebhookSignature);
        }
        Ok(())
    }

    fn parse_webhook(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let event: PayPalWebhookEvent = serde_json::from_slice(payload)?;
        let event_type = WebhookEventType::from_paypal(&event.event_type);
        let resource = &event.resource;
        let text = |pointer: &str| {
            resource
                .pointer(pointer)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let related_order = text("/supplementary_data/related_ids/order_id");
        let (gateway_reference, capture_id, refund_id) = if event_type.is_order_event() {
            (
                text("/id"),
                text("/purchase_units/0/payments/captures/0/id"),
                None,
            )
        } else if event_type.is_refund_event() {
            (
                related_order,
                text("/supplementary_data/related_ids/capture_id").or_else(|| up_link_id(resource)),
                text("/id"),
            )
        } else {
            (related_order, text("/id"), None)
        };

        let amount = if event_type.is_order_event() {
            resource
                .pointer("/purchase_units/0/payments/captures/0/amount")
                .or_else(|| resource.pointer("/purchase_units/0/amount"))
        } else {
            resource.get("amount")
        }
        .and_then(|value| serde_json::from_value::<PayPalAmount>(value.clone()).ok())
        .and_then(|amount| amount.to_money().ok());

        let created_at = event
            .create_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(WebhookEvent {
            id: event.id,
            event_type,
            created_at,
            gateway_reference,
            capture_id,
            refund_id,
            amount,
            summary: event.summary,
            raw: serde_json::from_slice(payload)?,
        })
    }
}

fn capture_result(order: PayPalOrder, raw: Value) -> PaymentResult<CaptureResult> {
    let capture = order.first_capture().ok_or_else(|| {
        PaymentError::Serialization(format!("order {} carries no capture", order.id))
    })?;

    if matches!(capture.status.as_str(), "DECLINED" | "FAILED") {
        return Err(PaymentError::rejected(
            StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
            format!("CAPTURE_{}: capture {} was not completed", capture.status, capture.id),
        ));
    }

    Ok(CaptureResult {
        capture_id: capture.id.clone(),
        gateway_status: capture.status.clone(),
        amount: capture.amount.as_ref().and_then(|a| a.to_money().ok()),
        raw,
    })
}

/// Last path segment of the resource's `up` link
fn up_link_id(resource: &Value) -> Option<String> {
    resource
        .get("links")?
        .as_array()?
        .iter()
        .find(|link| link.get("rel").and_then(Value::as_str) == Some("up"))?
        .get("href")?
        .as_str()?
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(str::to_string)
}

fn gateway_error(response: &GatewayResponse, resource: &str, id: &str) -> PaymentError {
    let detail = PayPalErrorBody::from_response(response).describe();
    match response.status {
        StatusCode::NOT_FOUND => PaymentError::NotFound(format!("{} {}: {}", resource, id, detail)),
        StatusCode::UNAUTHORIZED => PaymentError::AuthenticationFailed(detail),
        status => PaymentError::rejected(status.as_u16(), detail),
    }
}

// PayPal API types

#[derive(Debug, Deserialize)]
struct PayPalTokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Serialize)]
struct PayPalOrderRequest<'a> {
    intent: &'static str,
    purchase_units: Vec<PayPalPurchaseUnitRequest<'a>>,
}

#[derive(Debug, Serialize)]
struct PayPalPurchaseUnitRequest<'a> {
    reference_id: &'a str,
    amount: PayPalAmount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PayPalAmount {
    currency_code: String,
    value: String,
}

impl PayPalAmount {
    fn from_money(money: Money) -> Self {
        Self {
            currency_code: money.currency.code().to_string(),
            value: money.to_gateway_value(),
        }
    }

    fn to_money(&self) -> PaymentResult<Money> {
        let currency = Currency::from_code(&self.currency_code).ok_or_else(|| {
            PaymentError::InvalidAmount(format!("unsupported currency {}", self.currency_code))
        })?;
        Money::from_gateway_value(&self.value, currency)
    }
}

#[derive(Debug, Deserialize)]
struct PayPalOrder {
    id: String,
    status: String,
    #[serde(default)]
    purchase_units: Vec<PayPalPurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct PayPalPurchaseUnit {
    #[serde(default)]
    payments: Option<PayPalPayments>,
}

#[derive(Debug, Deserialize)]
struct PayPalPayments {
    #[serde(default)]
    captures: Vec<PayPalCapture>,
}

#[derive(Debug, Deserialize)]
struct PayPalCapture {
    id: String,
    status: String,
    amount: Option<PayPalAmount>,
}

impl PayPalOrder {
    fn first_capture(&self) -> Option<&PayPalCapture> {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.captures.iter())
            .next()
    }

    fn into_gateway_order(self, raw: Value) -> GatewayOrder {
        let capture = self.first_capture();
        let capture_id = capture.map(|c| c.id.clone());
        let captured_amount = capture
            .and_then(|c| c.amount.as_ref())
            .and_then(|a| a.to_money().ok());
        GatewayOrder {
            gateway_reference: self.id,
            gateway_status: self.status,
            capture_id,
            captured_amount,
            raw,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PayPalRefund {
    id: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PayPalErrorBody {
    name: Option<String>,
    message: Option<String>,
    details: Vec<PayPalErrorDetail>,
    // OAuth endpoints use a different shape
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PayPalErrorDetail {
    issue: Option<String>,
    description: Option<String>,
}

impl PayPalErrorBody {
    fn from_response(response: &GatewayResponse) -> Self {
        serde_json::from_value(response.body.clone()).unwrap_or_default()
    }

    /// Most specific machine-readable issue
    fn issue(&self) -> Option<&str> {
        self.details
            .iter()
            .find_map(|d| d.issue.as_deref())
            .or(self.name.as_deref())
            .or(self.error.as_deref())
    }

    fn describe(&self) -> String {
        let message = self
            .details
            .iter()
            .find_map(|d| d.description.as_deref())
            .or(self.message.as_deref())
            .or(self.error_description.as_deref())
            .unwrap_or("no detail");
        match self.issue() {
            Some(issue) => format!("{}: {}", issue, message),
            None => message.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifySignatureRequest<'a> {
    auth_algo: &'a str,
    cert_url: &'a str,
    transmission_id: &'a str,
    transmission_sig: &'a str,
    transmission_time: &'a str,
    webhook_id: &'a str,
    webhook_event: &'a RawValue,
}

#[derive(Debug, Deserialize)]
struct PayPalWebhookEvent {
    id: String,
    event_type: String,
    #[serde(default)]
    create_time: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    resource: Value,
}
