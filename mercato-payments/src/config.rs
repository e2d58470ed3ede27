//! Provider and processor configuration

use crate::error::{PaymentError, PaymentResult};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// PayPal live API
pub const PAYPAL_LIVE_URL: &str = "https://api-m.paypal.com";
/// PayPal sandbox API
pub const PAYPAL_SANDBOX_URL: &str = "https://api-m.sandbox.paypal.com";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// PayPal adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalConfig {
    /// REST app client id
    pub client_id: String,
    /// REST app secret
    pub client_secret: SecretString,
    /// Use the sandbox environment
    #[serde(default)]
    pub sandbox: bool,
    /// Webhook id used to verify notification signatures
    #[serde(default)]
    pub webhook_id: Option<String>,
    /// Timeout for every gateway request, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Point the adapter at another host (mock servers, proxies)
    #[serde(default)]
    pub base_url: Option<String>,
}

impl PayPalConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into().into()),
            sandbox: false,
            webhook_id: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            base_url: None,
        }
    }

    /// Read `PAYPAL_CLIENT_ID`, `PAYPAL_CLIENT_SECRET`, `PAYPAL_SANDBOX`,
    /// `PAYPAL_AUTH_WEBHOOK_ID` and `PAYPAL_TIMEOUT_SECS`.
    pub fn from_env() -> PaymentResult<Self> {
        let client_id = env::var("PAYPAL_CLIENT_ID").unwrap_or_default();
        let client_secret = env::var("PAYPAL_CLIENT_SECRET").unwrap_or_default();
        let sandbox = env::var("PAYPAL_SANDBOX")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        let timeout_secs = match env::var("PAYPAL_TIMEOUT_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                PaymentError::Configuration(format!("PAYPAL_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };

        let config = Self {
            client_id,
            client_secret: SecretString::new(client_secret.into()),
            sandbox,
            webhook_id: env::var("PAYPAL_AUTH_WEBHOOK_ID").ok().filter(|v| !v.is_empty()),
            timeout_secs,
            base_url: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_webhook_id(mut self, webhook_id: impl Into<String>) -> Self {
        self.webhook_id = Some(webhook_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base URL, resolved once from `sandbox` unless overridden
    pub fn resolve_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.sandbox => PAYPAL_SANDBOX_URL.to_string(),
            None => PAYPAL_LIVE_URL.to_string(),
        }
    }

    pub fn validate(&self) -> PaymentResult<()> {
        if self.client_id.trim().is_empty() {
            return Err(PaymentError::Configuration(
                "PayPal client_id is required".into(),
            ));
        }
        if self.client_secret.expose_secret().trim().is_empty() {
            return Err(PaymentError::Configuration(
                "PayPal client_secret is required".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(PaymentError::Configuration(
                "PayPal timeout must be at least one second".into(),
            ));
        }
        if let Some(url) = &self.base_url {
            url::Url::parse(url).map_err(|e| {
                PaymentError::Configuration(format!("invalid PayPal base URL {}: {}", url, e))
            })?;
        }
        Ok(())
    }
}

/// Configuration for the in-process manual provider
#[derive(Debug, Clone, Deserialize)]
pub struct ManualConfig {
    /// HMAC secret for signed status notifications
    pub webhook_secret: SecretString,
    /// Maximum accepted age of a signed notification
    #[serde(default = "default_tolerance")]
    pub signature_tolerance_secs: u64,
}

fn default_tolerance() -> u64 {
    300
}

impl ManualConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: SecretString::new(webhook_secret.into().into()),
            signature_tolerance_secs: default_tolerance(),
        }
    }

    pub fn validate(&self) -> PaymentResult<()> {
        if self.webhook_secret.expose_secret().is_empty() {
            return Err(PaymentError::Configuration(
                "manual provider webhook_secret is required".into(),
            ));
        }
        Ok(())
    }
}

/// Payment processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Extra attempts for the read-only status poll. Money mutations are
    /// never retried automatically.
    pub status_retry_attempts: u32,
    /// Delay between status poll attempts in milliseconds
    pub status_retry_delay_ms: u64,
    /// Log every applied transition at info level
    pub log_transactions: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            status_retry_attempts: 2,
            status_retry_delay_ms: 250,
            log_transactions: true,
        }
    }
}

impl ProcessorConfig {
    pub fn status_retry_delay(&self) -> Duration {
        Duration::from_millis(self.status_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_fail_fast() {
        let err = PayPalConfig::new("", "secret").validate().unwrap_err();
        assert!(matches!(err, PaymentError::Configuration(_)));

        let err = PayPalConfig::new("client", "  ").validate().unwrap_err();
        assert!(err.to_string().contains("client_secret"));
    }

    #[test]
    fn test_base_url_resolution() {
        let live = PayPalConfig::new("id", "secret");
        assert_eq!(live.resolve_base_url(), PAYPAL_LIVE_URL);

        let sandbox = PayPalConfig::new("id", "secret").sandbox(true);
        assert_eq!(sandbox.resolve_base_url(), PAYPAL_SANDBOX_URL);

        let mock = PayPalConfig::new("id", "secret").with_base_url("http://127.0.0.1:9000/");
        assert_eq!(mock.resolve_base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = PayPalConfig::new("id", "secret").with_base_url("not a url");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_config() {
        let config: PayPalConfig = serde_json::from_value(serde_json::json!({
            "client_id": "abc",
            "client_secret": "shh",
            "sandbox": true,
            "webhook_id": "WH-1"
        }))
        .unwrap();
        assert!(config.sandbox);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.webhook_id.as_deref(), Some("WH-1"));
        assert!(!format!("{:?}", config).contains("shh"));
    }

    #[test]
    fn test_processor_config_default() {
        let config = ProcessorConfig::default();
        assert_eq!(config.status_retry_attempts, 2);
        assert!(config.log_transactions);
    }
}
