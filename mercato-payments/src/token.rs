//! Bearer token cache with single-flight refresh

use crate::error::{PaymentError, PaymentResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Tokens are refreshed this long before the gateway says they expire
pub const TOKEN_SAFETY_MARGIN_SECS: i64 = 60;

/// Ephemeral gateway credential
#[derive(Debug, Clone)]
pub struct AccessToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: SecretString::new(value.into().into()),
            expires_at,
        }
    }

    /// Token that expires `expires_in` seconds from now
    pub fn expiring_in(value: impl Into<String>, expires_in: i64) -> Self {
        Self::new(value, Utc::now() + Duration::seconds(expires_in))
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now < self.expires_at - margin
    }
}

/// Something that can mint a new access token
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> PaymentResult<AccessToken>;
}

struct Flight {
    generation: u64,
    last_error: Option<PaymentError>,
}

/// Caches one access token per provider instance.
///
/// Reads of a fresh token only take the read lock. When the token is missing
/// or stale, callers queue on the flight lock; the first one fetches and the
/// rest reuse its result, success or failure.
pub struct TokenCache {
    current: RwLock<Option<AccessToken>>,
    flight: Mutex<Flight>,
    generation: AtomicU64,
    safety_margin: Duration,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::with_safety_margin(Duration::seconds(TOKEN_SAFETY_MARGIN_SECS))
    }

    pub fn with_safety_margin(safety_margin: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            flight: Mutex::new(Flight {
                generation: 0,
                last_error: None,
            }),
            generation: AtomicU64::new(0),
            safety_margin,
        }
    }

    async fn cached(&self) -> Option<SecretString> {
        let token = self.current.read().await;
        token
            .as_ref()
            .filter(|t| t.is_fresh(self.safety_margin, Utc::now()))
            .map(|t| t.value.clone())
    }

    /// Return a fresh token, fetching one from `source` if needed.
    pub async fn get<S>(&self, source: &S) -> PaymentResult<SecretString>
    where
        S: TokenSource + ?Sized,
    {
        let observed = self.generation.load(Ordering::Acquire);
        if let Some(value) = self.cached().await {
            return Ok(value);
        }

        let mut flight = self.flight.lock().await;

        // A fetch may have finished since the first read
        if let Some(value) = self.cached().await {
            return Ok(value);
        }
        // Callers queued behind a failed fetch share its error
        if flight.generation != observed
            && let Some(err) = &flight.last_error
        {
            return Err(err.clone());
        }

        debug!("Fetching new access token");
        let result = source.fetch_token().await;
        flight.generation += 1;

        let outcome = match result {
            Ok(token) => {
                flight.last_error = None;
                let value = token.value.clone();
                *self.current.write().await = Some(token);
                Ok(value)
            }
            Err(err) => {
                flight.last_error = Some(err.clone());
                Err(err)
            }
        };
        self.generation.store(flight.generation, Ordering::Release);
        outcome
    }

    /// Drop `stale` if it is still the cached token. A token refreshed by a
    /// concurrent caller is left alone.
    pub async fn invalidate(&self, stale: &SecretString) {
        let mut current = self.current.write().await;
        if current
            .as_ref()
            .is_some_and(|t| t.value.expose_secret() == stale.expose_secret())
        {
            debug!("Invalidating rejected access token");
            *current = None;
        }
    }

    /// Drop whatever token is cached
    pub async fn clear(&self) {
        *self.current.write().await = None;
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}
