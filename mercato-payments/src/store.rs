//! Session persistence seam and per-session locking

use crate::{error::PaymentResult, types::PaymentSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

/// Where payment sessions live. The order subsystem owns persistence and
/// plugs its own implementation in; `InMemorySessionStore` covers tests and
/// single-process deployments.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> PaymentResult<Option<PaymentSession>>;

    async fn save(&self, session: &PaymentSession) -> PaymentResult<()>;

    async fn find_by_gateway_reference(
        &self,
        provider_id: &str,
        gateway_reference: &str,
    ) -> PaymentResult<Option<PaymentSession>>;

    async fn find_by_capture_id(
        &self,
        provider_id: &str,
        capture_id: &str,
    ) -> PaymentResult<Option<PaymentSession>>;
}

/// Process-local session store
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, PaymentSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> PaymentResult<Option<PaymentSession>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn save(&self, session: &PaymentSession) -> PaymentResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_by_gateway_reference(
        &self,
        provider_id: &str,
        gateway_reference: &str,
    ) -> PaymentResult<Option<PaymentSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| {
                s.provider_id == provider_id
                    && s.gateway_reference.as_deref() == Some(gateway_reference)
            })
            .cloned())
    }

    async fn find_by_capture_id(
        &self,
        provider_id: &str,
        capture_id: &str,
    ) -> PaymentResult<Option<PaymentSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| s.provider_id == provider_id && s.capture_id.as_deref() == Some(capture_id))
            .cloned())
    }
}

const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per session id.
///
/// Held across the gateway call so the transition table is always
/// evaluated against the state the previous operation left behind.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > PRUNE_THRESHOLD {
                // Entries only referenced by the map are idle
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}
