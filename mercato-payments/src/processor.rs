//! Payment processor
//!
//! Entry point for the order subsystem. Every operation runs the same way:
//! take the session lock, load the session, evaluate the transition table,
//! call the gateway, converge the session on the result and save it.

use crate::{
    config::ProcessorConfig,
    error::{PaymentError, PaymentResult},
    money::Money,
    provider::PaymentGatewayAdapter,
    registry::ProviderRegistry,
    state::{
        Applied, Decision, Observation, apply_observation, canonical_status, check_refund,
        clear_error, decide, mark_errored, refund_is_reflected,
    },
    store::{InMemorySessionStore, SessionLocks, SessionStore},
    types::{
        GatewayOrder, InitiatePaymentRequest, PaymentOperation, PaymentSession, PaymentStatus,
    },
    webhook::{WebhookOutcome, WebhookReconciler, WebhookRequest},
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Main payment processor
#[derive(Clone)]
pub struct PaymentProcessor {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn SessionStore>,
    locks: Arc<SessionLocks>,
    reconciler: Arc<WebhookReconciler>,
    config: ProcessorConfig,
}

impl PaymentProcessor {
    /// Create a new payment processor
    pub fn new(registry: ProviderRegistry, store: Arc<dyn SessionStore>) -> Self {
        Self::with_config(registry, store, ProcessorConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(
        registry: ProviderRegistry,
        store: Arc<dyn SessionStore>,
        config: ProcessorConfig,
    ) -> Self {
        let locks = Arc::new(SessionLocks::new());
        let reconciler = Arc::new(WebhookReconciler::new(
            Arc::clone(&store),
            Arc::clone(&locks),
        ));
        Self {
            registry: Arc::new(registry),
            store,
            locks,
            reconciler,
            config,
        }
    }

    /// Processor backed by an `InMemorySessionStore`
    pub fn in_memory(registry: ProviderRegistry) -> Self {
        Self::new(registry, Arc::new(InMemorySessionStore::new()))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Create a gateway order for a new session.
    ///
    /// Calling this again for an initiated session returns it unchanged.
    pub async fn initiate_payment(
        &self,
        provider_id: &str,
        request: InitiatePaymentRequest,
    ) -> PaymentResult<PaymentSession> {
        request.amount.ensure_positive()?;
        let adapter = self.registry.get(provider_id)?;
        let _guard = self.locks.acquire(&request.session_id).await;

        let mut session = match self.store.load(&request.session_id).await? {
            Some(existing) if existing.provider_id != provider_id => {
                return Err(PaymentError::Configuration(format!(
                    "session {} belongs to provider {}",
                    existing.id, existing.provider_id
                )));
            }
            Some(existing) => existing,
            None => PaymentSession::new(
                request.session_id.clone(),
                provider_id,
                request.resource_id.clone(),
                request.amount,
            ),
        };

        if decide(PaymentOperation::Initiate, &session)? == Decision::NoOp {
            debug!(session_id = %session.id, "Session already initiated");
            return Ok(session);
        }

        session.amount = request.amount;
        session.resource_id = request.resource_id;
        let key = idempotency_key(&session.id, "create");

        match adapter
            .create_order(session.amount, &session.resource_id, &key)
            .await
        {
            Ok(order) => {
                clear_error(&mut session);
                session.gateway_reference = Some(order.gateway_reference.clone());
                session.touch();
                let observation = order_observation(&order);
                session.record_raw("order", order.raw);
                apply_observation(&mut session, observation);
            }
            Err(err) => return Err(self.fail(session, PaymentOperation::Initiate, err).await),
        }

        self.commit(PaymentOperation::Initiate, &session).await?;
        Ok(session)
    }

    /// Change the amount of a session that has not been authorized
    pub async fn update_payment(
        &self,
        session_id: &str,
        amount: Money,
    ) -> PaymentResult<PaymentSession> {
        amount.ensure_positive()?;
        let (_guard, mut session) = self.locked_session(session_id).await?;
        if decide(PaymentOperation::Update, &session)? == Decision::NoOp {
            return Ok(session);
        }

        if let Some(reference) = session.gateway_reference.clone() {
            amount.ensure_same_currency(session.currency())?;
            let adapter = self.registry.get(&session.provider_id)?;
            if let Err(err) = adapter
                .update_order_amount(&reference, &session.resource_id, amount)
                .await
            {
                return Err(self.fail(session, PaymentOperation::Update, err).await);
            }
        }

        clear_error(&mut session);
        session.amount = amount;
        session.touch();
        self.commit(PaymentOperation::Update, &session).await?;
        Ok(session)
    }

    /// Confirm the payer approved the order.
    ///
    /// An order the payer has not approved yet leaves the session in
    /// `requires_action`.
    pub async fn authorize_payment(&self, session_id: &str) -> PaymentResult<PaymentSession> {
        let (_guard, mut session) = self.locked_session(session_id).await?;
        if decide(PaymentOperation::Authorize, &session)? == Decision::NoOp {
            return Ok(session);
        }

        let reference = require_reference(&session, PaymentOperation::Authorize)?;
        let adapter = self.registry.get(&session.provider_id)?;
        match adapter.get_order(&reference).await {
            Ok(order) => {
                clear_error(&mut session);
                let observation = match canonical_status(&order.gateway_status) {
                    PaymentStatus::Pending => Observation::RequiresAction,
                    _ => order_observation(&order),
                };
                session.record_raw("order", order.raw);
                apply_observation(&mut session, observation);
            }
            Err(err) => return Err(self.fail(session, PaymentOperation::Authorize, err).await),
        }

        self.commit(PaymentOperation::Authorize, &session).await?;
        Ok(session)
    }

    /// Capture an authorized session. A captured session is returned as is.
    pub async fn capture_payment(&self, session_id: &str) -> PaymentResult<PaymentSession> {
        let (_guard, mut session) = self.locked_session(session_id).await?;
        if decide(PaymentOperation::Capture, &session)? == Decision::NoOp {
            debug!(session_id = %session.id, capture_id = ?session.capture_id, "Already captured");
            return Ok(session);
        }

        let reference = require_reference(&session, PaymentOperation::Capture)?;
        let adapter = self.registry.get(&session.provider_id)?;
        let key = idempotency_key(&session.id, "capture");

        match adapter.capture_order(&reference, &key).await {
            Ok(capture) => {
                clear_error(&mut session);
                session.record_raw("capture", capture.raw);
                apply_observation(
                    &mut session,
                    Observation::Captured {
                        capture_id: Some(capture.capture_id),
                        amount: capture.amount.map(|m| m.amount),
                    },
                );
            }
            Err(err) => return Err(self.fail(session, PaymentOperation::Capture, err).await),
        }

        self.commit(PaymentOperation::Capture, &session).await?;
        Ok(session)
    }

    /// Cancel a session that has not been captured
    pub async fn cancel_payment(&self, session_id: &str) -> PaymentResult<PaymentSession> {
        let (_guard, mut session) = self.locked_session(session_id).await?;
        if decide(PaymentOperation::Cancel, &session)? == Decision::NoOp {
            return Ok(session);
        }

        let adapter = self.registry.get(&session.provider_id)?;
        if let Some(reference) = session.gateway_reference.clone() {
            // A capture that failed ambiguously may have gone through
            if session
                .last_error
                .as_ref()
                .is_some_and(|e| e.operation == PaymentOperation::Capture)
            {
                let order = match adapter.get_order(&reference).await {
                    Ok(order) => order,
                    Err(err) => return Err(self.fail(session, PaymentOperation::Cancel, err).await),
                };
                if canonical_status(&order.gateway_status) == PaymentStatus::Captured {
                    let observation = order_observation(&order);
                    session.record_raw("order", order.raw);
                    apply_observation(&mut session, observation);
                    self.store.save(&session).await?;
                    return Err(PaymentError::AlreadyCaptured);
                }
            }

            if let Err(err) = adapter.cancel_order(&reference).await {
                return Err(self.fail(session, PaymentOperation::Cancel, err).await);
            }
        }

        clear_error(&mut session);
        apply_observation(&mut session, Observation::Canceled);
        self.commit(PaymentOperation::Cancel, &session).await?;
        Ok(session)
    }

    /// Remove a session that will not be used. Same as cancelling it.
    pub async fn delete_payment(&self, session_id: &str) -> PaymentResult<PaymentSession> {
        self.cancel_payment(session_id).await
    }

    /// Refund part or all of the captured amount.
    ///
    /// The amount is checked against the refundable balance before the
    /// gateway is called.
    pub async fn refund_payment(
        &self,
        session_id: &str,
        amount: Money,
    ) -> PaymentResult<PaymentSession> {
        let (_guard, mut session) = self.locked_session(session_id).await?;
        if decide(PaymentOperation::Refund, &session)? == Decision::NoOp
            && refund_is_reflected(&session, amount)
        {
            debug!(session_id = %session.id, "Refund already reflected");
            return Ok(session);
        }
        check_refund(&session, amount)?;

        let adapter = self.registry.get(&session.provider_id)?;
        let capture_id = match session.capture_id.clone() {
            Some(capture_id) => capture_id,
            None => {
                let reference = require_reference(&session, PaymentOperation::Refund)?;
                let order = match adapter.get_order(&reference).await {
                    Ok(order) => order,
                    Err(err) => return Err(self.fail(session, PaymentOperation::Refund, err).await),
                };
                let Some(capture_id) = order.capture_id else {
                    let err = PaymentError::NotFound(format!("capture for order {}", reference));
                    return Err(self.fail(session, PaymentOperation::Refund, err).await);
                };
                session.capture_id = Some(capture_id.clone());
                capture_id
            }
        };

        // Same balance and amount on a retry yields the same key
        let key = format!(
            "{}-refund-{}-{}",
            session.id, session.refunded_amount, amount.amount
        );

        match adapter.refund_capture(&capture_id, amount, &key).await {
            Ok(refund) => {
                clear_error(&mut session);
                if let Value::Array(refunds) = session
                    .raw_provider_data
                    .entry("refunds")
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    refunds.push(refund.raw);
                }
                apply_observation(
                    &mut session,
                    Observation::Refunded {
                        refund_id: refund.refund_id,
                        amount: amount.amount,
                    },
                );
            }
            Err(err) => return Err(self.fail(session, PaymentOperation::Refund, err).await),
        }

        self.commit(PaymentOperation::Refund, &session).await?;
        Ok(session)
    }

    /// Current status, reconciled with the gateway.
    ///
    /// This read is retried on transient failures. When the gateway cannot
    /// be reached the stored status is returned.
    pub async fn get_payment_status(&self, session_id: &str) -> PaymentResult<PaymentStatus> {
        let (_guard, mut session) = self.locked_session(session_id).await?;
        let Some(reference) = session.gateway_reference.clone() else {
            return Ok(session.status);
        };
        if session.status.is_terminal() {
            return Ok(session.status);
        }

        let adapter = self.registry.get(&session.provider_id)?;
        match self.poll_order(adapter.as_ref(), &reference).await {
            Ok(order) => {
                let observation = order_observation(&order);
                if apply_observation(&mut session, observation) == Applied::Changed {
                    session.record_raw("order", order.raw);
                    self.store.save(&session).await?;
                }
            }
            Err(err) => {
                warn!(
                    session_id = %session.id,
                    error = %err,
                    "Could not reconcile with gateway; reporting stored status"
                );
            }
        }
        Ok(session.status)
    }

    /// Stored session, without contacting the gateway
    pub async fn retrieve_payment(&self, session_id: &str) -> PaymentResult<PaymentSession> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| PaymentError::SessionNotFound(session_id.to_string()))
    }

    /// Verify and apply a webhook sent by `provider_id`
    pub async fn handle_webhook_event(
        &self,
        provider_id: &str,
        request: &WebhookRequest,
    ) -> PaymentResult<WebhookOutcome> {
        let adapter = self.registry.get(provider_id)?;
        self.reconciler.reconcile(adapter.as_ref(), request).await
    }

    async fn locked_session(
        &self,
        session_id: &str,
    ) -> PaymentResult<(OwnedMutexGuard<()>, PaymentSession)> {
        let guard = self.locks.acquire(session_id).await;
        let session = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| PaymentError::SessionNotFound(session_id.to_string()))?;
        Ok((guard, session))
    }

    async fn poll_order(
        &self,
        adapter: &dyn PaymentGatewayAdapter,
        reference: &str,
    ) -> PaymentResult<GatewayOrder> {
        let mut attempt = 0;
        loop {
            match adapter.get_order(reference).await {
                Err(err) if err.is_transient() && attempt < self.config.status_retry_attempts => {
                    attempt += 1;
                    debug!(attempt, error = %err, "Retrying status read");
                    tokio::time::sleep(self.config.status_retry_delay()).await;
                }
                result => return result,
            }
        }
    }

    async fn commit(
        &self,
        operation: PaymentOperation,
        session: &PaymentSession,
    ) -> PaymentResult<()> {
        self.store.save(session).await?;
        if self.config.log_transactions {
            info!(
                session_id = %session.id,
                provider = %session.provider_id,
                operation = %operation,
                status = %session.status,
                amount = %session.amount,
                "Payment operation completed"
            );
        }
        Ok(())
    }

    /// Record a failed gateway mutation and hand the error back
    async fn fail(
        &self,
        mut session: PaymentSession,
        operation: PaymentOperation,
        err: PaymentError,
    ) -> PaymentError {
        if !err.marks_session_errored() {
            warn!(
                session_id = %session.id,
                operation = %operation,
                error = %err,
                "Payment operation failed"
            );
            return err;
        }

        mark_errored(&mut session, operation, &err);
        if let Err(save_err) = self.store.save(&session).await {
            error!(
                session_id = %session.id,
                error = %save_err,
                "Failed to persist errored session"
            );
        }
        err
    }
}

fn idempotency_key(session_id: &str, action: &str) -> String {
    format!("{}-{}", session_id, action)
}

fn require_reference(
    session: &PaymentSession,
    operation: PaymentOperation,
) -> PaymentResult<String> {
    session
        .gateway_reference
        .clone()
        .ok_or(PaymentError::InvalidTransition {
            operation,
            status: session.status,
        })
}

fn order_observation(order: &GatewayOrder) -> Observation {
    Observation::from_order_status(
        &order.gateway_status,
        order.capture_id.clone(),
        order.captured_amount.map(|m| m.amount),
    )
}

#[cfg(all(test, feature = "manual"))]
mod tests {
    use super::*;
    use crate::config::ManualConfig;
    use crate::providers::ManualProvider;

    fn processor() -> PaymentProcessor {
        PaymentProcessor::in_memory(
            ProviderRegistry::new().register(ManualProvider::new(ManualConfig::new("s")).unwrap()),
        )
    }

    async fn captured(processor: &PaymentProcessor) -> PaymentSession {
        processor
            .initiate_payment(
                "manual",
                InitiatePaymentRequest::new("ps_1", Money::usd(5000), "cart_1"),
            )
            .await
            .unwrap();
        processor.authorize_payment("ps_1").await.unwrap();
        processor.capture_payment("ps_1").await.unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let processor = processor();
        let session = captured(&processor).await;
        assert_eq!(session.status, PaymentStatus::Captured);
        assert_eq!(session.captured_amount, 5000);

        let session = processor
            .refund_payment("ps_1", Money::usd(2000))
            .await
            .unwrap();
        assert_eq!(session.status, PaymentStatus::PartiallyRefunded);

        let session = processor
            .refund_payment("ps_1", Money::usd(3000))
            .await
            .unwrap();
        assert_eq!(session.status, PaymentStatus::Refunded);
        assert_eq!(session.refund_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_initiate_twice_is_noop() {
        let processor = processor();
        let request = InitiatePaymentRequest::new("ps_1", Money::usd(5000), "cart_1");
        let first = processor
            .initiate_payment("manual", request.clone())
            .await
            .unwrap();
        let second = processor.initiate_payment("manual", request).await.unwrap();
        assert_eq!(first.gateway_reference, second.gateway_reference);
    }

    #[tokio::test]
    async fn test_unknown_provider_and_session() {
        let processor = processor();
        let err = processor
            .initiate_payment(
                "stripe",
                InitiatePaymentRequest::new("ps_1", Money::usd(5000), "cart_1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnknownProvider(_)));

        assert!(matches!(
            processor.capture_payment("missing").await,
            Err(PaymentError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_capture_rejected() {
        let processor = processor();
        captured(&processor).await;
        assert_eq!(
            processor.cancel_payment("ps_1").await.unwrap_err(),
            PaymentError::AlreadyCaptured
        );
    }

    #[tokio::test]
    async fn test_update_before_authorization() {
        let processor = processor();
        processor
            .initiate_payment(
                "manual",
                InitiatePaymentRequest::new("ps_1", Money::usd(5000), "cart_1"),
            )
            .await
            .unwrap();

        // Manual orders are approved on creation
        let session = processor.retrieve_payment("ps_1").await.unwrap();
        assert_eq!(session.status, PaymentStatus::Authorized);
        assert!(matches!(
            processor.update_payment("ps_1", Money::usd(6000)).await,
            Err(PaymentError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_zero_amount_rejected_before_gateway() {
        let processor = processor();
        let err = processor
            .initiate_payment(
                "manual",
                InitiatePaymentRequest::new("ps_1", Money::usd(0), "cart_1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidAmount(_)));
        assert!(processor.retrieve_payment("ps_1").await.is_err());
    }
}
