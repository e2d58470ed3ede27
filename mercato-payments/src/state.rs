//! Canonical payment state machine
//!
//! ```text
//! pending ──► requires_action ──► authorized ──► captured ──► partially_refunded ──► refunded
//!    │               │                 │
//!    └───────────────┴─────────────────┴──────► canceled
//! ```
//!
//! `errored` can be entered from any state. It remembers the status it was
//! entered from and the failed operation, and only that operation (or a
//! reconciliation from the gateway) moves the session on.

use crate::{
    error::{PaymentError, PaymentResult},
    money::Money,
    types::{PaymentOperation, PaymentSession, PaymentStatus, SessionError},
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

/// Map a gateway status string to the canonical status.
///
/// Unknown values map to `Pending` so that new gateway statuses do not
/// surface as errors.
pub fn canonical_status(gateway_status: &str) -> PaymentStatus {
    match gateway_status.to_ascii_uppercase().as_str() {
        "APPROVED" => PaymentStatus::Authorized,
        "COMPLETED" | "CAPTURED" => PaymentStatus::Captured,
        "CANCELLED" | "CANCELED" | "VOIDED" => PaymentStatus::Canceled,
        "PAYER_ACTION_REQUIRED" => PaymentStatus::RequiresAction,
        _ => PaymentStatus::Pending,
    }
}

/// What to do for an operation, decided before any gateway call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Call the gateway
    Proceed,
    /// State already satisfies the request; return the session as is
    NoOp,
}

/// Evaluate the transition table for `operation` against `session`.
pub fn decide(operation: PaymentOperation, session: &PaymentSession) -> PaymentResult<Decision> {
    use PaymentOperation as Op;
    use PaymentStatus as S;

    if session.status == S::Errored
        && let Some(err) = &session.last_error
        && err.operation != operation
        && operation != Op::Cancel
    {
        return Err(PaymentError::InvalidTransition {
            operation,
            status: S::Errored,
        });
    }

    let status = session.effective_status();
    let invalid = || PaymentError::InvalidTransition { operation, status };

    match (operation, status) {
        (Op::Initiate, S::Pending) if session.gateway_reference.is_none() => Ok(Decision::Proceed),
        (Op::Initiate, _) if session.gateway_reference.is_some() => Ok(Decision::NoOp),
        (Op::Initiate, _) => Err(invalid()),

        (Op::Update, S::Pending | S::RequiresAction) => Ok(Decision::Proceed),
        (Op::Update, _) => Err(invalid()),

        (Op::Authorize, S::Pending | S::RequiresAction) => Ok(Decision::Proceed),
        (Op::Authorize, S::Authorized) => Ok(Decision::NoOp),
        (Op::Authorize, _) => Err(invalid()),

        (Op::Capture, S::Pending | S::RequiresAction) => Err(PaymentError::NotAuthorized),
        (Op::Capture, S::Authorized) => Ok(Decision::Proceed),
        (Op::Capture, S::Captured | S::PartiallyRefunded) => Ok(Decision::NoOp),
        (Op::Capture, _) => Err(invalid()),

        (Op::Cancel, S::Pending | S::RequiresAction | S::Authorized) => Ok(Decision::Proceed),
        (Op::Cancel, S::Captured | S::PartiallyRefunded) => Err(PaymentError::AlreadyCaptured),
        (Op::Cancel, S::Canceled | S::Refunded) => Ok(Decision::NoOp),
        (Op::Cancel, _) => Err(invalid()),

        (Op::Refund, S::Captured | S::PartiallyRefunded) => Ok(Decision::Proceed),
        // Only a no-op for amounts already refunded; see `refund_is_reflected`
        (Op::Refund, S::Refunded) => Ok(Decision::NoOp),
        (Op::Refund, _) => Err(invalid()),
    }
}

/// A refund request against a fully refunded session that asks for no more
/// than what was already refunded.
pub fn refund_is_reflected(session: &PaymentSession, amount: Money) -> bool {
    session.effective_status() == PaymentStatus::Refunded
        && amount.currency == session.currency()
        && amount.amount > 0
        && amount.amount <= session.refunded_amount
}

/// Validate a refund against the captured balance. Runs before any
/// network call.
pub fn check_refund(session: &PaymentSession, amount: Money) -> PaymentResult<()> {
    amount.ensure_positive()?;
    amount.ensure_same_currency(session.currency())?;
    let available = session.refundable_amount();
    if amount.amount > available {
        return Err(PaymentError::InsufficientCaptureAmount {
            requested: amount.amount,
            available,
        });
    }
    Ok(())
}

/// Gateway-observed state to converge a session towards
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Payer still has to act (approve, 3DS, ...)
    RequiresAction,
    /// Payer approved; funds can be captured
    Authorized,
    /// Funds captured
    Captured {
        capture_id: Option<String>,
        amount: Option<i64>,
    },
    /// One refund against the capture
    Refunded { refund_id: String, amount: i64 },
    /// Order voided or expired
    Canceled,
    /// Gateway reports an unrecoverable condition
    Failed { reason: String },
    /// Nothing actionable
    Unchanged,
}

impl Observation {
    /// Observation for a plain order status read from the gateway
    pub fn from_order_status(
        gateway_status: &str,
        capture_id: Option<String>,
        amount: Option<i64>,
    ) -> Self {
        match canonical_status(gateway_status) {
            PaymentStatus::RequiresAction => Self::RequiresAction,
            PaymentStatus::Authorized => Self::Authorized,
            PaymentStatus::Captured => Self::Captured { capture_id, amount },
            PaymentStatus::Canceled => Self::Canceled,
            _ => Self::Unchanged,
        }
    }
}

/// Whether an observation changed the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
}

fn rank(status: PaymentStatus) -> u8 {
    match status {
        PaymentStatus::Pending | PaymentStatus::Errored => 0,
        PaymentStatus::RequiresAction => 1,
        PaymentStatus::Authorized => 2,
        PaymentStatus::Captured => 3,
        PaymentStatus::PartiallyRefunded => 4,
        PaymentStatus::Refunded => 5,
        PaymentStatus::Canceled => 6,
    }
}

/// Converge `session` towards what the gateway reports.
///
/// Used by both the synchronous operations and the webhook path. Observations
/// behind the current state, duplicates and moves out of a terminal state are
/// absorbed as `Applied::Unchanged`.
pub fn apply_observation(session: &mut PaymentSession, observation: Observation) -> Applied {
    let current = session.effective_status();
    let forward = |target: PaymentStatus| {
        current != PaymentStatus::Canceled && rank(target) > rank(current)
    };

    match observation {
        Observation::Unchanged => Applied::Unchanged,
        Observation::RequiresAction if forward(PaymentStatus::RequiresAction) => {
            set_status(session, PaymentStatus::RequiresAction)
        }
        Observation::Authorized if forward(PaymentStatus::Authorized) => {
            set_status(session, PaymentStatus::Authorized)
        }
        Observation::Captured {
            amount: Some(amount),
            ..
        } if amount <= 0 => {
            warn!(
                session_id = %session.id,
                amount,
                "Capture reported with a non-positive amount; ignoring"
            );
            Applied::Unchanged
        }
        Observation::Captured { capture_id, amount } if forward(PaymentStatus::Captured) => {
            let captured = amount.unwrap_or(session.amount.amount).min(session.amount.amount);
            session.captured_amount = captured;
            if session.capture_id.is_none() {
                session.capture_id = capture_id;
            }
            set_status(session, PaymentStatus::Captured)
        }
        Observation::Captured { capture_id, .. } => {
            if session.capture_id.is_none() && capture_id.is_some() && current.is_captured() {
                session.capture_id = capture_id;
                session.touch();
                Applied::Changed
            } else {
                Applied::Unchanged
            }
        }
        Observation::Refunded { refund_id, amount } => {
            apply_refund(session, current, refund_id, amount)
        }
        Observation::Canceled
            if matches!(
                current,
                PaymentStatus::Pending | PaymentStatus::RequiresAction | PaymentStatus::Authorized
            ) =>
        {
            set_status(session, PaymentStatus::Canceled)
        }
        Observation::Failed { reason } if !current.is_captured() && !current.is_terminal() => {
            let operation = match current {
                PaymentStatus::Authorized => PaymentOperation::Capture,
                _ => PaymentOperation::Authorize,
            };
            record_error(session, operation, "gateway_declined", reason);
            Applied::Changed
        }
        other => {
            debug!(
                session_id = %session.id,
                status = %current,
                observation = ?other,
                "Observation already reflected or out of order; ignoring"
            );
            Applied::Unchanged
        }
    }
}

fn apply_refund(
    session: &mut PaymentSession,
    current: PaymentStatus,
    refund_id: String,
    amount: i64,
) -> Applied {
    if session.refund_ids.contains(&refund_id) {
        return Applied::Unchanged;
    }
    if !current.is_captured() {
        warn!(
            session_id = %session.id,
            status = %current,
            refund_id = %refund_id,
            "Refund reported for a session that is not captured"
        );
        return Applied::Unchanged;
    }
    let total = session.refunded_amount + amount;
    if amount <= 0 || total > session.captured_amount {
        warn!(
            session_id = %session.id,
            refund_id = %refund_id,
            amount,
            refundable = session.refundable_amount(),
            "Refund would exceed captured amount; ignoring"
        );
        return Applied::Unchanged;
    }

    session.refund_ids.push(refund_id);
    session.refunded_amount = total;
    let status = if total == session.captured_amount {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::PartiallyRefunded
    };
    set_status(session, status);
    Applied::Changed
}

fn set_status(session: &mut PaymentSession, status: PaymentStatus) -> Applied {
    let from = session.status;
    session.status = status;
    session.last_error = None;
    session.touch();
    info!(session_id = %session.id, from = %from, to = %status, "Payment status changed");
    Applied::Changed
}

/// Leave `errored` once the failed operation went through on a retry.
pub fn clear_error(session: &mut PaymentSession) {
    if session.status == PaymentStatus::Errored {
        let restored = session.effective_status();
        set_status(session, restored);
    }
}

/// Put the session in `errored`, remembering what failed.
pub fn mark_errored(session: &mut PaymentSession, operation: PaymentOperation, err: &PaymentError) {
    record_error(session, operation, err.code(), err.to_string());
}

fn record_error(
    session: &mut PaymentSession,
    operation: PaymentOperation,
    code: &str,
    message: String,
) {
    let previous_status = session.effective_status();
    session.record_raw(
        "last_error",
        json!({
            "operation": operation,
            "code": code,
            "message": message,
        }),
    );
    warn!(
        session_id = %session.id,
        operation = %operation,
        previous_status = %previous_status,
        error = %message,
        "Payment session errored"
    );
    session.last_error = Some(SessionError {
        operation,
        previous_status,
        code: code.to_string(),
        message,
        occurred_at: Utc::now(),
    });
    session.status = PaymentStatus::Errored;
    session.touch();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;

    fn session(status: PaymentStatus) -> PaymentSession {
        let mut s = PaymentSession::new("ps_1", "paypal", "cart_1", Money::usd(5000));
        s.gateway_reference = Some("ORD-1".into());
        s.status = status;
        if status.is_captured() {
            s.captured_amount = 5000;
            s.capture_id = Some("CAP-1".into());
        }
        if status == PaymentStatus::Refunded {
            s.refunded_amount = 5000;
        }
        s
    }

    #[test]
    fn test_gateway_status_lookup() {
        assert_eq!(canonical_status("APPROVED"), PaymentStatus::Authorized);
        assert_eq!(canonical_status("COMPLETED"), PaymentStatus::Captured);
        assert_eq!(canonical_status("CANCELLED"), PaymentStatus::Canceled);
        assert_eq!(canonical_status("CREATED"), PaymentStatus::Pending);
        assert_eq!(canonical_status("SOMETHING_NEW"), PaymentStatus::Pending);
    }

    #[test]
    fn test_capture_table() {
        use PaymentStatus::*;
        assert_eq!(
            decide(PaymentOperation::Capture, &session(Pending)),
            Err(PaymentError::NotAuthorized)
        );
        assert_eq!(
            decide(PaymentOperation::Capture, &session(Authorized)),
            Ok(Decision::Proceed)
        );
        assert_eq!(
            decide(PaymentOperation::Capture, &session(Captured)),
            Ok(Decision::NoOp)
        );
        assert!(matches!(
            decide(PaymentOperation::Capture, &session(Canceled)),
            Err(PaymentError::InvalidTransition { .. })
        ));
        assert_eq!(
            decide(PaymentOperation::Capture, &session(Refunded)),
            Err(PaymentError::InvalidTransition {
                operation: PaymentOperation::Capture,
                status: Refunded
            })
        );
    }

    #[test]
    fn test_cancel_table() {
        use PaymentStatus::*;
        assert_eq!(
            decide(PaymentOperation::Cancel, &session(Authorized)),
            Ok(Decision::Proceed)
        );
        assert_eq!(
            decide(PaymentOperation::Cancel, &session(Captured)),
            Err(PaymentError::AlreadyCaptured)
        );
        assert_eq!(
            decide(PaymentOperation::Cancel, &session(PartiallyRefunded)),
            Err(PaymentError::AlreadyCaptured)
        );
        assert_eq!(
            decide(PaymentOperation::Cancel, &session(Canceled)),
            Ok(Decision::NoOp)
        );
    }

    #[test]
    fn test_authorize_and_refund_table() {
        use PaymentStatus::*;
        assert_eq!(
            decide(PaymentOperation::Authorize, &session(Authorized)),
            Ok(Decision::NoOp)
        );
        assert!(decide(PaymentOperation::Authorize, &session(Captured)).is_err());
        assert!(decide(PaymentOperation::Refund, &session(Authorized)).is_err());
        assert_eq!(
            decide(PaymentOperation::Refund, &session(Refunded)),
            Ok(Decision::NoOp)
        );
    }

    #[test]
    fn test_refund_on_refunded_session_depends_on_amount() {
        let s = session(PaymentStatus::Refunded);
        assert!(refund_is_reflected(&s, Money::usd(5000)));
        assert!(refund_is_reflected(&s, Money::usd(2000)));
        assert!(!refund_is_reflected(&s, Money::usd(6000)));
        assert!(!refund_is_reflected(&s, Money::new(5000, crate::money::Currency::EUR)));
        assert_eq!(
            check_refund(&s, Money::usd(6000)),
            Err(PaymentError::InsufficientCaptureAmount {
                requested: 6000,
                available: 0
            })
        );

        let partial = session(PaymentStatus::Captured);
        assert!(!refund_is_reflected(&partial, Money::usd(1000)));
    }

    #[test]
    fn test_errored_session_allows_only_same_operation() {
        let mut s = session(PaymentStatus::Authorized);
        mark_errored(
            &mut s,
            PaymentOperation::Capture,
            &PaymentError::GatewayUnavailable("timeout".into()),
        );
        assert_eq!(s.status, PaymentStatus::Errored);
        assert_eq!(decide(PaymentOperation::Capture, &s), Ok(Decision::Proceed));
        assert!(decide(PaymentOperation::Refund, &s).is_err());
        assert_eq!(decide(PaymentOperation::Cancel, &s), Ok(Decision::Proceed));
        assert!(s.raw_provider_data.contains_key("last_error"));

        clear_error(&mut s);
        assert_eq!(s.status, PaymentStatus::Authorized);
        assert!(s.last_error.is_none());
    }

    #[test]
    fn test_refund_check_happens_locally() {
        let s = session(PaymentStatus::Captured);
        assert_eq!(
            check_refund(&s, Money::usd(6000)),
            Err(PaymentError::InsufficientCaptureAmount {
                requested: 6000,
                available: 5000
            })
        );
        assert!(check_refund(&s, Money::usd(5000)).is_ok());
        assert!(check_refund(&s, Money::usd(0)).is_err());
    }

    #[test]
    fn test_observations_converge() {
        let mut s = session(PaymentStatus::Pending);
        assert_eq!(
            apply_observation(&mut s, Observation::Authorized),
            Applied::Changed
        );
        assert_eq!(
            apply_observation(&mut s, Observation::Authorized),
            Applied::Unchanged
        );

        let captured = Observation::Captured {
            capture_id: Some("CAP-1".into()),
            amount: Some(5000),
        };
        assert_eq!(apply_observation(&mut s, captured.clone()), Applied::Changed);
        assert_eq!(apply_observation(&mut s, captured), Applied::Unchanged);
        // Late approval after capture is absorbed
        assert_eq!(
            apply_observation(&mut s, Observation::Authorized),
            Applied::Unchanged
        );
        assert_eq!(s.status, PaymentStatus::Captured);
        assert_eq!(s.captured_amount, 5000);
    }

    #[test]
    fn test_non_positive_capture_amount_ignored() {
        let mut s = session(PaymentStatus::Authorized);
        for amount in [-100, 0] {
            let observation = Observation::Captured {
                capture_id: Some("CAP-1".into()),
                amount: Some(amount),
            };
            assert_eq!(apply_observation(&mut s, observation), Applied::Unchanged);
        }
        assert_eq!(s.status, PaymentStatus::Authorized);
        assert_eq!(s.captured_amount, 0);
        assert!(s.refunded_amount <= s.captured_amount);
    }

    #[test]
    fn test_refund_observations() {
        let mut s = session(PaymentStatus::Captured);
        let partial = Observation::Refunded {
            refund_id: "RF-1".into(),
            amount: 2000,
        };
        assert_eq!(apply_observation(&mut s, partial.clone()), Applied::Changed);
        assert_eq!(s.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(apply_observation(&mut s, partial), Applied::Unchanged);
        assert_eq!(s.refunded_amount, 2000);

        let too_much = Observation::Refunded {
            refund_id: "RF-2".into(),
            amount: 4000,
        };
        assert_eq!(apply_observation(&mut s, too_much), Applied::Unchanged);

        let rest = Observation::Refunded {
            refund_id: "RF-3".into(),
            amount: 3000,
        };
        assert_eq!(apply_observation(&mut s, rest), Applied::Changed);
        assert_eq!(s.status, PaymentStatus::Refunded);
        assert!(s.refunded_amount <= s.captured_amount);
    }

    #[test]
    fn test_cancel_observation_never_undoes_capture() {
        let mut s = session(PaymentStatus::Captured);
        assert_eq!(
            apply_observation(&mut s, Observation::Canceled),
            Applied::Unchanged
        );
        assert_eq!(s.status, PaymentStatus::Captured);

        let mut c = session(PaymentStatus::Canceled);
        assert_eq!(
            apply_observation(&mut c, Observation::Authorized),
            Applied::Unchanged
        );
    }
}
