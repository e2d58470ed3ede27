//! Payment provider integration for Mercato
//!
//! Connects the order subsystem to external payment gateways behind one
//! canonical payment lifecycle. Gateway specifics (PayPal orders, bearer
//! tokens, webhook signatures) stay inside the adapters.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       PaymentProcessor                          │
//! │  initiate | update | authorize | capture | cancel | refund      │
//! │  get_payment_status | handle_webhook_event                      │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐     │
//! │  │ SessionLocks │   │ state::decide│   │ WebhookReconciler│     │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘     │
//! │                            │                                    │
//! │                   ProviderRegistry                              │
//! │         ┌──────────────────┴──────────────────┐                 │
//! │         ▼                                     ▼                 │
//! │  ┌──────────────────────┐            ┌────────────────┐         │
//! │  │ PayPal + TokenCache  │            │     Manual     │         │
//! │  └──────────────────────┘            └────────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mercato_payments::*;
//!
//! let paypal = PayPalProvider::new(PayPalConfig::from_env()?)?;
//! let processor = PaymentProcessor::in_memory(ProviderRegistry::new().register(paypal));
//!
//! let session = processor
//!     .initiate_payment("paypal", InitiatePaymentRequest::new("ps_1", Money::usd(5000), "cart_1"))
//!     .await?;
//!
//! // After the payer approves the order
//! processor.authorize_payment(&session.id).await?;
//! processor.capture_payment(&session.id).await?;
//! processor.refund_payment(&session.id, Money::usd(2000)).await?;
//!
//! // Gateway notifications
//! let outcome = processor.handle_webhook_event("paypal", &request).await?;
//! ```

pub mod config;
pub mod error;
pub mod money;
pub mod processor;
pub mod provider;
pub mod registry;
pub mod state;
pub mod store;
pub mod token;
pub mod types;
pub mod webhook;

pub mod providers;

pub use config::*;
pub use error::*;
pub use money::*;
pub use processor::PaymentProcessor;
pub use provider::*;
pub use registry::ProviderRegistry;
pub use store::*;
pub use token::*;
pub use types::*;
pub use webhook::*;

#[cfg(feature = "manual")]
pub use providers::ManualProvider;
#[cfg(feature = "paypal")]
pub use providers::PayPalProvider;
