// Mercato - commerce building blocks for Rust
//
// The umbrella crate re-exports the optional component crates behind
// feature flags.

#[cfg(feature = "payments")]
pub use mercato_payments;

#[cfg(feature = "payments")]
pub use mercato_payments::{
    InitiatePaymentRequest, Money, PaymentError, PaymentProcessor, PaymentSession, PaymentStatus,
    ProviderRegistry,
};
