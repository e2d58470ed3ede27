//! Payment gateway adapters

#[cfg(feature = "paypal")]
pub mod paypal;

#[cfg(feature = "manual")]
pub mod manual;

#[cfg(feature = "paypal")]
pub use paypal::PayPalProvider;

#[cfg(feature = "manual")]
pub use manual::ManualProvider;
