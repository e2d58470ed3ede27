//! Money and currency types

use crate::error::{PaymentError, PaymentResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currency codes (ISO 4217) accepted by the gateways we integrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    USD,
    EUR,
    GBP,
    JPY,
    CAD,
    AUD,
    CHF,
    MXN,
    BRL,
    SGD,
    HKD,
    NZD,
    SEK,
    NOK,
    DKK,
    PLN,
    KRW,
}

impl Currency {
    /// Uppercase ISO code, as sent on the wire
    pub fn code(&self) -> &'static str {
        match self {
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::JPY => "JPY",
            Self::CAD => "CAD",
            Self::AUD => "AUD",
            Self::CHF => "CHF",
            Self::MXN => "MXN",
            Self::BRL => "BRL",
            Self::SGD => "SGD",
            Self::HKD => "HKD",
            Self::NZD => "NZD",
            Self::SEK => "SEK",
            Self::NOK => "NOK",
            Self::DKK => "DKK",
            Self::PLN => "PLN",
            Self::KRW => "KRW",
        }
    }

    /// Digits after the decimal point in the gateway representation
    pub fn decimals(&self) -> u32 {
        match self {
            Self::JPY | Self::KRW => 0,
            _ => 2,
        }
    }

    /// Parse a code in any case ("usd", "USD")
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_uppercase().as_str() {
            "USD" => Some(Self::USD),
            "EUR" => Some(Self::EUR),
            "GBP" => Some(Self::GBP),
            "JPY" => Some(Self::JPY),
            "CAD" => Some(Self::CAD),
            "AUD" => Some(Self::AUD),
            "CHF" => Some(Self::CHF),
            "MXN" => Some(Self::MXN),
            "BRL" => Some(Self::BRL),
            "SGD" => Some(Self::SGD),
            "HKD" => Some(Self::HKD),
            "NZD" => Some(Self::NZD),
            "SEK" => Some(Self::SEK),
            "NOK" => Some(Self::NOK),
            "DKK" => Some(Self::DKK),
            "PLN" => Some(Self::PLN),
            "KRW" => Some(Self::KRW),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Amount in minor units with its currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Amount in smallest currency unit (cents, pence, yen)
    pub amount: i64,
    /// Currency
    pub currency: Currency,
}

impl Money {
    /// Create a new money amount from minor units
    pub fn new(amount: i64, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// USD amount from cents
    pub fn usd(cents: i64) -> Self {
        Self::new(cents, Currency::USD)
    }

    /// Parse a gateway decimal string ("50.00") into minor units.
    ///
    /// Fails if the value carries more precision than the currency allows.
    pub fn from_gateway_value(value: &str, currency: Currency) -> PaymentResult<Self> {
        let decimal = Decimal::from_str(value.trim())
            .map_err(|e| PaymentError::InvalidAmount(format!("{}: {}", value, e)))?;
        let scaled = decimal
            .checked_mul(Decimal::from(10i64.pow(currency.decimals())))
            .ok_or_else(|| PaymentError::InvalidAmount(format!("{} is out of range", value)))?;
        if scaled.fract() != Decimal::ZERO {
            return Err(PaymentError::InvalidAmount(format!(
                "{} has too many decimals for {}",
                value, currency
            )));
        }
        let amount = i64::try_from(scaled)
            .map_err(|_| PaymentError::InvalidAmount(format!("{} is out of range", value)))?;
        Ok(Self { amount, currency })
    }

    /// Decimal string in the gateway format: "50.00", or "1000" for JPY
    pub fn to_gateway_value(&self) -> String {
        let mut decimal = Decimal::from(self.amount);
        decimal
            .set_scale(self.currency.decimals())
            .unwrap_or_default();
        format!("{:.prec$}", decimal, prec = self.currency.decimals() as usize)
    }

    /// Require a strictly positive amount
    pub fn ensure_positive(&self) -> PaymentResult<()> {
        if self.amount <= 0 {
            return Err(PaymentError::InvalidAmount(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }

    /// Require the same currency as `other`
    pub fn ensure_same_currency(&self, other: Currency) -> PaymentResult<()> {
        if self.currency != other {
            return Err(PaymentError::InvalidAmount(format!(
                "currency mismatch: expected {}, got {}",
                other, self.currency
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_gateway_value(), self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_value_formatting() {
        assert_eq!(Money::usd(5000).to_gateway_value(), "50.00");
        assert_eq!(Money::usd(2999).to_gateway_value(), "29.99");
        assert_eq!(Money::usd(5).to_gateway_value(), "0.05");
        assert_eq!(Money::new(1000, Currency::JPY).to_gateway_value(), "1000");
    }

    #[test]
    fn test_parse_gateway_value() {
        let money = Money::from_gateway_value("20.00", Currency::USD).unwrap();
        assert_eq!(money.amount, 2000);

        let yen = Money::from_gateway_value("1500", Currency::JPY).unwrap();
        assert_eq!(yen.amount, 1500);

        assert!(Money::from_gateway_value("1.005", Currency::USD).is_err());
        assert!(Money::from_gateway_value("abc", Currency::USD).is_err());
        assert!(matches!(
            Money::from_gateway_value("79228162514264337593543950335", Currency::USD),
            Err(PaymentError::InvalidAmount(_))
        ));
        assert!(matches!(
            Money::from_gateway_value("92233720368547758.08", Currency::USD),
            Err(PaymentError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_currency_codes() {
        assert_eq!(Currency::from_code("usd"), Some(Currency::USD));
        assert_eq!(Currency::from_code("XXX"), None);
        assert_eq!(serde_json::to_string(&Currency::EUR).unwrap(), "\"EUR\"");
    }

    #[test]
    fn test_amount_guards() {
        assert!(Money::usd(0).ensure_positive().is_err());
        assert!(Money::usd(1).ensure_positive().is_ok());
        assert!(Money::usd(1).ensure_same_currency(Currency::EUR).is_err());
    }
}
