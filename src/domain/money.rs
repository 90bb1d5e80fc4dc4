use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PaymentError;

/// ISO-4217 currency code, upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, PaymentError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PaymentError::InvalidInput(format!(
                "invalid currency code '{}'",
                code
            )));
        }
        Ok(Self(code))
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Number of decimal places the currency allows.
    pub fn minor_units(&self) -> i64 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "UGX" => 0,
            "BHD" | "KWD" | "OMR" | "JOD" | "TND" | "IQD" | "LYD" => 3,
            _ => 2,
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A strictly positive monetary amount, validated against a currency's scale.
///
/// Comparisons are exact decimal comparisons; `10.5` and `10.50` are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Amount(BigDecimal);

impl Amount {
    pub fn new(value: BigDecimal, currency: &Currency) -> Result<Self, PaymentError> {
        if value <= BigDecimal::from(0) {
            return Err(PaymentError::InvalidInput(
                "amount must be positive".to_string(),
            ));
        }
        let scale = currency.minor_units();
        if value.with_scale(scale) != value {
            return Err(PaymentError::InvalidInput(format!(
                "amount {} has more than {} decimal places for {}",
                value, scale, currency
            )));
        }
        Ok(Self(value.with_scale(scale)))
    }

    pub fn value(&self) -> &BigDecimal {
        &self.0
    }

    pub fn into_inner(self) -> BigDecimal {
        self.0
    }
}

impl From<Amount> for BigDecimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
