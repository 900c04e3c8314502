//! Money Conversion Module
//!
//! Amounts are held internally as signed `i64` minor units of their currency
//! (cents for USD, satoshi for BTC). The scale for each currency comes from the
//! [`CurrencyTable`]; every conversion between client decimals and minor units
//! goes through this module.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Unsupported currency: {0}")]
    UnknownCurrency(String),
}

// ============================================================================
// Currency Table
// ============================================================================

/// Largest scale whose `10^decimals` still fits an `i64`
pub const MAX_CURRENCY_DECIMALS: u32 = 18;

/// Currency code -> number of minor-unit decimals
#[derive(Debug, Clone, Default)]
pub struct CurrencyTable {
    decimals: HashMap<String, u32>,
}

impl CurrencyTable {
    pub fn new(decimals: HashMap<String, u32>) -> Self {
        let decimals = decimals
            .into_iter()
            .map(|(code, d)| (code.to_ascii_uppercase(), d))
            .collect();
        Self { decimals }
    }

    /// Decimals for a currency code (case-insensitive)
    pub fn decimals(&self, code: &str) -> Result<u32, MoneyError> {
        self.decimals
            .get(&code.to_ascii_uppercase())
            .copied()
            .ok_or_else(|| MoneyError::UnknownCurrency(code.to_string()))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.decimals.contains_key(&code.to_ascii_uppercase())
    }
}

// ============================================================================
// Parse: Client -> Internal
// ============================================================================

/// Convert a client decimal into minor units.
///
/// Rejects zero, negatives and anything finer than the currency allows;
/// there is no silent truncation.
pub fn parse_decimal(decimal: Decimal, decimals: u32) -> Result<i64, MoneyError> {
    if decimal.is_sign_negative() || decimal.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }

    let normalized = decimal.normalize();
    if normalized.scale() > decimals {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: decimals,
        });
    }

    let multiplier = Decimal::from(10i64.checked_pow(decimals).ok_or(MoneyError::Overflow)?);
    let scaled = normalized
        .checked_mul(multiplier)
        .ok_or(MoneyError::Overflow)?;

    scaled.to_i64().ok_or(MoneyError::Overflow)
}

// ============================================================================
// Format: Internal -> Client
// ============================================================================

/// Format signed minor units with full currency precision, e.g. `-70.00`
pub fn format_minor(value: i64, decimals: u32) -> String {
    match Decimal::try_from_i128_with_scale(value as i128, decimals) {
        Ok(d) => format!("{:.prec$}", d, prec = decimals as usize),
        Err(_) => value.to_string(),
    }
}

// ============================================================================
// StrictDecimal: Format-Validated Decimal at Serde Layer
// ============================================================================

/// Strict format Decimal - validates format during deserialization
///
/// - Rejects `.5` (must be `0.5`) and `5.` (must be `5.0` or `5`)
/// - Rejects scientific notation, `+` prefix, negatives, empty strings
/// - Only JSON strings are accepted
///
/// Currency precision is checked later by [`parse_decimal`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrictDecimal(Decimal);

impl StrictDecimal {
    pub fn inner(self) -> Decimal {
        self.0
    }

    pub fn from_decimal(d: Decimal) -> Self {
        Self(d)
    }
}

impl std::ops::Deref for StrictDecimal {
    type Target = Decimal;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for StrictDecimal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;

        if s.is_empty() {
            return Err(D::Error::custom("Amount cannot be empty"));
        }
        if s.starts_with('.') {
            return Err(D::Error::custom("Invalid format: use 0.5 not .5"));
        }
        if s.ends_with('.') {
            return Err(D::Error::custom("Invalid format: use 5.0 not 5."));
        }
        if s.contains('e') || s.contains('E') {
            return Err(D::Error::custom(
                "Invalid format: scientific notation not allowed",
            ));
        }
        if s.starts_with('+') {
            return Err(D::Error::custom("Invalid format: + prefix not allowed"));
        }

        let d = Decimal::from_str(&s)
            .map_err(|e| D::Error::custom(format!("Invalid decimal: {}", e)))?;

        if d.is_sign_negative() {
            return Err(D::Error::custom("Amount cannot be negative"));
        }

        Ok(StrictDecimal(d))
    }
}

impl Serialize for StrictDecimal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn table() -> CurrencyTable {
        CurrencyTable::new(
            [("USD".to_string(), 2), ("jpy".to_string(), 0)]
                .into_iter()
                .collect(),
        )
    }

    #[test]
    fn test_currency_lookup_is_case_insensitive() {
        let t = table();
        assert_eq!(t.decimals("usd"), Ok(2));
        assert_eq!(t.decimals("JPY"), Ok(0));
        assert_eq!(
            t.decimals("XYZ"),
            Err(MoneyError::UnknownCurrency("XYZ".to_string()))
        );
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal(dec("30.00"), 2), Ok(3000));
        assert_eq!(parse_decimal(dec("0.01"), 2), Ok(1));
        assert_eq!(parse_decimal(dec("100"), 0), Ok(100));
        // trailing zeros beyond the currency scale are not extra precision
        assert_eq!(parse_decimal(dec("1.500"), 2), Ok(150));
    }

    #[test]
    fn test_parse_decimal_rejections() {
        assert_eq!(parse_decimal(dec("0"), 2), Err(MoneyError::InvalidAmount));
        assert_eq!(parse_decimal(dec("-1"), 2), Err(MoneyError::InvalidAmount));
        assert_eq!(
            parse_decimal(dec("0.001"), 2),
            Err(MoneyError::PrecisionOverflow {
                provided: 3,
                max: 2
            })
        );
        assert_eq!(
            parse_decimal(dec("1.5"), 0),
            Err(MoneyError::PrecisionOverflow {
                provided: 1,
                max: 0
            })
        );
        assert_eq!(
            parse_decimal(dec("100000000000000000"), 8),
            Err(MoneyError::Overflow)
        );
    }

    #[test]
    fn test_format_minor() {
        assert_eq!(format_minor(7000, 2), "70.00");
        assert_eq!(format_minor(-3000, 2), "-30.00");
        assert_eq!(format_minor(1, 8), "0.00000001");
        assert_eq!(format_minor(42, 0), "42");
        assert_eq!(format_minor(5, 29), "5");
    }

    #[test]
    fn test_strict_decimal_format_rules() {
        let ok: StrictDecimal = serde_json::from_str("\"30.00\"").unwrap();
        assert_eq!(ok.inner(), dec("30.00"));

        for bad in ["\".5\"", "\"5.\"", "\"1e3\"", "\"+1\"", "\"-1\"", "\"\"", "30"] {
            assert!(
                serde_json::from_str::<StrictDecimal>(bad).is_err(),
                "{} should be rejected",
                bad
            );
        }
    }
}
