use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// Strictly positive, finite price
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::InvalidPrice(format!(
                "price must be positive, got {}",
                value
            )));
        }
        Ok(Price(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Round to the venue's price precision
    pub fn round_to(&self, decimals: u32) -> f64 {
        let factor = 10f64.powi(decimals as i32);
        (self.0 * factor).round() / factor
    }

    /// Relative move from `self` to `other`, in percent
    pub fn pct_change_to(&self, other: Price) -> f64 {
        (other.0 - self.0) / self.0 * 100.0
    }
}

impl TryFrom<f64> for Price {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Price::new(value)
    }
}

impl From<Price> for f64 {
    fn from(price: Price) -> Self {
        price.0
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_new_valid() {
        let price = Price::new(100.0).unwrap();
        assert_eq!(price.value(), 100.0);
    }

    #[test]
    fn test_price_rejects_zero_and_negative() {
        assert!(Price::new(0.0).is_err());
        assert!(Price::new(-10.0).is_err());
    }

    #[test]
    fn test_price_rejects_non_finite() {
        assert_eq!(Price::new(f64::NAN), Err(ValidationError::MustBeFinite));
        assert_eq!(Price::new(f64::INFINITY), Err(ValidationError::MustBeFinite));
    }

    #[test]
    fn test_round_to_precision() {
        let price = Price::new(101.23456).unwrap();
        assert_eq!(price.round_to(2), 101.23);
        assert_eq!(price.round_to(0), 101.0);
    }

    #[test]
    fn test_pct_change() {
        let entry = Price::new(100.0).unwrap();
        let exit = Price::new(102.5).unwrap();
        assert!((entry.pct_change_to(exit) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_deserialize_rejects_negative() {
        assert!(serde_json::from_str::<Price>("-1.0").is_err());
        assert_eq!(serde_json::from_str::<Price>("42.5").unwrap().value(), 42.5);
    }
}
