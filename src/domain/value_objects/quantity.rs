use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// Strictly positive, finite order or position size
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Quantity(f64);

impl Quantity {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::InvalidQuantity(format!(
                "quantity must be positive, got {}",
                value
            )));
        }
        Ok(Quantity(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Truncate to the venue's lot precision. Never rounds up, so a sell
    /// can never ask for more than is held.
    pub fn floor_to(&self, decimals: u32) -> f64 {
        let factor = 10f64.powi(decimals as i32);
        // epsilon absorbs representation error such as 0.0123 * 1e8 = 1229999.99..
        (self.0 * factor + 1e-9).floor() / factor
    }

    pub fn multiply(&self, factor: f64) -> Result<Quantity, ValidationError> {
        Quantity::new(self.0 * factor)
    }
}

impl TryFrom<f64> for Quantity {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Quantity::new(value)
    }
}

impl From<Quantity> for f64 {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}
