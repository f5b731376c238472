use serde::{Deserialize, Serialize};

use unitledger_core::{DomainError, DomainResult, ValueObject};

/// Number of units to allocate for an item (always >= 1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Quantity(u32);

impl ValueObject for Quantity {}

impl Quantity {
    /// Validate a caller-supplied quantity. Anything below 1 is an input error.
    pub fn new(value: i64) -> DomainResult<Self> {
        if value < 1 {
            return Err(DomainError::InvalidQuantity(value));
        }
        u32::try_from(value)
            .map(Self)
            .map_err(|_| DomainError::validation(format!("quantity {value} is too large")))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for Quantity {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for i64 {
    fn from(value: Quantity) -> Self {
        i64::from(value.0)
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_negative_are_invalid_quantities() {
        assert_eq!(Quantity::new(0), Err(DomainError::InvalidQuantity(0)));
        assert_eq!(Quantity::new(-3), Err(DomainError::InvalidQuantity(-3)));
    }

    #[test]
    fn oversized_quantity_is_a_validation_error() {
        assert!(matches!(
            Quantity::new(i64::from(u32::MAX) + 1),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn deserialization_validates() {
        assert_eq!(serde_json::from_str::<Quantity>("5").unwrap().get(), 5);
        assert!(serde_json::from_str::<Quantity>("0").is_err());
    }
}
