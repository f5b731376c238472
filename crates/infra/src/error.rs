//! Error taxonomy surfaced by the allocator and the lock manager.

use thiserror::Error;

use unitledger_core::DomainError;

use crate::unit_store::StoreError;

/// Failure of an allocation or lock operation.
///
/// Only [`UnitError::Conflict`] is transient; the allocator and lock manager
/// retry it themselves. Everything else goes straight back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    /// Caller asked for fewer than one unit.
    #[error("invalid quantity: {0} (must be >= 1)")]
    InvalidQuantity(i64),

    /// Project or item missing, or the item belongs to a different project.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent writer won the race for the same codes or rows.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Conflicts persisted through every retry.
    #[error("allocation failed after {attempts} attempts: {last_error}")]
    AllocationFailed { attempts: u32, last_error: String },

    /// Storage or transport failure, including timeouts.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Input or stored data broke a domain rule.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl UnitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UnitError::Conflict(_))
    }
}

impl From<StoreError> for UnitError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => UnitError::Conflict(msg),
            StoreError::NotFound(msg) => UnitError::NotFound(msg),
            StoreError::Unavailable(msg) => UnitError::StoreUnavailable(msg),
            StoreError::Corrupt(msg) => UnitError::InvariantViolation(msg),
        }
    }
}

impl From<DomainError> for UnitError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidQuantity(q) => UnitError::InvalidQuantity(q),
            DomainError::NotFound(msg) => UnitError::NotFound(msg),
            DomainError::Conflict(msg) => UnitError::Conflict(msg),
            DomainError::Validation(msg)
            | DomainError::InvalidCode(msg)
            | DomainError::InvalidId(msg)
            | DomainError::InvariantViolation(msg) => UnitError::InvariantViolation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(UnitError::from(StoreError::Conflict("dup".into())).is_retryable());
        assert!(!UnitError::from(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!UnitError::InvalidQuantity(0).is_retryable());
        assert!(
            !UnitError::AllocationFailed {
                attempts: 3,
                last_error: "dup".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn domain_errors_keep_their_category() {
        assert_eq!(
            UnitError::from(DomainError::InvalidQuantity(-1)),
            UnitError::InvalidQuantity(-1)
        );
        assert!(matches!(
            UnitError::from(DomainError::invariant("overflow")),
            UnitError::InvariantViolation(_)
        ));
    }
}
