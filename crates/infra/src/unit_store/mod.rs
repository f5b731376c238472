//! Transactional unit storage boundary.
//!
//! The allocator and the lock manager compose these primitives inside a single
//! store transaction. Correctness under concurrent callers comes from the store:
//! a uniqueness constraint on `(project_id, legacy_code)` and snapshot-isolated
//! reads for lock transactions.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryUnitStore, InMemoryUnitTransaction};
pub use postgres::{PostgresUnitStore, PostgresUnitTransaction};
pub use r#trait::{Isolation, StoreError, UnitStore, UnitTransaction};
