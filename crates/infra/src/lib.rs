//! Infrastructure layer: unit storage, code allocation, export locking, config.

pub mod allocator;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod lock_manager;
pub mod retry;
pub mod unit_store;

mod integration_tests;

pub use allocator::CodeAllocator;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{AllocatorConfig, ConfigError, StoreConfig};
pub use error::UnitError;
pub use export::{ExportReader, ExportSnapshot};
pub use lock_manager::{LockManager, LockOutcome};
pub use retry::{BackoffStrategy, RetryPolicy};
