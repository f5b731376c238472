//! Unit code domain module.
//!
//! Legacy codes, unit lifecycle (open → locked) and code planning, implemented
//! purely as deterministic domain logic (no IO, no storage, no clocks).

pub mod code;
pub mod item;
pub mod quantity;
pub mod unit;

pub use code::{plan_codes, LegacyCode, CODE_PREFIX, MIN_SUFFIX_WIDTH};
pub use item::Item;
pub use quantity::Quantity;
pub use unit::{Unit, UnitState};
