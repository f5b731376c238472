//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// A unit keeps its identity while moving from open to locked; two units with
/// identical codes in different projects are still different entities.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
