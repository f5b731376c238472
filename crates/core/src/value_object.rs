//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attributes. A legacy code
/// such as `LEG0007` is a value object: any two `LEG0007` values are equal, and
/// "changing" one means constructing a new value. A unit, by contrast, is an
/// entity (see [`crate::Entity`]).
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Quantity(u32);
///
/// impl ValueObject for Quantity {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
