//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// An entity is defined by its identifier, not its attribute values: a queue
/// item whose status changes is still the same queue item.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
