//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value** — identity does
/// not matter, only the values do. A device identity or a priority band is a
/// value object; a queue item (which has an id and a lifecycle) is an entity.
///
/// To "modify" a value object, construct a new one. This keeps them safe to
/// share across threads and predictable to reason about.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct DeviceIdentity(String);
///
/// impl ValueObject for DeviceIdentity {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
