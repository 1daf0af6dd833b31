//! Device identity value type.
//!
//! Every queued change records which device captured it. An identity can be
//! random (a device introducing itself for the first time), explicit (a
//! device that already holds one), or derived deterministically from the
//! (user-agent, user) pair so repeated calls from the same device/user
//! collide on purpose.

use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fieldops_core::{DomainError, UserId, ValueObject};

/// Namespace for derived device identities (UUIDv5 hashing).
const DEVICE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x1d, 0x42, 0xa7, 0x5c, 0x09, 0x4b, 0x3e, 0x9a, 0x61, 0xd4, 0x27, 0x80, 0x55, 0xe6,
    0x13,
]);

/// Opaque identifier of the device a change originated on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub const MAX_LEN: usize = 100;

    /// Validated explicit identity. Must be non-blank and at most
    /// [`Self::MAX_LEN`] characters.
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("device identity must not be empty"));
        }
        if value.chars().count() > Self::MAX_LEN {
            return Err(DomainError::validation(format!(
                "device identity exceeds {} characters",
                Self::MAX_LEN
            )));
        }
        Ok(Self(value))
    }

    /// Fresh random identity for a device that has not introduced itself.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Deterministic identity: the same (user-agent, user) pair always maps
    /// to the same value.
    pub fn derive(user_agent: &str, user_id: &UserId) -> Self {
        let seed = format!("{user_agent}:{user_id}");
        Self(Uuid::new_v5(&DEVICE_NAMESPACE, seed.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ValueObject for DeviceIdentity {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_identity_is_validated() {
        assert!(DeviceIdentity::new("tablet-07").is_ok());
        assert!(DeviceIdentity::new("").is_err());
        assert!(DeviceIdentity::new("   ").is_err());
        assert!(DeviceIdentity::new("x".repeat(101)).is_err());
        assert!(DeviceIdentity::new("x".repeat(100)).is_ok());
    }

    #[test]
    fn generated_identities_are_distinct() {
        assert_ne!(DeviceIdentity::generate(), DeviceIdentity::generate());
    }

    #[test]
    fn derived_identity_is_stable_per_device_user_pair() {
        let user = UserId::new();
        let other = UserId::new();

        let a = DeviceIdentity::derive("Mozilla/5.0 (Android 14)", &user);
        let b = DeviceIdentity::derive("Mozilla/5.0 (Android 14)", &user);
        assert_eq!(a, b);

        assert_ne!(a, DeviceIdentity::derive("Mozilla/5.0 (Android 14)", &other));
        assert_ne!(a, DeviceIdentity::derive("Mozilla/5.0 (iOS 17)", &user));
    }
}
