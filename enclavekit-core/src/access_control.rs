//! User-presence policies and the flags the backend enforces for them.
//!
//! [`AccessControl::describe`] and [`AccessControl::enforcement_flag`] read from
//! one table, so a policy's namespace suffix and its backend flag cannot drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Backend enforcement flag attached to items at creation time.
///
/// The bit values follow the platform access-control create flags so a native
/// backend can pass them through unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessControlFlags(u32);

impl AccessControlFlags {
    /// Biometry or device passcode.
    pub const USER_PRESENCE: Self = Self(1 << 0);
    /// Any enrolled biometry, surviving enrollment changes.
    pub const BIOMETRY_ANY: Self = Self(1 << 1);
    /// The currently enrolled biometry set; invalidated when enrollment changes.
    pub const BIOMETRY_CURRENT_SET: Self = Self(1 << 3);
    /// Device passcode only.
    pub const DEVICE_PASSCODE: Self = Self(1 << 4);

    /// Returns the raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Rebuilds flags from raw bits, e.g. as reported by a backend.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for AccessControlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessControlFlags({:#x})", self.0)
    }
}

/// The user-presence proof a store requires before releasing an item.
///
/// The ordering only exists so policies can be enumerated; it carries no meaning.
///
/// Policies parse from and display as snake case, so they can be chosen from
/// configuration:
///
/// ```rust
/// use enclavekit_core::AccessControl;
///
/// let policy: AccessControl = "biometric_current_set".parse().unwrap();
/// assert_eq!(policy, AccessControl::BiometricCurrentSet);
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccessControl {
    /// Biometry when available, otherwise the device passcode.
    UserPresence,
    /// Any enrolled biometry. Items survive enrollment changes.
    BiometricAny,
    /// The current biometry set. Items become inaccessible when enrollment changes.
    BiometricCurrentSet,
    /// The device passcode.
    DevicePasscode,
}

impl AccessControl {
    /// Single mapping from policy to namespace suffix and enforcement flag.
    ///
    /// The suffixes are part of every stored item's service name and must never change.
    /// `UserPresence` predates policy selection and therefore has no suffix.
    const fn table(self) -> (&'static str, AccessControlFlags) {
        match self {
            Self::UserPresence => ("", AccessControlFlags::USER_PRESENCE),
            Self::BiometricAny => {
                ("_AccessControlBiometryAny", AccessControlFlags::BIOMETRY_ANY)
            }
            Self::BiometricCurrentSet => (
                "_AccessControlBiometryCurrentSet",
                AccessControlFlags::BIOMETRY_CURRENT_SET,
            ),
            Self::DevicePasscode => (
                "_AccessControlDevicePasscode",
                AccessControlFlags::DEVICE_PASSCODE,
            ),
        }
    }

    /// Returns the stable suffix appended to service descriptions.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        self.table().0
    }

    /// Returns the flag the backend enforces for items created under this policy.
    #[must_use]
    pub const fn enforcement_flag(self) -> AccessControlFlags {
        self.table().1
    }
}
