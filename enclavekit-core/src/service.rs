//! Namespace derivation from identity and access control.
//!
//! A [`Service`] renders to a canonical description that is both the registry
//! cache key and the backend service name. The layout is part of the storage
//! contract:
//!
//! ```text
//! EK_{flavor}_standard_{identifier}_{protection}{suffix}
//! EK_{flavor}_sharedGroup_{group}_{protection}{suffix}
//! EK_{flavor}_sharedGroupIdentifier_{group}_{identifier}_{protection}{suffix}
//! ```
//!
//! `{suffix}` is [`AccessControl::describe`], empty for `UserPresence`. Group
//! identifiers cannot contain `_`, so the two-component layout stays unambiguous.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::access_control::AccessControl;
use crate::backend::ItemQuery;
use crate::identity::{Identifier, SharedGroupIdentifier};

const SERVICE_PREFIX: &str = "EK";

/// Protection class of every item written by a store.
const PROTECTION_DESCRIPTION: &str = "WhenPasscodeSetThisDeviceOnly";

/// Store variant without its policy, for configuration and logging.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlavorKind {
    /// Every protected read prompts.
    SecureEnclave,
    /// One prompt is reused until the store asks for a new one.
    SinglePromptSecureEnclave,
}

/// Hardware-isolated store variant bound to an access-control policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flavor {
    /// Every protected read prompts.
    SecureEnclave(AccessControl),
    /// One prompt is reused until [`SecureStore::require_prompt_on_next_access`].
    ///
    /// [`SecureStore::require_prompt_on_next_access`]: crate::SecureStore::require_prompt_on_next_access
    SinglePromptSecureEnclave(AccessControl),
}

impl Flavor {
    /// Builds a flavor from its kind and policy.
    #[must_use]
    pub const fn new(kind: FlavorKind, access_control: AccessControl) -> Self {
        match kind {
            FlavorKind::SecureEnclave => Self::SecureEnclave(access_control),
            FlavorKind::SinglePromptSecureEnclave => {
                Self::SinglePromptSecureEnclave(access_control)
            }
        }
    }

    /// Returns the variant without its policy.
    #[must_use]
    pub const fn kind(self) -> FlavorKind {
        match self {
            Self::SecureEnclave(_) => FlavorKind::SecureEnclave,
            Self::SinglePromptSecureEnclave(_) => FlavorKind::SinglePromptSecureEnclave,
        }
    }

    /// Returns the access-control policy.
    #[must_use]
    pub const fn access_control(self) -> AccessControl {
        match self {
            Self::SecureEnclave(access_control)
            | Self::SinglePromptSecureEnclave(access_control) => access_control,
        }
    }

    /// Returns `true` if one presence proof is reused across reads.
    #[must_use]
    pub const fn is_single_prompt(self) -> bool {
        matches!(self, Self::SinglePromptSecureEnclave(_))
    }

    /// Tag used in service descriptions. Part of the storage contract.
    const fn tag(self) -> &'static str {
        match self {
            Self::SecureEnclave(_) => "SecureEnclave",
            Self::SinglePromptSecureEnclave(_) => "SinglePromptSecureEnclave",
        }
    }
}

/// The namespace a store reads and writes.
///
/// Equality and hashing are defined over [`Service::description`].
#[derive(Debug, Clone)]
pub enum Service {
    /// An application-private namespace.
    Standard(Identifier, Flavor),
    /// A namespace inside a shared access group, optionally narrowed by an identifier.
    SharedGroup(SharedGroupIdentifier, Option<Identifier>, Flavor),
}

impl Service {
    /// Creates an application-private service.
    #[must_use]
    pub const fn standard(identifier: Identifier, flavor: Flavor) -> Self {
        Self::Standard(identifier, flavor)
    }

    /// Creates a shared-group service.
    #[must_use]
    pub const fn shared_group(
        group: SharedGroupIdentifier,
        identifier: Option<Identifier>,
        flavor: Flavor,
    ) -> Self {
        Self::SharedGroup(group, identifier, flavor)
    }

    /// Returns the flavor.
    #[must_use]
    pub const fn flavor(&self) -> Flavor {
        match self {
            Self::Standard(_, flavor) | Self::SharedGroup(_, _, flavor) => *flavor,
        }
    }

    /// Returns the access-control policy.
    #[must_use]
    pub const fn access_control(&self) -> AccessControl {
        self.flavor().access_control()
    }

    /// Returns the effective identifier: the explicit one, or the projected group.
    #[must_use]
    pub fn identifier(&self) -> Identifier {
        match self {
            Self::Standard(identifier, _) | Self::SharedGroup(_, Some(identifier), _) => {
                identifier.clone()
            }
            Self::SharedGroup(group, None, _) => group.as_identifier(),
        }
    }

    /// Returns the shared group, if any.
    #[must_use]
    pub const fn shared_group_identifier(&self) -> Option<&SharedGroupIdentifier> {
        match self {
            Self::Standard(..) => None,
            Self::SharedGroup(group, _, _) => Some(group),
        }
    }

    /// Returns the same identity under another flavor.
    #[must_use]
    pub fn with_flavor(&self, flavor: Flavor) -> Self {
        match self {
            Self::Standard(identifier, _) => Self::Standard(identifier.clone(), flavor),
            Self::SharedGroup(group, identifier, _) => {
                Self::SharedGroup(group.clone(), identifier.clone(), flavor)
            }
        }
    }

    /// Renders the canonical description.
    #[must_use]
    pub fn description(&self) -> String {
        let flavor = self.flavor();
        let suffix = flavor.access_control().describe();
        let tag = flavor.tag();
        match self {
            Self::Standard(identifier, _) => format!(
                "{SERVICE_PREFIX}_{tag}_standard_{identifier}_{PROTECTION_DESCRIPTION}{suffix}"
            ),
            Self::SharedGroup(group, None, _) => format!(
                "{SERVICE_PREFIX}_{tag}_sharedGroup_{group}_{PROTECTION_DESCRIPTION}{suffix}"
            ),
            Self::SharedGroup(group, Some(identifier), _) => format!(
                "{SERVICE_PREFIX}_{tag}_sharedGroupIdentifier_{group}_{identifier}_{PROTECTION_DESCRIPTION}{suffix}"
            ),
        }
    }

    /// Returns the selector scoping operations to this service's items, including
    /// the access-control flag items are created with.
    #[must_use]
    pub fn base_query(&self) -> ItemQuery {
        self.base_query_without_access_control()
            .with_access_control(self.access_control().enforcement_flag())
    }

    /// Returns the namespace selector without the access-control flag.
    ///
    /// Matches every item of the service, including promptless bookkeeping items.
    #[must_use]
    pub fn base_query_without_access_control(&self) -> ItemQuery {
        let query = ItemQuery::generic_password().with_service(self.description());
        match self {
            Self::Standard(..) => query,
            Self::SharedGroup(group, _, _) => query.with_access_group(group.to_string()),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.description() == other.description()
    }
}

impl Eq for Service {}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.description().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use strum::IntoEnumIterator;

    use super::*;
    use crate::backend::ItemAttributes;

    fn identifier(value: &str) -> Identifier {
        Identifier::new(value).expect("identifier")
    }

    fn group() -> SharedGroupIdentifier {
        SharedGroupIdentifier::new("9XUJ7M53NG", "com.example.shared").expect("group")
    }

    #[test]
    fn test_standard_description_layout() {
        let service = Service::standard(
            identifier("tokens"),
            Flavor::SecureEnclave(AccessControl::UserPresence),
        );
        assert_eq!(
            service.description(),
            "EK_SecureEnclave_standard_tokens_WhenPasscodeSetThisDeviceOnly"
        );
        let service = Service::standard(
            identifier("tokens"),
            Flavor::SinglePromptSecureEnclave(AccessControl::DevicePasscode),
        );
        assert_eq!(
            service.description(),
            "EK_SinglePromptSecureEnclave_standard_tokens_WhenPasscodeSetThisDeviceOnly_AccessControlDevicePasscode"
        );
    }

    #[test]
    fn test_shared_group_description_layout() {
        let flavor = Flavor::SecureEnclave(AccessControl::BiometricAny);
        let service = Service::shared_group(group(), None, flavor);
        assert_eq!(
            service.description(),
            "EK_SecureEnclave_sharedGroup_9XUJ7M53NG.com.example.shared_WhenPasscodeSetThisDeviceOnly_AccessControlBiometryAny"
        );
        let service = Service::shared_group(group(), Some(identifier("tokens")), flavor);
        assert_eq!(
            service.description(),
            "EK_SecureEnclave_sharedGroupIdentifier_9XUJ7M53NG.com.example.shared_tokens_WhenPasscodeSetThisDeviceOnly_AccessControlBiometryAny"
        );
        assert_eq!(service.identifier(), identifier("tokens"));
        let base = service.base_query();
        assert_eq!(base.access_group.as_deref(), Some("9XUJ7M53NG.com.example.shared"));
    }

    #[test]
    fn test_descriptions_are_unique_across_combinations() {
        let mut descriptions = HashSet::new();
        let mut count = 0;
        for access_control in AccessControl::iter() {
            for flavor in [
                Flavor::SecureEnclave(access_control),
                Flavor::SinglePromptSecureEnclave(access_control),
            ] {
                for service in [
                    Service::standard(identifier("tokens"), flavor),
                    Service::standard(identifier("other"), flavor),
                    Service::shared_group(group(), None, flavor),
                    Service::shared_group(group(), Some(identifier("tokens")), flavor),
                ] {
                    descriptions.insert(service.description());
                    count += 1;
                }
            }
        }
        assert_eq!(descriptions.len(), count);
    }

    #[test]
    fn test_equality_follows_description() {
        let flavor = Flavor::SecureEnclave(AccessControl::UserPresence);
        let a = Service::standard(identifier("tokens"), flavor);
        let b = Service::standard(identifier("tokens"), flavor);
        let c = a.with_flavor(Flavor::SecureEnclave(AccessControl::BiometricAny));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.access_control(), AccessControl::BiometricAny);
    }

    #[test]
    fn test_base_queries_of_different_policies_are_disjoint() {
        let user_presence = Service::standard(
            identifier("tokens"),
            Flavor::SecureEnclave(AccessControl::UserPresence),
        );
        let passcode =
            user_presence.with_flavor(Flavor::SecureEnclave(AccessControl::DevicePasscode));
        let query = user_presence.base_query();
        let attributes = ItemAttributes {
            item_class: crate::backend::ItemClass::GenericPassword,
            service: query.service.clone(),
            access_group: None,
            access_control: query.access_control,
        };
        assert!(query.matches("key", &attributes));
        assert!(!passcode.base_query().matches("key", &attributes));
        assert!(!passcode
            .base_query_without_access_control()
            .matches("key", &attributes));
    }

    #[test]
    fn test_flavor_kind_round_trip() {
        let flavor = Flavor::new(FlavorKind::SinglePromptSecureEnclave, AccessControl::BiometricAny);
        assert!(flavor.is_single_prompt());
        assert_eq!(flavor.kind().to_string(), "single_prompt_secure_enclave");
        let kind: FlavorKind = "secure_enclave".parse().expect("parse");
        assert_eq!(Flavor::new(kind, AccessControl::BiometricAny).kind(), kind);
    }
}
