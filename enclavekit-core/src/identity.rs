//! Identities that scope a store's namespace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A non-empty token naming an application-local namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Creates an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyIdentifier`] if `value` is empty.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::EmptyIdentifier);
        }
        Ok(Self(value))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identifier {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identifier> for String {
    fn from(identifier: Identifier) -> Self {
        identifier.0
    }
}

impl FromStr for Identifier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// An access group shared by applications in the same trust group.
///
/// Renders as `"{prefix}.{name}"`, e.g. `"9XUJ7M53NG.com.example.shared"`.
/// Both components are restricted to the access-group alphabet (`[A-Za-z0-9.-]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSharedGroup")]
pub struct SharedGroupIdentifier {
    prefix: String,
    name: String,
}

impl SharedGroupIdentifier {
    /// Creates a shared group identifier from a team or app-group prefix and a group name.
    ///
    /// # Errors
    ///
    /// Returns an error if either component is empty or contains a character
    /// outside `[A-Za-z0-9.-]`.
    pub fn new(
        prefix: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let prefix = prefix.into();
        let name = name.into();
        if prefix.is_empty() {
            return Err(ValidationError::EmptyGroupPrefix);
        }
        if name.is_empty() {
            return Err(ValidationError::EmptyGroupName);
        }
        validate_group_component("prefix", &prefix)?;
        validate_group_component("name", &name)?;
        Ok(Self { prefix, name })
    }

    /// Returns the team or app-group prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Projects the rendered group into an [`Identifier`].
    ///
    /// Used as the store identifier when no secondary identifier is supplied.
    #[must_use]
    pub fn as_identifier(&self) -> Identifier {
        Identifier(self.to_string())
    }
}

impl fmt::Display for SharedGroupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.prefix, self.name)
    }
}

#[derive(Deserialize)]
struct RawSharedGroup {
    prefix: String,
    name: String,
}

impl TryFrom<RawSharedGroup> for SharedGroupIdentifier {
    type Error = ValidationError;

    fn try_from(raw: RawSharedGroup) -> Result<Self, Self::Error> {
        Self::new(raw.prefix, raw.name)
    }
}

fn validate_group_component(
    component: &'static str,
    value: &str,
) -> Result<(), ValidationError> {
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidGroupCharacter {
            component,
            value: value.to_string(),
        })
    }
}
