//! Error types for identity validation, keychain access and migration.

use thiserror::Error;

use crate::backend::BackendError;

/// Result type for single-store keychain operations.
pub type KeychainResult<T> = Result<T, KeychainError>;

/// Result type for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Status the backend reports when an item with the same primary key already exists.
pub(crate) const DUPLICATE_ITEM_STATUS: i32 = -25299;

/// Raised when an identity cannot be constructed from the given input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The identifier string was empty.
    #[error("identifier must not be empty")]
    EmptyIdentifier,

    /// The shared group prefix was empty.
    #[error("shared group prefix must not be empty")]
    EmptyGroupPrefix,

    /// The shared group name was empty.
    #[error("shared group name must not be empty")]
    EmptyGroupName,

    /// A shared group component contained a character outside `[A-Za-z0-9.-]`.
    #[error("shared group {component} contains an invalid character: {value}")]
    InvalidGroupCharacter {
        /// Which component was rejected (`prefix` or `name`).
        component: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Errors raised by store operations against the secure backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeychainError {
    /// No item exists for the requested key.
    #[error("item not found")]
    ItemNotFound,

    /// The user dismissed the presence prompt.
    #[error("user cancelled the presence prompt")]
    UserCancelled,

    /// The backend could not be reached or refused the interaction.
    #[error("could not access keychain")]
    CouldNotAccessKeychain,

    /// The backend failed with a status this crate does not interpret.
    #[error("unexpected backend error: {0}")]
    UnexpectedBackendError(i32),

    /// Keys must not be empty.
    #[error("key must not be empty")]
    EmptyKey,

    /// Values must not be empty.
    #[error("value must not be empty")]
    EmptyValue,

    /// The backend cannot express the requested operation.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Stored bytes could not be decoded as UTF-8.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The store mutex was poisoned by a panicking operation.
    #[error("store lock error: {0}")]
    Lock(String),
}

impl From<BackendError> for KeychainError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::NotFound => Self::ItemNotFound,
            BackendError::UserCancelled => Self::UserCancelled,
            BackendError::Unavailable | BackendError::InteractionNotAllowed => {
                Self::CouldNotAccessKeychain
            }
            BackendError::Unsupported(operation) => Self::NotSupported(operation),
            BackendError::DuplicateItem => {
                Self::UnexpectedBackendError(DUPLICATE_ITEM_STATUS)
            }
            BackendError::Status(code) => Self::UnexpectedBackendError(code),
        }
    }
}

/// Errors raised while relocating items between namespaces.
///
/// Every variant except [`MigrationError::RollbackFailed`] and
/// [`MigrationError::RemovalFailed`] guarantees that the backend is unchanged.
/// `RollbackFailed` names the items left behind in the destination.
/// `RemovalFailed` means the copy succeeded and the items now exist in both places.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    /// The source query matched nothing.
    #[error("no items to migrate")]
    NoItemsToMigrate,

    /// The source query cannot be migrated.
    #[error("invalid migration query: {0}")]
    InvalidQuery(String),

    /// A matched item had a missing or empty key.
    #[error("key in query result is invalid")]
    KeyInQueryResultInvalid,

    /// A matched item had missing or empty data.
    #[error("data in query result is invalid")]
    DataInQueryResultInvalid,

    /// The same key was matched more than once.
    #[error("duplicate key in query result: {0}")]
    DuplicateKeyInQueryResult(String),

    /// A matched key is already stored in the destination.
    #[error("key already exists in destination: {0}")]
    KeyAlreadyInDestination(String),

    /// Writing to the destination failed; already written items were removed.
    #[error("migration failed: {0}")]
    MigrationFailed(KeychainError),

    /// Writing to the destination failed and some written items could not be
    /// deleted again. The source is unchanged.
    #[error("migration failed: {cause}; rollback left {remaining:?} in the destination")]
    RollbackFailed {
        /// The failure that aborted the write phase.
        cause: KeychainError,
        /// Keys that are still present in the destination.
        remaining: Vec<String>,
    },

    /// Items were copied but could not be removed from the source.
    #[error("removal of migrated items failed: {0}")]
    RemovalFailed(KeychainError),

    /// The backend failed while reading the source.
    #[error(transparent)]
    Keychain(#[from] KeychainError),
}
