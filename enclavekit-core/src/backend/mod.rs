//! Contract of the secure item backend the stores are layered on.
//!
//! The backend owns persistence, presence prompting and cryptographic enforcement.
//! This crate only builds queries and interprets results:
//!
//! - iOS / macOS: Keychain Services generic password items protected by an
//!   access-control object
//! - Tests and simulators: [`MemoryBackend`](crate::platform::memory::MemoryBackend)
//!
//! A query is a namespace selector (item class, service, access group, access
//! control) plus an optional item key. Selector fields left as `None` match any
//! value. The operation prompt and authentication context are options for the
//! call and never take part in matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::access_control::AccessControlFlags;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Failures reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// No item matched the query.
    #[error("no item matched the query")]
    NotFound,

    /// The user dismissed the presence prompt.
    #[error("user cancelled")]
    UserCancelled,

    /// An item with the same primary key already exists.
    #[error("duplicate item")]
    DuplicateItem,

    /// The operation needed user interaction that was not allowed.
    #[error("interaction not allowed")]
    InteractionNotAllowed,

    /// The backend cannot currently be accessed (locked device, missing entitlement).
    #[error("backend unavailable")]
    Unavailable,

    /// The backend cannot express the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Any other status code.
    #[error("backend status {0}")]
    Status(i32),
}

/// Class of a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemClass {
    /// Generic password items. Every store item uses this class.
    GenericPassword,
    /// Internet password items.
    InternetPassword,
}

/// Token that lets a backend reuse one successful presence proof across reads.
///
/// A fresh context has never been authenticated, so the next protected read
/// with it prompts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticationContext(Uuid);

impl AuthenticationContext {
    /// Creates a context that has not been authenticated yet.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the context id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for AuthenticationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Attributes an item was created with, as reported by a bulk read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemAttributes {
    /// Item class.
    pub item_class: ItemClass,
    /// Service (namespace) name.
    pub service: Option<String>,
    /// Access group the item lives in.
    pub access_group: Option<String>,
    /// Access control the item is protected by.
    pub access_control: Option<AccessControlFlags>,
}

/// One entry returned by [`SecureItemBackend::bulk_read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendItem {
    /// The item key (account).
    pub key: Option<String>,
    /// The item data; `None` when it cannot be released without a presence prompt.
    pub value: Option<Vec<u8>>,
    /// Creation attributes.
    pub attributes: ItemAttributes,
}

/// Selector plus call options passed to every backend operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemQuery {
    /// Item class to match.
    pub item_class: Option<ItemClass>,
    /// Service name to match.
    pub service: Option<String>,
    /// Access group to match.
    pub access_group: Option<String>,
    /// Item key to match.
    pub account: Option<String>,
    /// Access control to match, and to apply on creation.
    pub access_control: Option<AccessControlFlags>,
    /// Text shown by the backend if the call prompts for presence.
    pub operation_prompt: Option<String>,
    /// Context whose earlier presence proof the backend may reuse.
    pub authentication_context: Option<AuthenticationContext>,
}

impl ItemQuery {
    /// Creates a query selecting generic password items.
    #[must_use]
    pub fn generic_password() -> Self {
        Self {
            item_class: Some(ItemClass::GenericPassword),
            ..Self::default()
        }
    }

    /// Restricts the query to a service.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Restricts the query to an access group.
    #[must_use]
    pub fn with_access_group(mut self, access_group: impl Into<String>) -> Self {
        self.access_group = Some(access_group.into());
        self
    }

    /// Restricts the query to a single item key.
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Restricts the query to items created under `flags`.
    #[must_use]
    pub fn with_access_control(mut self, flags: AccessControlFlags) -> Self {
        self.access_control = Some(flags);
        self
    }

    /// Drops the access control selector.
    #[must_use]
    pub fn without_access_control(mut self) -> Self {
        self.access_control = None;
        self
    }

    /// Sets the prompt shown if the call requires presence.
    #[must_use]
    pub fn with_operation_prompt(mut self, prompt: Option<&str>) -> Self {
        self.operation_prompt = prompt.map(str::to_string);
        self
    }

    /// Attaches an authentication context.
    #[must_use]
    pub fn with_authentication_context(
        mut self,
        context: Option<AuthenticationContext>,
    ) -> Self {
        self.authentication_context = context;
        self
    }

    /// Returns `true` if the query does not narrow down any namespace.
    #[must_use]
    pub const fn selects_nothing(&self) -> bool {
        self.service.is_none() && self.access_group.is_none() && self.account.is_none()
    }

    /// Returns `true` if an item with `key` and `attributes` is selected by this query.
    #[must_use]
    pub fn matches(&self, key: &str, attributes: &ItemAttributes) -> bool {
        fn field<T: PartialEq>(selector: Option<&T>, value: Option<&T>) -> bool {
            selector.map_or(true, |wanted| value == Some(wanted))
        }

        self.item_class
            .map_or(true, |class| class == attributes.item_class)
            && field(self.service.as_ref(), attributes.service.as_ref())
            && field(self.access_group.as_ref(), attributes.access_group.as_ref())
            && self.account.as_deref().map_or(true, |account| account == key)
            && field(self.access_control.as_ref(), attributes.access_control.as_ref())
    }
}

/// Secure item store providing create / read / delete / exists with presence enforcement.
///
/// Implementations must be safe to call from multiple threads. Calls are
/// synchronous and `read` may block while a presence prompt is on screen.
pub trait SecureItemBackend: Send + Sync {
    /// Creates an item with the query's selector fields as attributes.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::DuplicateItem`] if an item with the same class,
    /// service, access group and key exists, or any backend failure.
    fn create(&self, query: &ItemQuery, value: &[u8]) -> BackendResult<()>;

    /// Reads the data of the first item matching `query`, prompting if it is protected.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] if nothing matches,
    /// [`BackendError::UserCancelled`] if the prompt was dismissed, or any backend failure.
    fn read(&self, query: &ItemQuery) -> BackendResult<Vec<u8>>;

    /// Returns every item matching `query` in a stable order, without prompting.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] if nothing matches, or any backend failure.
    fn bulk_read(&self, query: &ItemQuery) -> BackendResult<Vec<BackendItem>>;

    /// Deletes every item matching `query`. Deleting nothing succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn delete(&self, query: &ItemQuery) -> BackendResult<()>;

    /// Reports whether any item matches `query`, never prompting.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unsupported`] if the backend cannot check existence
    /// without a prompt, or any backend failure.
    fn exists(&self, query: &ItemQuery) -> BackendResult<bool>;
}
