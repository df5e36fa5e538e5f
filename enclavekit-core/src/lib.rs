//! `enclavekit-core` stores small secrets in a hardware-isolated key store,
//! scoped by application or shared-group identity and protected by a
//! user-presence policy.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use enclavekit_core::platform::MemoryBackend;
//! use enclavekit_core::{AccessControl, Identifier, SecureStore};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let identifier = Identifier::new("com.example.docs").expect("identifier");
//! let store = SecureStore::standard(backend, identifier, AccessControl::UserPresence);
//!
//! store.set_string("hunter2", "password").expect("set");
//! assert_eq!(store.string("password", Some("Unlock")).expect("get"), "hunter2");
//! ```
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

mod access_control;
pub use access_control::{AccessControl, AccessControlFlags};

mod backend;
pub use backend::{
    AuthenticationContext, BackendError, BackendItem, BackendResult, ItemAttributes,
    ItemClass, ItemQuery, SecureItemBackend,
};

mod error;
pub use error::{KeychainError, KeychainResult, MigrationError, MigrationResult, ValidationError};

mod identity;
pub use identity::{Identifier, SharedGroupIdentifier};

mod migration;
pub use migration::MigrationCoordinator;

mod registry;
pub use registry::StoreRegistry;

mod service;
pub use service::{Flavor, FlavorKind, Service};

mod store;
pub use store::SecureStore;

/// Bridge forwarding the crate's `log` records to a host-provided logger.
pub mod logger;

pub mod platform;
