//! Backend implementations shipped with the crate.
//!
//! Production backends (Keychain Services on iOS and macOS) are provided by the
//! host application through [`SecureItemBackend`](crate::SecureItemBackend).
//! The in-memory backend here simulates the contract for tests and simulators.

pub mod memory;

pub use memory::{MemoryBackend, PresenceResponse};
