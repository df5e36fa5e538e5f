//! In-memory implementation of the backend contract for testing.
//!
//! This implementation is NOT secure for production use. Items live in a
//! process-local `Vec` and presence prompts are simulated, so the stores can be
//! exercised without a device.

#![allow(clippy::missing_panics_doc)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::backend::{
    BackendError, BackendItem, BackendResult, ItemAttributes, ItemClass, ItemQuery,
    SecureItemBackend,
};

// =============================================================================
// Presence simulation
// =============================================================================

/// How the simulated user answers presence prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceResponse {
    /// The user proves presence.
    Approve,
    /// The user dismisses the prompt.
    Cancel,
}

// =============================================================================
// Memory Backend
// =============================================================================

#[derive(Debug, Clone)]
struct StoredItem {
    key: String,
    attributes: ItemAttributes,
    value: Vec<u8>,
}

impl StoredItem {
    /// Items collide when class, service, access group and key are equal.
    fn same_primary_key(&self, key: &str, attributes: &ItemAttributes) -> bool {
        self.key == key
            && self.attributes.item_class == attributes.item_class
            && self.attributes.service == attributes.service
            && self.attributes.access_group == attributes.access_group
    }
}

#[derive(Debug)]
struct MemoryState {
    items: Vec<StoredItem>,
    presence: PresenceResponse,
    prompts: Vec<Option<String>>,
    authenticated_contexts: HashSet<Uuid>,
    create_failures: HashMap<String, BackendError>,
    delete_failure: Option<BackendError>,
    unavailable: bool,
}

/// In-memory secure item backend.
///
/// Thread-safe; all state sits behind one mutex. Reads of access-controlled
/// items run a simulated presence check answered by [`PresenceResponse`].
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    promptless_exists: bool,
}

impl MemoryBackend {
    /// Creates an empty backend that approves every presence prompt.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                items: Vec::new(),
                presence: PresenceResponse::Approve,
                prompts: Vec::new(),
                authenticated_contexts: HashSet::new(),
                create_failures: HashMap::new(),
                delete_failure: None,
                unavailable: false,
            }),
            promptless_exists: true,
        }
    }

    /// Creates a backend that cannot check existence without prompting.
    #[must_use]
    pub fn without_promptless_exists() -> Self {
        Self {
            promptless_exists: false,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets how subsequent presence prompts are answered.
    pub fn set_presence_response(&self, response: PresenceResponse) {
        self.state().presence = response;
    }

    /// Returns the prompt text of every presence check performed so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<Option<String>> {
        self.state().prompts.clone()
    }

    /// Makes the next creation of `key` fail with `error`. The failure fires once.
    pub fn fail_create_for_key(&self, key: &str, error: BackendError) {
        self.state().create_failures.insert(key.to_string(), error);
    }

    /// Makes every delete fail with `error` until cleared with `None`.
    pub fn fail_deletes(&self, error: Option<BackendError>) {
        self.state().delete_failure = error;
    }

    /// Makes every operation fail with [`BackendError::Unavailable`].
    pub fn make_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Returns the number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    /// Returns `true` if no items are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Returns the keys stored under `service`, in insertion order.
    #[must_use]
    pub fn keys_for_service(&self, service: &str) -> Vec<String> {
        self.state()
            .items
            .iter()
            .filter(|item| item.attributes.service.as_deref() == Some(service))
            .map(|item| item.key.clone())
            .collect()
    }

    const fn check_available(state: &MemoryState) -> BackendResult<()> {
        if state.unavailable {
            Err(BackendError::Unavailable)
        } else {
            Ok(())
        }
    }

    /// Runs the simulated presence check for a protected read.
    fn verify_presence(state: &mut MemoryState, query: &ItemQuery) -> BackendResult<()> {
        if let Some(context) = &query.authentication_context {
            if state.authenticated_contexts.contains(&context.id()) {
                return Ok(());
            }
        }
        state.prompts.push(query.operation_prompt.clone());
        match state.presence {
            PresenceResponse::Approve => {
                if let Some(context) = &query.authentication_context {
                    state.authenticated_contexts.insert(context.id());
                }
                Ok(())
            }
            PresenceResponse::Cancel => Err(BackendError::UserCancelled),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureItemBackend for MemoryBackend {
    fn create(&self, query: &ItemQuery, value: &[u8]) -> BackendResult<()> {
        let mut state = self.state();
        Self::check_available(&state)?;
        let key = query
            .account
            .clone()
            .ok_or_else(|| BackendError::Unsupported("create without account".to_string()))?;
        if let Some(error) = state.create_failures.remove(&key) {
            return Err(error);
        }
        let attributes = ItemAttributes {
            item_class: query.item_class.unwrap_or(ItemClass::GenericPassword),
            service: query.service.clone(),
            access_group: query.access_group.clone(),
            access_control: query.access_control,
        };
        if state
            .items
            .iter()
            .any(|item| item.same_primary_key(&key, &attributes))
        {
            return Err(BackendError::DuplicateItem);
        }
        state.items.push(StoredItem {
            key,
            attributes,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn read(&self, query: &ItemQuery) -> BackendResult<Vec<u8>> {
        let mut state = self.state();
        Self::check_available(&state)?;
        let item = state
            .items
            .iter()
            .find(|item| query.matches(&item.key, &item.attributes))
            .cloned()
            .ok_or(BackendError::NotFound)?;
        if item.attributes.access_control.is_some() {
            Self::verify_presence(&mut state, query)?;
        }
        Ok(item.value)
    }

    fn bulk_read(&self, query: &ItemQuery) -> BackendResult<Vec<BackendItem>> {
        let state = self.state();
        Self::check_available(&state)?;
        let items: Vec<BackendItem> = state
            .items
            .iter()
            .filter(|item| query.matches(&item.key, &item.attributes))
            .map(|item| BackendItem {
                key: Some(item.key.clone()),
                value: item
                    .attributes
                    .access_control
                    .is_none()
                    .then(|| item.value.clone()),
                attributes: item.attributes.clone(),
            })
            .collect();
        if items.is_empty() {
            return Err(BackendError::NotFound);
        }
        Ok(items)
    }

    fn delete(&self, query: &ItemQuery) -> BackendResult<()> {
        let mut state = self.state();
        Self::check_available(&state)?;
        if let Some(error) = state.delete_failure.clone() {
            return Err(error);
        }
        state
            .items
            .retain(|item| !query.matches(&item.key, &item.attributes));
        Ok(())
    }

    fn exists(&self, query: &ItemQuery) -> BackendResult<bool> {
        let state = self.state();
        Self::check_available(&state)?;
        if !self.promptless_exists {
            return Err(BackendError::Unsupported(
                "promptless existence check".to_string(),
            ));
        }
        Ok(state
            .items
            .iter()
            .any(|item| query.matches(&item.key, &item.attributes)))
    }
}
