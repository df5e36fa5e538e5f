//! Identity-scoped secret store.
//!
//! A [`SecureStore`] is bound to one [`Service`] and serializes every operation
//! on it through an instance mutex. Stores are only handed out through the
//! [`StoreRegistry`], so all callers asking for the same service share one
//! instance and one lock.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::access_control::AccessControl;
use crate::backend::{AuthenticationContext, BackendError, ItemQuery, SecureItemBackend};
use crate::error::{KeychainError, KeychainResult, MigrationResult};
use crate::identity::{Identifier, SharedGroupIdentifier};
use crate::migration::MigrationCoordinator;
use crate::registry::StoreRegistry;
use crate::service::{Flavor, Service};

/// Key of the promptless item used by the health check.
pub(crate) const CANARY_KEY: &str = "EK_KeychainCanaryKey";

const CANARY_VALUE: &[u8] = b"EK_KeychainCanaryValue";

/// Values above this size are accepted but stored inefficiently by the backend.
const RECOMMENDED_MAX_VALUE_LEN: usize = 4096;

/// Secret store scoped to one service.
pub struct SecureStore {
    identifier: Identifier,
    service: Service,
    access_control: AccessControl,
    inner: Mutex<StoreInner>,
}

impl fmt::Debug for SecureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStore")
            .field("service", &self.service.description())
            .finish_non_exhaustive()
    }
}

struct StoreInner {
    service: Service,
    backend: Arc<dyn SecureItemBackend>,
    /// Present only for the single-prompt flavor.
    authentication_context: Option<AuthenticationContext>,
}

impl StoreInner {
    fn item_query(&self, key: &str) -> ItemQuery {
        self.service.base_query().with_account(key)
    }

    fn canary_query(&self) -> ItemQuery {
        self.service
            .base_query_without_access_control()
            .with_account(CANARY_KEY)
    }

    fn can_access_keychain(&self) -> bool {
        let query = self.canary_query();
        if matches!(self.backend.read(&query), Ok(value) if value == CANARY_VALUE) {
            return true;
        }

        let refreshed = self
            .backend
            .delete(&query)
            .and_then(|()| self.backend.create(&query, CANARY_VALUE))
            .and_then(|()| self.backend.read(&query));
        match refreshed {
            Ok(value) => value == CANARY_VALUE,
            Err(error) => {
                log::warn!("keychain health check failed for {}: {error}", self.service);
                false
            }
        }
    }

    fn set_object(&self, value: &[u8], key: &str) -> KeychainResult<()> {
        validate_key(key)?;
        if value.is_empty() {
            return Err(KeychainError::EmptyValue);
        }
        if value.len() > RECOMMENDED_MAX_VALUE_LEN {
            log::warn!(
                "storing {} bytes under {key}; values above {RECOMMENDED_MAX_VALUE_LEN} bytes are not recommended",
                value.len()
            );
        }

        let query = self.item_query(key);
        self.backend.delete(&query)?;
        self.backend.create(&query, value)?;
        Ok(())
    }

    fn object(&self, key: &str, prompt: Option<&str>) -> KeychainResult<Vec<u8>> {
        validate_key(key)?;
        let query = self
            .item_query(key)
            .with_operation_prompt(prompt)
            .with_authentication_context(self.authentication_context.clone());
        Ok(self.backend.read(&query)?)
    }

    fn contains_object(&self, key: &str) -> KeychainResult<bool> {
        validate_key(key)?;
        Ok(self.backend.exists(&self.item_query(key))?)
    }

    fn remove_object(&self, key: &str) -> KeychainResult<()> {
        validate_key(key)?;
        ignore_not_found(self.backend.delete(&self.item_query(key)))
    }

    fn remove_all_objects(&self) -> KeychainResult<()> {
        ignore_not_found(
            self.backend
                .delete(&self.service.base_query_without_access_control()),
        )
    }

    fn all_keys(&self) -> KeychainResult<BTreeSet<String>> {
        let items = match self
            .backend
            .bulk_read(&self.service.base_query_without_access_control())
        {
            Ok(items) => items,
            Err(BackendError::NotFound) => return Ok(BTreeSet::new()),
            Err(error) => return Err(error.into()),
        };
        Ok(items
            .into_iter()
            .filter_map(|item| item.key)
            .filter(|key| key != CANARY_KEY)
            .collect())
    }

    fn require_prompt_on_next_access(&mut self) {
        if let Some(context) = self.authentication_context.as_mut() {
            *context = AuthenticationContext::new();
        }
    }

    fn migrate_objects_matching(
        &self,
        query: &ItemQuery,
        remove_on_completion: bool,
    ) -> MigrationResult<()> {
        MigrationCoordinator::new(self.backend.as_ref()).migrate(
            query,
            &self.service,
            remove_on_completion,
        )
    }

    fn migrate_objects_from_service(
        &self,
        source: &Service,
        remove_on_completion: bool,
    ) -> MigrationResult<()> {
        let context = source
            .flavor()
            .is_single_prompt()
            .then(AuthenticationContext::new);
        MigrationCoordinator::new(self.backend.as_ref()).migrate_service(
            source,
            context.as_ref(),
            &self.service,
            remove_on_completion,
        )
    }
}

const fn validate_key(key: &str) -> KeychainResult<()> {
    if key.is_empty() {
        return Err(KeychainError::EmptyKey);
    }
    Ok(())
}

fn ignore_not_found(result: Result<(), BackendError>) -> KeychainResult<()> {
    match result {
        Ok(()) | Err(BackendError::NotFound) => Ok(()),
        Err(error) => Err(error.into()),
    }
}

impl SecureStore {
    pub(crate) fn new(backend: Arc<dyn SecureItemBackend>, service: Service) -> Self {
        let authentication_context = service
            .flavor()
            .is_single_prompt()
            .then(AuthenticationContext::new);
        Self {
            identifier: service.identifier(),
            access_control: service.access_control(),
            inner: Mutex::new(StoreInner {
                service: service.clone(),
                backend,
                authentication_context,
            }),
            service,
        }
    }

    /// Returns the store for `service` from the process-wide registry.
    ///
    /// If a live store for the service exists it is returned as is, and `backend`
    /// is ignored.
    #[must_use]
    pub fn open(backend: Arc<dyn SecureItemBackend>, service: Service) -> Arc<Self> {
        Self::open_in(StoreRegistry::global(), backend, service)
    }

    /// Returns the store for `service` from `registry`.
    #[must_use]
    pub fn open_in(
        registry: &StoreRegistry,
        backend: Arc<dyn SecureItemBackend>,
        service: Service,
    ) -> Arc<Self> {
        let key = service.description();
        registry.resolve_or_create(&key, || Self::new(backend, service))
    }

    /// Returns the application-private store for `identifier` where every protected read prompts.
    #[must_use]
    pub fn standard(
        backend: Arc<dyn SecureItemBackend>,
        identifier: Identifier,
        access_control: AccessControl,
    ) -> Arc<Self> {
        Self::open(
            backend,
            Service::standard(identifier, Flavor::SecureEnclave(access_control)),
        )
    }

    /// Returns the application-private store for `identifier` that reuses one
    /// presence proof until [`Self::require_prompt_on_next_access`].
    #[must_use]
    pub fn single_prompt(
        backend: Arc<dyn SecureItemBackend>,
        identifier: Identifier,
        access_control: AccessControl,
    ) -> Arc<Self> {
        Self::open(
            backend,
            Service::standard(identifier, Flavor::SinglePromptSecureEnclave(access_control)),
        )
    }

    /// Returns the store shared by every application in `group`.
    #[must_use]
    pub fn shared_group(
        backend: Arc<dyn SecureItemBackend>,
        group: SharedGroupIdentifier,
        identifier: Option<Identifier>,
        access_control: AccessControl,
    ) -> Arc<Self> {
        Self::open(
            backend,
            Service::shared_group(group, identifier, Flavor::SecureEnclave(access_control)),
        )
    }

    /// Returns the effective identifier.
    #[must_use]
    pub const fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Returns the service this store reads and writes.
    #[must_use]
    pub const fn service(&self) -> &Service {
        &self.service
    }

    /// Returns the access-control policy.
    #[must_use]
    pub const fn access_control(&self) -> AccessControl {
        self.access_control
    }

    /// Returns the flavor.
    #[must_use]
    pub const fn flavor(&self) -> Flavor {
        self.service.flavor()
    }

    fn lock_inner(&self) -> KeychainResult<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| KeychainError::Lock("store mutex poisoned".to_string()))
    }

    /// Checks that the backend can be written and read without prompting.
    ///
    /// Returns `false` on any failure.
    #[must_use]
    pub fn can_access_keychain(&self) -> bool {
        self.lock_inner()
            .is_ok_and(|inner| inner.can_access_keychain())
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`KeychainError::EmptyKey`] or [`KeychainError::EmptyValue`] for
    /// empty input, or the backend failure.
    pub fn set_object(&self, value: &[u8], key: &str) -> KeychainResult<()> {
        self.lock_inner()?.set_object(value, key)
    }

    /// Reads the value stored under `key`.
    ///
    /// May block while the backend shows `prompt` to verify presence.
    ///
    /// # Errors
    ///
    /// Returns [`KeychainError::ItemNotFound`] if nothing is stored,
    /// [`KeychainError::UserCancelled`] if the prompt was dismissed, or the
    /// backend failure.
    pub fn object(&self, key: &str, prompt: Option<&str>) -> KeychainResult<Vec<u8>> {
        self.lock_inner()?.object(key, prompt)
    }

    /// Reports whether a value is stored under `key`, without prompting.
    ///
    /// # Errors
    ///
    /// Returns [`KeychainError::NotSupported`] if the backend cannot check
    /// existence without a prompt, or the backend failure.
    pub fn contains_object(&self, key: &str) -> KeychainResult<bool> {
        self.lock_inner()?.contains_object(key)
    }

    /// Like [`Self::contains_object`], but any error reads as `false`.
    #[must_use]
    pub fn has_object(&self, key: &str) -> bool {
        self.contains_object(key).unwrap_or(false)
    }

    /// Stores `value` as UTF-8 under `key`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_object`].
    pub fn set_string(&self, value: &str, key: &str) -> KeychainResult<()> {
        self.set_object(value.as_bytes(), key)
    }

    /// Reads the UTF-8 string stored under `key`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::object`], plus [`KeychainError::Decoding`] if the stored
    /// bytes are not UTF-8.
    pub fn string(&self, key: &str, prompt: Option<&str>) -> KeychainResult<String> {
        let bytes = self.object(key, prompt)?;
        String::from_utf8(bytes).map_err(|error| KeychainError::Decoding(error.to_string()))
    }

    /// Removes the value stored under `key`. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`KeychainError::EmptyKey`] or the backend failure.
    pub fn remove_object(&self, key: &str) -> KeychainResult<()> {
        self.lock_inner()?.remove_object(key)
    }

    /// Removes every value of this store. Other services are not touched.
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub fn remove_all_objects(&self) -> KeychainResult<()> {
        self.lock_inner()?.remove_all_objects()
    }

    /// Returns every key stored in this store, without prompting.
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub fn all_keys(&self) -> KeychainResult<BTreeSet<String>> {
        self.lock_inner()?.all_keys()
    }

    /// Makes the next protected read prompt again. No-op unless single-prompt.
    ///
    /// # Errors
    ///
    /// Returns [`KeychainError::Lock`] if the store mutex is poisoned.
    pub fn require_prompt_on_next_access(&self) -> KeychainResult<()> {
        self.lock_inner()?.require_prompt_on_next_access();
        Ok(())
    }

    /// Moves every unprotected item matching `query` into this store.
    ///
    /// # Errors
    ///
    /// See [`MigrationCoordinator::migrate`].
    pub fn migrate_objects_matching(
        &self,
        query: &ItemQuery,
        remove_on_completion: bool,
    ) -> MigrationResult<()> {
        self.lock_inner()?
            .migrate_objects_matching(query, remove_on_completion)
    }

    /// Moves every item of `source` into this store.
    ///
    /// Reading a protected source prompts; a single-prompt source prompts once.
    ///
    /// # Errors
    ///
    /// See [`MigrationCoordinator::migrate_service`].
    pub fn migrate_objects_from_service(
        &self,
        source: &Service,
        remove_on_completion: bool,
    ) -> MigrationResult<()> {
        self.lock_inner()?
            .migrate_objects_from_service(source, remove_on_completion)
    }

    /// Moves the items this identity stored under another flavor into this store.
    ///
    /// # Errors
    ///
    /// See [`MigrationCoordinator::migrate_service`].
    pub fn migrate_objects_from_flavor(
        &self,
        flavor: Flavor,
        remove_on_completion: bool,
    ) -> MigrationResult<()> {
        self.migrate_objects_from_service(&self.service.with_flavor(flavor), remove_on_completion)
    }
}
