//! All-or-nothing relocation of items between namespaces.
//!
//! A migration runs in strict phases:
//!
//! 1. **Stage**: read and validate every source item into memory.
//! 2. **Check**: make sure no staged key already exists in the destination.
//! 3. **Commit**: write every staged item to the destination. On the first
//!    failure, the items written so far are deleted again.
//! 4. **Remove** (optional): delete exactly the staged source items, one
//!    selector per item.
//!
//! Nothing is written before phase 3, and phase 3 either completes or leaves the
//! destination as it was, so the backend is unchanged by any error raised before
//! phase 4. The exceptions are reported explicitly: a revert that could not
//! delete every written item returns [`MigrationError::RollbackFailed`], and a
//! phase 4 failure leaves the items in both namespaces.
//!
//! Removal never deletes an item that was not staged, and staging refuses items
//! whose removal selector would also match the destination copy.

use std::collections::HashSet;

use zeroize::Zeroizing;

use crate::backend::{
    AuthenticationContext, BackendError, BackendItem, ItemAttributes, ItemClass,
    ItemQuery, SecureItemBackend,
};
use crate::error::{KeychainError, MigrationError, MigrationResult};
use crate::service::Service;
use crate::store::CANARY_KEY;

struct StagedItem {
    key: String,
    value: Zeroizing<Vec<u8>>,
    /// Where the item lives in the source, as reported by the backend.
    source: ItemAttributes,
}

impl StagedItem {
    /// Selects this item and nothing else in the source.
    fn removal_query(&self) -> ItemQuery {
        ItemQuery {
            item_class: Some(self.source.item_class),
            service: self.source.service.clone(),
            access_group: self.source.access_group.clone(),
            account: Some(self.key.clone()),
            access_control: self.source.access_control,
            ..ItemQuery::default()
        }
    }
}

#[derive(Default)]
struct Staging {
    items: Vec<StagedItem>,
    seen: HashSet<String>,
}

impl Staging {
    /// Validates a matched key. Returns `None` for bookkeeping items that are not migrated.
    fn accept_key(&mut self, key: Option<String>) -> MigrationResult<Option<String>> {
        let key = match key {
            Some(key) if key == CANARY_KEY => return Ok(None),
            Some(key) if !key.is_empty() => key,
            _ => return Err(MigrationError::KeyInQueryResultInvalid),
        };
        if !self.seen.insert(key.clone()) {
            return Err(MigrationError::DuplicateKeyInQueryResult(key));
        }
        Ok(Some(key))
    }

    fn push(
        &mut self,
        key: String,
        value: Option<Vec<u8>>,
        source: ItemAttributes,
    ) -> MigrationResult<()> {
        let value = match value {
            Some(value) if !value.is_empty() => Zeroizing::new(value),
            _ => return Err(MigrationError::DataInQueryResultInvalid),
        };
        self.items.push(StagedItem { key, value, source });
        Ok(())
    }
}

/// Moves items matching a source into a destination service.
pub struct MigrationCoordinator<'a> {
    backend: &'a dyn SecureItemBackend,
}

impl<'a> MigrationCoordinator<'a> {
    /// Creates a coordinator over `backend`.
    #[must_use]
    pub const fn new(backend: &'a dyn SecureItemBackend) -> Self {
        Self { backend }
    }

    /// Migrates every item matching `source` into `destination`.
    ///
    /// `source` must select generic password items of some namespace and must not
    /// carry an access-control flag: protected items cannot be read in bulk. It
    /// must not match items of `destination`.
    ///
    /// # Errors
    ///
    /// Returns a [`MigrationError`]. Only [`MigrationError::RollbackFailed`] and
    /// [`MigrationError::RemovalFailed`] leave the backend modified.
    pub fn migrate(
        &self,
        source: &ItemQuery,
        destination: &Service,
        remove_on_completion: bool,
    ) -> MigrationResult<()> {
        validate_source_query(source)?;
        let staged = self.stage_query(source, destination)?;
        self.relocate(&staged, destination, remove_on_completion)
    }

    /// Migrates every item of the `source` service into `destination`.
    ///
    /// Items are read one by one through the source's access control, so this may
    /// prompt. Passing the source's authentication context lets a single-prompt
    /// source reuse one proof for all reads. Listed items that cannot be read
    /// under the source's access control are left untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`MigrationError`]. Only [`MigrationError::RollbackFailed`] and
    /// [`MigrationError::RemovalFailed`] leave the backend modified.
    pub fn migrate_service(
        &self,
        source: &Service,
        context: Option<&AuthenticationContext>,
        destination: &Service,
        remove_on_completion: bool,
    ) -> MigrationResult<()> {
        if source == destination {
            return Err(MigrationError::InvalidQuery(
                "source and destination are the same service".to_string(),
            ));
        }
        let staged = self.stage_service(source, context)?;
        self.relocate(&staged, destination, remove_on_completion)
    }

    fn relocate(
        &self,
        staged: &[StagedItem],
        destination: &Service,
        remove_on_completion: bool,
    ) -> MigrationResult<()> {
        if remove_on_completion {
            ensure_removal_spares_destination(staged, destination)?;
        }
        self.commit(staged, destination)?;
        if remove_on_completion {
            self.remove_staged(staged)?;
        }
        Ok(())
    }

    fn list(&self, query: &ItemQuery) -> MigrationResult<Vec<BackendItem>> {
        match self.backend.bulk_read(query) {
            Ok(items) if !items.is_empty() => Ok(items),
            Ok(_) | Err(BackendError::NotFound) => Err(MigrationError::NoItemsToMigrate),
            Err(error) => Err(KeychainError::from(error).into()),
        }
    }

    fn stage_query(
        &self,
        source: &ItemQuery,
        destination: &Service,
    ) -> MigrationResult<Vec<StagedItem>> {
        let destination_selector = destination.base_query_without_access_control();
        let mut staging = Staging::default();
        for item in self.list(source)? {
            if let Some(key) = &item.key {
                if destination_selector.matches(key, &item.attributes) {
                    return Err(MigrationError::InvalidQuery(format!(
                        "query matches {key} in the destination"
                    )));
                }
            }
            let Some(key) = staging.accept_key(item.key)? else {
                continue;
            };
            if item.attributes.access_control.is_some() {
                return Err(MigrationError::InvalidQuery(format!(
                    "item {key} is protected by access control"
                )));
            }
            staging.push(key, item.value, item.attributes)?;
        }
        finish_staging(staging)
    }

    fn stage_service(
        &self,
        source: &Service,
        context: Option<&AuthenticationContext>,
    ) -> MigrationResult<Vec<StagedItem>> {
        let mut staging = Staging::default();
        let base = source
            .base_query()
            .with_authentication_context(context.cloned());
        for item in self.list(&source.base_query_without_access_control())? {
            let Some(key) = staging.accept_key(item.key)? else {
                continue;
            };
            match self.backend.read(&base.clone().with_account(key.as_str())) {
                Ok(value) => staging.push(key, Some(value), item.attributes)?,
                Err(BackendError::NotFound) => {
                    log::debug!("skipping {key}: not stored under the source access control");
                }
                Err(error) => return Err(KeychainError::from(error).into()),
            }
        }
        finish_staging(staging)
    }

    fn commit(&self, staged: &[StagedItem], destination: &Service) -> MigrationResult<()> {
        let base = destination.base_query();

        for item in staged {
            let query = base.clone().with_account(item.key.as_str());
            match self.backend.exists(&query) {
                // Without a promptless check, a collision surfaces as a failed insert below.
                Ok(false) | Err(BackendError::Unsupported(_)) => {}
                Ok(true) => {
                    return Err(MigrationError::KeyAlreadyInDestination(item.key.clone()));
                }
                Err(error) => return Err(KeychainError::from(error).into()),
            }
        }

        let mut written: Vec<&str> = Vec::with_capacity(staged.len());
        for item in staged {
            let query = base.clone().with_account(item.key.as_str());
            if let Err(error) = self.backend.create(&query, &item.value) {
                log::warn!(
                    "migration into {destination} failed at {}; reverting {} items",
                    item.key,
                    written.len()
                );
                let remaining = self.revert(&base, &written);
                if remaining.is_empty() {
                    return Err(MigrationError::MigrationFailed(error.into()));
                }
                return Err(MigrationError::RollbackFailed {
                    cause: error.into(),
                    remaining,
                });
            }
            written.push(item.key.as_str());
        }

        log::debug!("migrated {} items into {destination}", staged.len());
        Ok(())
    }

    /// Deletes the written keys again. Returns the keys that could not be deleted.
    fn revert(&self, base: &ItemQuery, written: &[&str]) -> Vec<String> {
        let mut remaining = Vec::new();
        for key in written {
            if let Err(error) = self.backend.delete(&base.clone().with_account(*key)) {
                log::error!("failed to revert migrated item {key}: {error}");
                remaining.push((*key).to_string());
            }
        }
        remaining
    }

    fn remove_staged(&self, staged: &[StagedItem]) -> MigrationResult<()> {
        for item in staged {
            if let Err(error) = self.backend.delete(&item.removal_query()) {
                log::error!(
                    "migrated item {} could not be removed from the source: {error}",
                    item.key
                );
                return Err(MigrationError::RemovalFailed(error.into()));
            }
        }
        Ok(())
    }
}

/// Attributes every item written into `destination` is created with.
fn destination_attributes(destination: &Service) -> ItemAttributes {
    ItemAttributes {
        item_class: ItemClass::GenericPassword,
        service: Some(destination.description()),
        access_group: destination
            .shared_group_identifier()
            .map(ToString::to_string),
        access_control: Some(destination.access_control().enforcement_flag()),
    }
}

fn ensure_removal_spares_destination(
    staged: &[StagedItem],
    destination: &Service,
) -> MigrationResult<()> {
    let attributes = destination_attributes(destination);
    staged
        .iter()
        .find(|item| item.removal_query().matches(&item.key, &attributes))
        .map_or(Ok(()), |item| {
            Err(MigrationError::InvalidQuery(format!(
                "removing {} from the source would also remove it from the destination",
                item.key
            )))
        })
}

fn validate_source_query(query: &ItemQuery) -> MigrationResult<()> {
    if query.selects_nothing() {
        return Err(MigrationError::InvalidQuery(
            "query must select a service, access group or account".to_string(),
        ));
    }
    if query.item_class != Some(ItemClass::GenericPassword) {
        return Err(MigrationError::InvalidQuery(
            "query must select generic password items".to_string(),
        ));
    }
    if query.access_control.is_some() {
        return Err(MigrationError::InvalidQuery(
            "access-controlled items cannot be migrated in bulk".to_string(),
        ));
    }
    Ok(())
}

fn finish_staging(staging: Staging) -> MigrationResult<Vec<StagedItem>> {
    if staging.items.is_empty() {
        return Err(MigrationError::NoItemsToMigrate);
    }
    log::debug!("staged {} items for migration", staging.items.len());
    Ok(staging.items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_control::{AccessControl, AccessControlFlags};
    use crate::platform::memory::MemoryBackend;
    use crate::service::Flavor;
    use crate::{Identifier, SharedGroupIdentifier};

    fn destination() -> Service {
        Service::standard(
            Identifier::new("destination").expect("identifier"),
            Flavor::SecureEnclave(AccessControl::UserPresence),
        )
    }

    fn shared_destination() -> Service {
        Service::shared_group(
            SharedGroupIdentifier::new("TEAM", "com.example.shared").expect("group"),
            None,
            Flavor::SecureEnclave(AccessControl::UserPresence),
        )
    }

    fn group_query() -> ItemQuery {
        ItemQuery::generic_password().with_access_group("TEAM.com.example.shared")
    }

    fn legacy() -> ItemQuery {
        ItemQuery::generic_password().with_service("legacy")
    }

    fn seed(backend: &MemoryBackend, items: &[(&str, &str)]) {
        for (key, value) in items {
            backend
                .create(&legacy().with_account(*key), value.as_bytes())
                .expect("seed");
        }
    }

    #[test]
    fn test_rejects_invalid_queries() {
        let backend = MemoryBackend::new();
        let coordinator = MigrationCoordinator::new(&backend);
        for query in [
            ItemQuery::generic_password(),
            ItemQuery::default().with_service("legacy"),
            legacy().with_access_control(AccessControlFlags::USER_PRESENCE),
        ] {
            assert!(matches!(
                coordinator.migrate(&query, &destination(), false),
                Err(MigrationError::InvalidQuery(_))
            ));
        }
    }

    #[test]
    fn test_empty_source_has_nothing_to_migrate() {
        let backend = MemoryBackend::new();
        let coordinator = MigrationCoordinator::new(&backend);
        assert_eq!(
            coordinator.migrate(&legacy(), &destination(), true),
            Err(MigrationError::NoItemsToMigrate)
        );
    }

    #[test]
    fn test_protected_items_abort_without_writes() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("a", "x")]);
        backend
            .create(
                &legacy()
                    .with_account("b")
                    .with_access_control(AccessControlFlags::BIOMETRY_ANY),
                b"y",
            )
            .expect("seed");
        let coordinator = MigrationCoordinator::new(&backend);
        assert!(matches!(
            coordinator.migrate(&legacy(), &destination(), true),
            Err(MigrationError::InvalidQuery(_))
        ));
        assert!(backend.keys_for_service(&destination().description()).is_empty());
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn test_empty_value_is_invalid_data() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("a", "x"), ("b", "")]);
        let coordinator = MigrationCoordinator::new(&backend);
        assert_eq!(
            coordinator.migrate(&legacy(), &destination(), true),
            Err(MigrationError::DataInQueryResultInvalid)
        );
        assert!(backend.keys_for_service(&destination().description()).is_empty());
    }

    #[test]
    fn test_duplicate_keys_are_rejected() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("a", "x")]);
        backend
            .create(
                &legacy().with_account("a").with_access_group("TEAM.other"),
                b"y",
            )
            .expect("seed");
        let coordinator = MigrationCoordinator::new(&backend);
        assert_eq!(
            coordinator.migrate(&legacy(), &destination(), false),
            Err(MigrationError::DuplicateKeyInQueryResult("a".to_string()))
        );
    }

    #[test]
    fn test_existing_destination_key_blocks_migration() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("a", "x"), ("b", "y")]);
        backend
            .create(&destination().base_query().with_account("b"), b"kept")
            .expect("seed");
        let coordinator = MigrationCoordinator::new(&backend);
        assert_eq!(
            coordinator.migrate(&legacy(), &destination(), true),
            Err(MigrationError::KeyAlreadyInDestination("b".to_string()))
        );
        assert_eq!(
            backend.keys_for_service(&destination().description()),
            vec!["b".to_string()]
        );
        assert_eq!(backend.keys_for_service("legacy").len(), 2);
    }

    #[test]
    fn test_failed_insert_reverts_destination() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("a", "x"), ("b", "y")]);
        backend.fail_create_for_key("b", BackendError::Status(-26276));
        let coordinator = MigrationCoordinator::new(&backend);
        assert_eq!(
            coordinator.migrate(&legacy(), &destination(), true),
            Err(MigrationError::MigrationFailed(
                KeychainError::UnexpectedBackendError(-26276)
            ))
        );
        assert!(backend.keys_for_service(&destination().description()).is_empty());
        assert_eq!(
            backend.keys_for_service("legacy"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_removal_failure_keeps_copy() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("a", "x")]);
        backend.fail_deletes(Some(BackendError::Status(-25308)));
        let coordinator = MigrationCoordinator::new(&backend);
        assert_eq!(
            coordinator.migrate(&legacy(), &destination(), true),
            Err(MigrationError::RemovalFailed(
                KeychainError::UnexpectedBackendError(-25308)
            ))
        );
        assert_eq!(
            backend.keys_for_service(&destination().description()),
            vec!["a".to_string()]
        );
        assert_eq!(backend.keys_for_service("legacy"), vec!["a".to_string()]);
    }

    #[test]
    fn test_service_migration_reads_through_access_control() {
        let backend = MemoryBackend::new();
        let source = destination().with_flavor(Flavor::SinglePromptSecureEnclave(
            AccessControl::UserPresence,
        ));
        for (key, value) in [("a", b"x"), ("b", b"y")] {
            backend
                .create(&source.base_query().with_account(key), value)
                .expect("seed");
        }
        let context = AuthenticationContext::new();
        let coordinator = MigrationCoordinator::new(&backend);
        coordinator
            .migrate_service(&source, Some(&context), &destination(), true)
            .expect("migrate");
        assert_eq!(backend.prompts().len(), 1);
        assert_eq!(
            backend.keys_for_service(&destination().description()),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(backend.keys_for_service(&source.description()).is_empty());
        assert_eq!(
            coordinator.migrate_service(&destination(), None, &destination(), false),
            Err(MigrationError::InvalidQuery(
                "source and destination are the same service".to_string()
            ))
        );
    }

    #[test]
    fn test_failed_revert_reports_leftover_items() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("a", "x"), ("b", "y")]);
        backend.fail_create_for_key("b", BackendError::Status(-26276));
        backend.fail_deletes(Some(BackendError::Status(-1)));
        let coordinator = MigrationCoordinator::new(&backend);
        assert_eq!(
            coordinator.migrate(&legacy(), &destination(), true),
            Err(MigrationError::RollbackFailed {
                cause: KeychainError::UnexpectedBackendError(-26276),
                remaining: vec!["a".to_string()],
            })
        );
        assert_eq!(
            backend.keys_for_service(&destination().description()),
            vec!["a".to_string()]
        );
        assert_eq!(backend.keys_for_service("legacy").len(), 2);
    }

    #[test]
    fn test_group_only_query_removes_only_source_items() {
        let backend = MemoryBackend::new();
        backend
            .create(&group_query().with_service("legacy").with_account("a"), b"x")
            .expect("seed");
        let coordinator = MigrationCoordinator::new(&backend);
        coordinator
            .migrate(&group_query(), &shared_destination(), true)
            .expect("migrate");
        assert_eq!(
            backend.keys_for_service(&shared_destination().description()),
            vec!["a".to_string()]
        );
        assert!(backend.keys_for_service("legacy").is_empty());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_account_only_query_removes_only_source_items() {
        let backend = MemoryBackend::new();
        seed(&backend, &[("token", "x")]);
        let coordinator = MigrationCoordinator::new(&backend);
        coordinator
            .migrate(
                &ItemQuery::generic_password().with_account("token"),
                &destination(),
                true,
            )
            .expect("migrate");
        assert_eq!(
            backend.keys_for_service(&destination().description()),
            vec!["token".to_string()]
        );
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_removal_that_would_reach_destination_is_rejected() {
        let backend = MemoryBackend::new();
        backend
            .create(&group_query().with_account("a"), b"x")
            .expect("seed");
        let coordinator = MigrationCoordinator::new(&backend);
        assert!(matches!(
            coordinator.migrate(&group_query(), &shared_destination(), true),
            Err(MigrationError::InvalidQuery(_))
        ));
        assert!(backend
            .keys_for_service(&shared_destination().description())
            .is_empty());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_query_matching_destination_items_is_rejected() {
        let backend = MemoryBackend::new();
        backend
            .create(
                &shared_destination().base_query().with_account("kept"),
                b"x",
            )
            .expect("seed");
        backend
            .create(&group_query().with_service("legacy").with_account("a"), b"y")
            .expect("seed");
        let coordinator = MigrationCoordinator::new(&backend);
        assert!(matches!(
            coordinator.migrate(&group_query(), &shared_destination(), true),
            Err(MigrationError::InvalidQuery(_))
        ));
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn test_service_migration_keeps_unreadable_items() {
        let backend = MemoryBackend::new();
        let source = destination().with_flavor(Flavor::SecureEnclave(
            AccessControl::DevicePasscode,
        ));
        backend
            .create(&source.base_query().with_account("a"), b"x")
            .expect("seed");
        backend
            .create(
                &source.base_query_without_access_control().with_account("orphan"),
                b"y",
            )
            .expect("seed");
        let coordinator = MigrationCoordinator::new(&backend);
        coordinator
            .migrate_service(&source, None, &destination(), true)
            .expect("migrate");
        assert_eq!(
            backend.keys_for_service(&destination().description()),
            vec!["a".to_string()]
        );
        assert_eq!(
            backend.keys_for_service(&source.description()),
            vec!["orphan".to_string()]
        );
    }
}
