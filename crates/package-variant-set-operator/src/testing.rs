//! An in-memory [`VariantStore`] with failure injection, used by the unit tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use kube::{
    ResourceExt,
    api::{DynamicObject, ObjectMeta, TypeMeta},
};

use crate::{
    crd::{
        PackageVariant, PackageVariantSet, PackageVariantSetStatus, Repository, RepositorySpec,
        variant_set::ObjectSelector,
    },
    selector::Selector,
    store::{Error, Result, VariantStore},
};

pub const NAMESPACE: &str = "default";

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    repositories: Vec<Repository>,
    objects: Vec<DynamicObject>,
    variants: BTreeMap<String, PackageVariant>,
    status: Option<PackageVariantSetStatus>,
    resource_version: u64,
    fail_repository_listing: bool,
    fail_variant_listing: bool,
    failing_writes: BTreeSet<String>,
    pending_conflicts: BTreeMap<String, usize>,
    mutations: usize,
    status_updates: usize,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

fn labels_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn injected(message: &str) -> kube::Error {
    kube::Error::Service(message.to_owned().into())
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("store lock is not poisoned")
    }

    pub fn with_repository(self, name: &str, labels: &[(&str, &str)]) -> Self {
        let mut repository = Repository::new(name, RepositorySpec::default());
        repository.metadata.namespace = Some(NAMESPACE.to_owned());
        repository.metadata.labels = Some(labels_of(labels));
        self.state().repositories.push(repository);
        self
    }

    pub fn with_object(
        self,
        api_version: &str,
        kind: &str,
        name: &str,
        labels: &[(&str, &str)],
        data: serde_json::Value,
    ) -> Self {
        self.state().objects.push(DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.to_owned(),
                kind: kind.to_owned(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(NAMESPACE.to_owned()),
                labels: Some(labels_of(labels)),
                ..ObjectMeta::default()
            },
            data,
        });
        self
    }

    pub fn fail_repository_listing(&self) {
        self.state().fail_repository_listing = true;
    }

    pub fn fail_variant_listing(&self) {
        self.state().fail_variant_listing = true;
    }

    /// Every create, update and delete of the PackageVariant `name` fails.
    pub fn fail_writes_for(&self, name: &str) {
        self.state().failing_writes.insert(name.to_owned());
    }

    /// The next `times` updates of the PackageVariant `name` race with another writer.
    pub fn conflict_on_update(&self, name: &str, times: usize) {
        self.state().pending_conflicts.insert(name.to_owned(), times);
    }

    /// Stores `variant` as if it was written by someone else. Not counted as a mutation.
    pub fn insert_variant(&self, mut variant: PackageVariant) -> PackageVariant {
        let mut state = self.state();
        let name = variant.name_any();
        variant.metadata.resource_version = Some(state.next_resource_version());
        variant
            .metadata
            .namespace
            .get_or_insert_with(|| NAMESPACE.to_owned());
        variant
            .metadata
            .uid
            .get_or_insert_with(|| format!("uid-{name}"));
        state.variants.insert(name, variant.clone());
        variant
    }

    pub fn variants(&self) -> Vec<PackageVariant> {
        self.state().variants.values().cloned().collect()
    }

    pub fn variant(&self, name: &str) -> Option<PackageVariant> {
        self.state().variants.get(name).cloned()
    }

    pub fn variant_names(&self) -> Vec<String> {
        self.state().variants.keys().cloned().collect()
    }

    pub fn mutations(&self) -> usize {
        self.state().mutations
    }

    pub fn status(&self) -> Option<PackageVariantSetStatus> {
        self.state().status.clone()
    }

    pub fn status_updates(&self) -> usize {
        self.state().status_updates
    }
}

#[async_trait]
impl VariantStore for MemoryStore {
    async fn list_repositories(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Repository>> {
        let state = self.state();
        if state.fail_repository_listing {
            return Err(Error::List {
                source: injected("repository listing is unavailable"),
                kind: "Repository".to_owned(),
                namespace: namespace.to_owned(),
            });
        }

        Ok(state
            .repositories
            .iter()
            .filter(|repository| repository.namespace().as_deref() == Some(namespace))
            .filter(|repository| selector.matches(repository.labels()))
            .cloned()
            .collect())
    }

    async fn list_objects(
        &self,
        namespace: &str,
        selector: &ObjectSelector,
        labels: &Selector,
    ) -> Result<Vec<DynamicObject>> {
        let matches_field = |expected: &Option<String>, actual: &str| {
            expected.as_deref().is_none_or(|expected| expected == actual)
        };

        Ok(self
            .state()
            .objects
            .iter()
            .filter(|object| object.namespace().as_deref() == Some(namespace))
            .filter(|object| {
                let types = object.types.clone().unwrap_or_default();
                matches_field(&selector.api_version, &types.api_version)
                    && matches_field(&selector.kind, &types.kind)
                    && matches_field(&selector.name, &object.name_any())
            })
            .filter(|object| labels.matches(object.labels()))
            .cloned()
            .collect())
    }

    async fn list_variants(
        &self,
        namespace: &str,
        labels: &Selector,
    ) -> Result<Vec<PackageVariant>> {
        let state = self.state();
        if state.fail_variant_listing {
            return Err(Error::List {
                source: injected("PackageVariant listing is unavailable"),
                kind: "PackageVariant".to_owned(),
                namespace: namespace.to_owned(),
            });
        }

        Ok(state
            .variants
            .values()
            .filter(|variant| variant.namespace().as_deref() == Some(namespace))
            .filter(|variant| labels.matches(variant.labels()))
            .cloned()
            .collect())
    }

    async fn get_variant(&self, namespace: &str, name: &str) -> Result<Option<PackageVariant>> {
        Ok(self
            .state()
            .variants
            .get(name)
            .filter(|variant| variant.namespace().as_deref() == Some(namespace))
            .cloned())
    }

    async fn create_variant(&self, variant: &PackageVariant) -> Result<PackageVariant> {
        let mut state = self.state();
        let name = variant.name_any();
        if state.failing_writes.contains(&name) || state.variants.contains_key(&name) {
            return Err(Error::CreateVariant {
                source: injected("create rejected"),
                name,
            });
        }

        let mut created = variant.clone();
        created.metadata.resource_version = Some(state.next_resource_version());
        created.metadata.uid = Some(format!("uid-{name}"));
        state.variants.insert(name, created.clone());
        state.mutations += 1;
        Ok(created)
    }

    async fn update_variant(&self, variant: &PackageVariant) -> Result<PackageVariant> {
        let mut state = self.state();
        let name = variant.name_any();
        if state.failing_writes.contains(&name) {
            return Err(Error::UpdateVariant {
                source: injected("update rejected"),
                name,
            });
        }

        let pending = state.pending_conflicts.get(&name).copied().unwrap_or_default();
        if pending > 0 {
            state.pending_conflicts.insert(name.clone(), pending - 1);
            // Another writer got there first
            let version = state.next_resource_version();
            if let Some(stored) = state.variants.get_mut(&name) {
                stored.metadata.resource_version = Some(version);
            }
            return Err(Error::Conflict { name });
        }

        let stored_version = match state.variants.get(&name) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => {
                return Err(Error::UpdateVariant {
                    source: injected("not found"),
                    name,
                });
            }
        };
        if stored_version != variant.metadata.resource_version {
            return Err(Error::Conflict { name });
        }

        let mut updated = variant.clone();
        updated.metadata.resource_version = Some(state.next_resource_version());
        state.variants.insert(name, updated.clone());
        state.mutations += 1;
        Ok(updated)
    }

    async fn delete_variant(&self, variant: &PackageVariant) -> Result<()> {
        let mut state = self.state();
        let name = variant.name_any();
        if state.failing_writes.contains(&name) {
            return Err(Error::DeleteVariant {
                source: injected("delete rejected"),
                name,
            });
        }

        if state.variants.remove(&name).is_some() {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn update_status(
        &self,
        _set: &PackageVariantSet,
        status: &PackageVariantSetStatus,
    ) -> Result<()> {
        let mut state = self.state();
        state.status = Some(status.clone());
        state.status_updates += 1;
        Ok(())
    }
}
