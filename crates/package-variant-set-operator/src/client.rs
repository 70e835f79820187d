use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, TypeMeta},
    core::GroupVersion,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope, pinned_kind, verbs},
};
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    crd::{
        PackageVariant, PackageVariantSet, PackageVariantSetStatus, Repository,
        variant_set::ObjectSelector,
    },
    selector::Selector,
    store::{self, VariantStore},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create kubernetes client"))]
    CreateKubeClient { source: kube::Error },
}

/// This `Client` can be used to access Kubernetes.
/// It wraps an underlying [`kube::client::Client`] and implements the [`VariantStore`] on top of it.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    post_params: PostParams,
    delete_params: DeleteParams,
    status_patch_params: PatchParams,
}

impl Client {
    pub fn new(client: kube::Client, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: field_manager.clone(),
                ..PostParams::default()
            },
            delete_params: DeleteParams::default(),
            status_patch_params: PatchParams {
                field_manager,
                ..PatchParams::default()
            },
        }
    }

    /// Returns a [`kube::client::Client`] that can be freely used.
    /// It does not need to be cloned before first use.
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    pub fn get_all_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    pub fn get_namespaced_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn list<T>(&self, namespace: &str, labels: &Selector) -> store::Result<Vec<T>>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let list_params = ListParams::default().labels(&labels.to_query_string());
        Ok(self
            .get_namespaced_api::<T>(namespace)
            .list(&list_params)
            .await
            .context(store::ListSnafu {
                kind: T::kind(&()).into_owned(),
                namespace,
            })?
            .items)
    }

    /// Finds the namespaced, listable API resources an [`ObjectSelector`] refers to.
    ///
    /// A fully qualified selector is looked up directly, otherwise the whole cluster is discovered
    /// and every resource matching the set fields is returned.
    async fn discover(&self, selector: &ObjectSelector) -> store::Result<Vec<ApiResource>> {
        if let (Some(api_version), Some(kind)) = (&selector.api_version, &selector.kind) {
            let group_version = GroupVersion::from_str(api_version)
                .context(store::ParseApiVersionSnafu { api_version })?;
            let (resource, capabilities) =
                match pinned_kind(&self.client, &group_version.with_kind(kind)).await {
                    Ok(found) => found,
                    Err(error) if is_unknown_resource(&error) => {
                        return store::UnknownResourceSnafu { api_version, kind }.fail();
                    }
                    Err(source) => {
                        return Err(store::Error::LookupResource {
                            source,
                            api_version: api_version.clone(),
                            kind: kind.clone(),
                        });
                    }
                };
            return Ok(is_listable_in_namespace(&capabilities)
                .then_some(resource)
                .into_iter()
                .collect());
        }

        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .context(store::DiscoverSnafu)?;
        Ok(discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .filter(|(resource, capabilities)| {
                is_listable_in_namespace(capabilities)
                    && selector
                        .api_version
                        .as_ref()
                        .is_none_or(|api_version| *api_version == resource.api_version)
                    && selector
                        .kind
                        .as_ref()
                        .is_none_or(|kind| *kind == resource.kind)
            })
            .map(|(resource, _)| resource)
            .collect())
    }
}

fn is_listable_in_namespace(capabilities: &ApiCapabilities) -> bool {
    capabilities.scope == Scope::Namespaced && capabilities.supports_operation(verbs::LIST)
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

/// The group version is not served (404), or it is served without the kind.
fn is_unknown_resource(error: &kube::Error) -> bool {
    is_not_found(error) || matches!(error, kube::Error::Discovery(_))
}

/// Creates a new [`Client`] from the local kubeconfig or the in-cluster configuration.
pub async fn create_client(field_manager: Option<String>) -> Result<Client> {
    let client = kube::Client::try_default()
        .await
        .context(CreateKubeClientSnafu)?;
    Ok(Client::new(client, field_manager))
}

#[async_trait]
impl VariantStore for Client {
    async fn list_repositories(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> store::Result<Vec<Repository>> {
        self.list(namespace, selector).await
    }

    async fn list_objects(
        &self,
        namespace: &str,
        selector: &ObjectSelector,
        labels: &Selector,
    ) -> store::Result<Vec<DynamicObject>> {
        let mut list_params = ListParams::default().labels(&labels.to_query_string());
        if let Some(name) = &selector.name {
            list_params = list_params.fields(&format!("metadata.name={name}"));
        }

        let mut objects = Vec::new();
        for resource in self.discover(selector).await? {
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), namespace, &resource);
            let items = api
                .list(&list_params)
                .await
                .context(store::ListSnafu {
                    kind: resource.kind.clone(),
                    namespace,
                })?
                .items;

            // List responses carry the type information only once for the whole list
            objects.extend(items.into_iter().map(|mut object| {
                object.types.get_or_insert_with(|| TypeMeta {
                    api_version: resource.api_version.clone(),
                    kind: resource.kind.clone(),
                });
                object
            }));
        }
        Ok(objects)
    }

    async fn list_variants(
        &self,
        namespace: &str,
        labels: &Selector,
    ) -> store::Result<Vec<PackageVariant>> {
        self.list(namespace, labels).await
    }

    async fn get_variant(
        &self,
        namespace: &str,
        name: &str,
    ) -> store::Result<Option<PackageVariant>> {
        self.get_namespaced_api::<PackageVariant>(namespace)
            .get_opt(name)
            .await
            .context(store::GetVariantSnafu { name })
    }

    #[tracing::instrument(skip_all, fields(variant = %variant.name_any()))]
    async fn create_variant(&self, variant: &PackageVariant) -> store::Result<PackageVariant> {
        let namespace = variant
            .namespace()
            .context(store::ObjectMissingNamespaceSnafu)?;
        self.get_namespaced_api::<PackageVariant>(&namespace)
            .create(&self.post_params, variant)
            .await
            .context(store::CreateVariantSnafu {
                name: variant.name_any(),
            })
    }

    #[tracing::instrument(skip_all, fields(variant = %variant.name_any()))]
    async fn update_variant(&self, variant: &PackageVariant) -> store::Result<PackageVariant> {
        let namespace = variant
            .namespace()
            .context(store::ObjectMissingNamespaceSnafu)?;
        let name = variant
            .meta()
            .name
            .clone()
            .context(store::ObjectMissingNameSnafu)?;

        match self
            .get_namespaced_api::<PackageVariant>(&namespace)
            .replace(&name, &self.post_params, variant)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(error) if is_conflict(&error) => store::ConflictSnafu { name }.fail(),
            Err(source) => Err(store::Error::UpdateVariant { source, name }),
        }
    }

    #[tracing::instrument(skip_all, fields(variant = %variant.name_any()))]
    async fn delete_variant(&self, variant: &PackageVariant) -> store::Result<()> {
        let namespace = variant
            .namespace()
            .context(store::ObjectMissingNamespaceSnafu)?;
        let name = variant
            .meta()
            .name
            .clone()
            .context(store::ObjectMissingNameSnafu)?;

        match self
            .get_namespaced_api::<PackageVariant>(&namespace)
            .delete(&name, &self.delete_params)
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(source) => Err(store::Error::DeleteVariant { source, name }),
        }
    }

    #[tracing::instrument(skip_all, fields(set = %set.name_any()))]
    async fn update_status(
        &self,
        set: &PackageVariantSet,
        status: &PackageVariantSetStatus,
    ) -> store::Result<()> {
        let namespace = set.namespace().context(store::ObjectMissingNamespaceSnafu)?;
        let name = set.name_any();
        let patch = serde_json::json!({ "status": status });

        self.get_namespaced_api::<PackageVariantSet>(&namespace)
            .patch_status(&name, &self.status_patch_params, &Patch::Merge(&patch))
            .await
            .context(store::UpdateStatusSnafu { name })?;
        Ok(())
    }
}
