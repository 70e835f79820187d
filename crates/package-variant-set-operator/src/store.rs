//! The object store capability used by target resolution and reconciliation.
//!
//! [`VariantStore`] is the seam between the reconciliation logic and the Kubernetes API. The
//! operator uses the implementation on [`Client`](crate::client::Client), tests use an in-memory
//! store.

use async_trait::async_trait;
use kube::{api::DynamicObject, core::gvk::ParseGroupVersionError};
use snafu::Snafu;

use crate::{
    crd::{
        PackageVariant, PackageVariantSet, PackageVariantSetStatus, Repository,
        variant_set::ObjectSelector,
    },
    selector::Selector,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to list {kind} objects in namespace {namespace:?}"))]
    List {
        source: kube::Error,
        kind: String,
        namespace: String,
    },

    #[snafu(display("failed to discover the API resources of the cluster"))]
    Discover { source: kube::Error },

    #[snafu(display("failed to parse apiVersion {api_version:?}"))]
    ParseApiVersion {
        source: ParseGroupVersionError,
        api_version: String,
    },

    #[snafu(display("API resource {api_version}/{kind} is not served by the cluster"))]
    UnknownResource { api_version: String, kind: String },

    #[snafu(display("failed to look up API resource {api_version}/{kind}"))]
    LookupResource {
        source: kube::Error,
        api_version: String,
        kind: String,
    },

    #[snafu(display("failed to get PackageVariant {name:?}"))]
    GetVariant { source: kube::Error, name: String },

    #[snafu(display("failed to create PackageVariant {name:?}"))]
    CreateVariant { source: kube::Error, name: String },

    #[snafu(display("failed to update PackageVariant {name:?}"))]
    UpdateVariant { source: kube::Error, name: String },

    #[snafu(display("PackageVariant {name:?} was modified concurrently"))]
    Conflict { name: String },

    #[snafu(display("failed to delete PackageVariant {name:?}"))]
    DeleteVariant { source: kube::Error, name: String },

    #[snafu(display("failed to update the status of PackageVariantSet {name:?}"))]
    UpdateStatus { source: kube::Error, name: String },

    #[snafu(display("object has no name"))]
    ObjectMissingName,

    #[snafu(display("object has no namespace"))]
    ObjectMissingNamespace,
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Lists, reads and writes the objects a PackageVariantSet depends on.
///
/// Every operation acts on a single object or a single list call, retries are up to the caller.
#[async_trait]
pub trait VariantStore: Send + Sync {
    /// Lists the Repositories in `namespace` which match `selector`.
    async fn list_repositories(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Repository>>;

    /// Lists the objects in `namespace` which match `selector` and `labels`. Unset fields of
    /// `selector` match any value. Returned objects carry their type information.
    async fn list_objects(
        &self,
        namespace: &str,
        selector: &ObjectSelector,
        labels: &Selector,
    ) -> Result<Vec<DynamicObject>>;

    /// Lists the PackageVariants in `namespace` which match `labels`.
    async fn list_variants(&self, namespace: &str, labels: &Selector)
    -> Result<Vec<PackageVariant>>;

    async fn get_variant(&self, namespace: &str, name: &str) -> Result<Option<PackageVariant>>;

    async fn create_variant(&self, variant: &PackageVariant) -> Result<PackageVariant>;

    /// Replaces a PackageVariant. Fails with [`Error::Conflict`] if the object changed since
    /// `variant` was read.
    async fn update_variant(&self, variant: &PackageVariant) -> Result<PackageVariant>;

    /// Deletes a PackageVariant. Deleting an object which is already gone succeeds.
    async fn delete_variant(&self, variant: &PackageVariant) -> Result<()>;

    async fn update_status(
        &self,
        set: &PackageVariantSet,
        status: &PackageVariantSetStatus,
    ) -> Result<()>;
}
