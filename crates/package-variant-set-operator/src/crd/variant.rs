//! The Porch [`PackageVariant`] resource.
//!
//! A PackageVariant clones one upstream package revision into a downstream repository and keeps
//! the clone up to date. The operator only ever writes the spec; reconciling a PackageVariant is
//! Porch's job.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::pipeline::Pipeline;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[kube(
    group = "config.porch.kpt.dev",
    version = "v1alpha1",
    kind = "PackageVariant",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream: Option<Downstream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adoption_policy: Option<AdoptionPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,

    /// Labels to set on the downstream package revision.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations to set on the downstream package revision.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_context: Option<PackageContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injectors: Vec<InjectionSelector>,
}

impl PackageVariant {
    /// The `(repo, package)` pair this variant writes to, if both halves are set.
    pub fn downstream_target(&self) -> Option<(&str, &str)> {
        let downstream = self.spec.downstream.as_ref()?;
        Some((downstream.repo.as_deref()?, downstream.package.as_deref()?))
    }
}

/// A reference to the upstream package revision all variants are cloned from.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub repo: Option<String>,
    pub package: Option<String>,
    pub revision: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Downstream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

/// Whether an existing downstream package that is not yet managed may be taken over.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AdoptionPolicy {
    AdoptExisting,
    AdoptNone,
}

/// What happens to the downstream package when its PackageVariant is deleted.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletionPolicy {
    Delete,
    Orphan,
}

/// Key/value data written into the `package-context.yaml` of the downstream package.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageContext {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    /// Keys which are removed from the downstream package context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_keys: Vec<String>,
}

/// Selects the in-cluster objects (usually ConfigMaps) injected into the downstream package.
///
/// An unset `group`, `version` or `kind` matches any value.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    pub name: String,
}
