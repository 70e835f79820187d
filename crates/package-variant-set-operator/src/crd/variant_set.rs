//! The [`PackageVariantSet`] resource owned by this operator.
//!
//! A PackageVariantSet names one upstream package revision and a list of [`Target`]s. Every
//! target resolves to any number of downstream `(repository, package)` pairs, and for each pair
//! the operator maintains one [`PackageVariant`](crate::crd::PackageVariant), rendered from the
//! target's [`PackageVariantTemplate`].

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    crd::{
        pipeline::Pipeline,
        variant::{AdoptionPolicy, DeletionPolicy, Downstream, InjectionSelector, Upstream},
    },
    status::condition::Condition,
};

/// Expands one upstream package revision into PackageVariants for many downstream targets.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "config.porch.kpt.dev",
    version = "v1alpha1",
    kind = "PackageVariantSet",
    shortname = "pvs",
    namespaced,
    status = "PackageVariantSetStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,

    #[serde(default)]
    pub targets: Vec<Target>,
}

/// One way of selecting downstream repositories and packages.
///
/// Exactly one of `repositories`, `repositorySelector` and `objectSelector` must be set.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// An explicit list of repositories and package names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepositoryTarget>,

    /// A label selector against Porch Repository objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_selector: Option<RepositorySelectorTarget>,

    /// A selector against arbitrary objects in the namespace of the PackageVariantSet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<ObjectSelectorTarget>,

    /// How a PackageVariant is generated for each resolved target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PackageVariantTemplate>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryTarget {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package_names: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySelectorTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<LabelSelectorRequirement>>,

    /// Package names created in every matched repository.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package_names: Vec<String>,
}

impl RepositorySelectorTarget {
    pub fn label_selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: self.match_labels.clone(),
            match_expressions: self.match_expressions.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSelectorTarget {
    #[serde(flatten)]
    pub selector: ObjectSelector,

    /// Package names created for every matched object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package_names: Vec<String>,
}

/// Selects arbitrary objects. Every unset field matches anything.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<LabelSelectorRequirement>>,
}

impl ObjectSelector {
    pub fn label_selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: self.match_labels.clone(),
            match_expressions: self.match_expressions.clone(),
        }
    }
}

/// The rendering recipe for the PackageVariants of one target.
///
/// Every static field has an expression counterpart. Static maps are copied first and the
/// expression results are applied on top, key by key.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream: Option<Downstream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_exprs: Option<DownstreamExprs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adoption_policy: Option<AdoptionPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_exprs: Vec<MapExpr>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotation_exprs: Vec<MapExpr>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub package_context: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_context_exprs: Option<PackageContextExprs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injectors: Vec<InjectionSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injector_exprs: Vec<InjectionSelectorExprs>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamExprs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_expr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_expr: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageContextExprs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_exprs: Vec<MapExpr>,

    /// Expressions naming keys to remove, applied after `dataExprs`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_key_exprs: Vec<String>,
}

/// Expression counterpart of [`InjectionSelector`]. Unset optional expressions act as wildcards.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionSelectorExprs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_expr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_expr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind_expr: Option<String>,

    pub name_expr: String,
}

/// One computed map entry.
///
/// The key is `keyExpr` evaluated, falling back to the literal `key`. The value is `valueExpr`
/// evaluated, falling back to the literal `value`. An entry with a key but no value renames the
/// entry found at the literal `key`.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_expr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_expr: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantSetStatus {
    /// Describes the reconciliation state of the PackageVariantSet.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
