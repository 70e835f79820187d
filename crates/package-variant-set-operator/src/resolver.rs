//! Resolution of the `targets` of a PackageVariantSet into concrete downstream targets.
//!
//! Every [`Target`] entry is validated into a [`TargetSelection`] first. An entry which fails
//! validation, or whose selector cannot be listed, is reported and skipped; the remaining entries
//! are resolved regardless. Targets are deduplicated by [`TargetKey`]: a later duplicate replaces
//! an earlier one but keeps its position.

use std::fmt;

use futures::future::join_all;
use indexmap::IndexMap;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::{
    crd::{
        PackageVariantSetSpec,
        variant::Upstream,
        variant_set::{
            ObjectSelectorTarget, PackageVariantTemplate, RepositorySelectorTarget,
            RepositoryTarget, Target,
        },
    },
    expression::EvaluationContext,
    reconcile::ErrorKind,
    selector::{Selector, SelectorError},
    store::{self, VariantStore},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("spec.upstream must be set"))]
    MissingUpstream,

    #[snafu(display("spec.upstream.{field} must be set"))]
    IncompleteUpstream { field: &'static str },

    #[snafu(display(
        "exactly one of repositories, repositorySelector and objectSelector must be set, found none"
    ))]
    NoSelectionMode,

    #[snafu(display(
        "exactly one of repositories, repositorySelector and objectSelector must be set, found {count}"
    ))]
    MultipleSelectionModes { count: usize },

    #[snafu(display("repositories[{index}].name must not be empty"))]
    EmptyRepositoryName { index: usize },

    #[snafu(display(
        "objectSelector requires template.downstreamExprs.repoExpr or template.downstream.repo"
    ))]
    ObjectSelectorWithoutRepository,

    #[snafu(display("invalid label selector"))]
    InvalidSelector { source: SelectorError },

    #[snafu(display("failed to list matching Repositories"))]
    ListRepositories { source: store::Error },

    #[snafu(display("failed to list matching objects"))]
    ListObjects { source: store::Error },

    #[snafu(display("failed to convert matched object {name:?} into an evaluation context"))]
    SerializeObject {
        source: serde_json::Error,
        name: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingUpstream
            | Self::IncompleteUpstream { .. }
            | Self::NoSelectionMode
            | Self::MultipleSelectionModes { .. }
            | Self::EmptyRepositoryName { .. }
            | Self::ObjectSelectorWithoutRepository => ErrorKind::SpecInvalid,
            Self::InvalidSelector { .. }
            | Self::ListRepositories { .. }
            | Self::ListObjects { .. }
            | Self::SerializeObject { .. } => ErrorKind::Selector,
        }
    }
}

/// What happens to a target which names no package.
#[derive(
    clap::ValueEnum, Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub enum UnsetPackagePolicy {
    /// The downstream package is named after the upstream package.
    #[default]
    Upstream,
    /// No PackageVariant is created for the target.
    Skip,
}

/// The selection mode of one [`Target`] entry.
#[derive(Clone, Copy, Debug)]
pub enum TargetSelection<'a> {
    Repositories(&'a [RepositoryTarget]),
    RepositorySelector(&'a RepositorySelectorTarget),
    ObjectSelector(&'a ObjectSelectorTarget),
}

impl<'a> TryFrom<&'a Target> for TargetSelection<'a> {
    type Error = Error;

    fn try_from(target: &'a Target) -> Result<Self> {
        let mut selections = Vec::new();
        if !target.repositories.is_empty() {
            selections.push(Self::Repositories(&target.repositories));
        }
        if let Some(selector) = &target.repository_selector {
            selections.push(Self::RepositorySelector(selector));
        }
        if let Some(selector) = &target.object_selector {
            selections.push(Self::ObjectSelector(selector));
        }

        match selections.as_slice() {
            [] => NoSelectionModeSnafu.fail(),
            [selection] => Ok(*selection),
            _ => MultipleSelectionModesSnafu {
                count: selections.len(),
            }
            .fail(),
        }
    }
}

/// The deduplication key of a resolved target.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum TargetKey {
    Repository {
        repo: String,
        package: Option<String>,
    },
    Object {
        api_version: String,
        kind: String,
        name: String,
        package: Option<String>,
    },
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repository { repo, package } => {
                write!(f, "{repo}/{}", package.as_deref().unwrap_or("*"))
            }
            Self::Object {
                api_version,
                kind,
                name,
                package,
            } => write!(
                f,
                "{api_version}/{kind}/{name}/{}",
                package.as_deref().unwrap_or("*")
            ),
        }
    }
}

/// One downstream target, ready to be rendered.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTarget<'a> {
    pub key: TargetKey,

    /// The downstream repository, unset for object selector targets.
    pub repo: Option<String>,

    /// The downstream package, unset if the target names no package.
    pub package: Option<String>,

    pub context: EvaluationContext,

    /// The template of the [`Target`] entry the target was resolved from.
    pub template: Option<&'a PackageVariantTemplate>,

    /// Index of the [`Target`] entry in `spec.targets`.
    pub index: usize,
}

/// The result of resolving all entries of `spec.targets`.
#[derive(Debug, Default)]
pub struct Resolution<'a> {
    pub targets: Vec<ResolvedTarget<'a>>,

    /// Errors of the entries which could not be resolved, with the index of the entry.
    pub errors: Vec<(usize, Error)>,
}

/// Checks the spec-level constraints, which must hold before any target is resolved.
pub fn validate_upstream(spec: &PackageVariantSetSpec) -> Result<&Upstream> {
    let upstream = spec.upstream.as_ref().context(MissingUpstreamSnafu)?;
    ensure!(
        upstream.repo.as_deref().is_some_and(|repo| !repo.is_empty()),
        IncompleteUpstreamSnafu { field: "repo" }
    );
    ensure!(
        upstream
            .package
            .as_deref()
            .is_some_and(|package| !package.is_empty()),
        IncompleteUpstreamSnafu { field: "package" }
    );
    Ok(upstream)
}

pub struct Resolver<'a> {
    store: &'a dyn VariantStore,
    namespace: &'a str,
    upstream: &'a Upstream,
    unset_package_policy: UnsetPackagePolicy,
}

impl<'a> Resolver<'a> {
    pub fn new(
        store: &'a dyn VariantStore,
        namespace: &'a str,
        upstream: &'a Upstream,
        unset_package_policy: UnsetPackagePolicy,
    ) -> Self {
        Self {
            store,
            namespace,
            upstream,
            unset_package_policy,
        }
    }

    /// Resolves every entry of `targets`. Entries are listed concurrently, the result keeps the
    /// order of `targets`.
    pub async fn resolve<'t>(&self, targets: &'t [Target]) -> Resolution<'t> {
        let resolved = join_all(
            targets
                .iter()
                .enumerate()
                .map(|(index, target)| self.resolve_entry(index, target)),
        )
        .await;

        let mut unique = IndexMap::new();
        let mut errors = Vec::new();
        for (index, result) in resolved.into_iter().enumerate() {
            match result {
                Ok(entry_targets) => {
                    for target in entry_targets {
                        if let Some(previous) = unique.insert(target.key.clone(), target) {
                            tracing::debug!(
                                key = %previous.key,
                                previous_index = previous.index,
                                "target was resolved more than once, the later entry wins"
                            );
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        index,
                        error = &error as &dyn std::error::Error,
                        "failed to resolve target entry"
                    );
                    errors.push((index, error));
                }
            }
        }

        Resolution {
            targets: unique.into_values().collect(),
            errors,
        }
    }

    async fn resolve_entry<'t>(
        &self,
        index: usize,
        target: &'t Target,
    ) -> Result<Vec<ResolvedTarget<'t>>> {
        let template = target.template.as_ref();
        match TargetSelection::try_from(target)? {
            TargetSelection::Repositories(repositories) => {
                self.resolve_repositories(index, repositories, template)
            }
            TargetSelection::RepositorySelector(selector) => {
                self.resolve_repository_selector(index, selector, template)
                    .await
            }
            TargetSelection::ObjectSelector(selector) => {
                self.resolve_object_selector(index, selector, template)
                    .await
            }
        }
    }

    fn resolve_repositories<'t>(
        &self,
        index: usize,
        repositories: &[RepositoryTarget],
        template: Option<&'t PackageVariantTemplate>,
    ) -> Result<Vec<ResolvedTarget<'t>>> {
        let mut targets = Vec::new();
        for (repository_index, repository) in repositories.iter().enumerate() {
            ensure!(
                !repository.name.is_empty(),
                EmptyRepositoryNameSnafu {
                    index: repository_index
                }
            );

            for package in self.package_names(&repository.package_names) {
                let context = self.base_context(Some(&repository.name), package);
                targets.push(ResolvedTarget {
                    key: TargetKey::Repository {
                        repo: repository.name.clone(),
                        package: package.map(ToOwned::to_owned),
                    },
                    repo: Some(repository.name.clone()),
                    package: package.map(ToOwned::to_owned),
                    context,
                    template,
                    index,
                });
            }
        }
        Ok(targets)
    }

    async fn resolve_repository_selector<'t>(
        &self,
        index: usize,
        selector: &RepositorySelectorTarget,
        template: Option<&'t PackageVariantTemplate>,
    ) -> Result<Vec<ResolvedTarget<'t>>> {
        let labels = Selector::try_from(&selector.label_selector()).context(InvalidSelectorSnafu)?;
        let repositories = self
            .store
            .list_repositories(self.namespace, &labels)
            .await
            .context(ListRepositoriesSnafu)?;

        let mut targets = Vec::new();
        for repository in &repositories {
            let name = repository.name_any();
            let object = to_context_value(repository, &name)?;

            for package in self.package_names(&selector.package_names) {
                let context = self
                    .base_context(Some(&name), package)
                    .with_repository(object.clone());
                targets.push(ResolvedTarget {
                    key: TargetKey::Repository {
                        repo: name.clone(),
                        package: package.map(ToOwned::to_owned),
                    },
                    repo: Some(name.clone()),
                    package: package.map(ToOwned::to_owned),
                    context,
                    template,
                    index,
                });
            }
        }
        Ok(targets)
    }

    async fn resolve_object_selector<'t>(
        &self,
        index: usize,
        selector: &ObjectSelectorTarget,
        template: Option<&'t PackageVariantTemplate>,
    ) -> Result<Vec<ResolvedTarget<'t>>> {
        // Matched objects name no repository, so the template has to provide one
        let names_repository = template.is_some_and(|template| {
            template
                .downstream_exprs
                .as_ref()
                .is_some_and(|exprs| exprs.repo_expr.is_some())
                || template
                    .downstream
                    .as_ref()
                    .is_some_and(|downstream| downstream.repo.is_some())
        });
        ensure!(names_repository, ObjectSelectorWithoutRepositorySnafu);

        let labels = Selector::try_from(&selector.selector.label_selector())
            .context(InvalidSelectorSnafu)?;
        let objects = self
            .store
            .list_objects(self.namespace, &selector.selector, &labels)
            .await
            .context(ListObjectsSnafu)?;

        let mut targets = Vec::new();
        for object in &objects {
            let name = object.name_any();
            let value = to_context_value(object, &name)?;
            let (api_version, kind) = object
                .types
                .as_ref()
                .map(|types| (types.api_version.clone(), types.kind.clone()))
                .unwrap_or_default();

            for package in self.package_names(&selector.package_names) {
                let context = self.base_context(None, package).with_target(value.clone());
                targets.push(ResolvedTarget {
                    key: TargetKey::Object {
                        api_version: api_version.clone(),
                        kind: kind.clone(),
                        name: name.clone(),
                        package: package.map(ToOwned::to_owned),
                    },
                    repo: None,
                    package: package.map(ToOwned::to_owned),
                    context,
                    template,
                    index,
                });
            }
        }
        Ok(targets)
    }

    /// The package names a target expands to. An empty list expands to a single unset package,
    /// unless the unset package policy skips those targets.
    fn package_names<'n>(&self, package_names: &'n [String]) -> Vec<Option<&'n str>> {
        if !package_names.is_empty() {
            return package_names.iter().map(|name| Some(name.as_str())).collect();
        }

        match self.unset_package_policy {
            UnsetPackagePolicy::Upstream => vec![None],
            UnsetPackagePolicy::Skip => {
                tracing::debug!("skipping target without package names");
                Vec::new()
            }
        }
    }

    fn base_context(&self, repo: Option<&str>, package: Option<&str>) -> EvaluationContext {
        let mut context = EvaluationContext::new().with_upstream(self.upstream);
        if let Some(repo) = repo {
            context = context.with_repo_default(repo);
        }
        if let Some(package) = package.or(self.upstream.package.as_deref()) {
            context = context.with_package_default(package);
        }
        context
    }
}

fn to_context_value<T: Serialize>(object: &T, name: &str) -> Result<serde_json::Value> {
    serde_json::to_value(object).context(SerializeObjectSnafu { name })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::testing::MemoryStore;

    fn upstream() -> Upstream {
        Upstream {
            repo: Some("catalog".to_owned()),
            package: Some("basens".to_owned()),
            revision: Some("v1".to_owned()),
        }
    }

    fn targets(yaml: &str) -> Vec<Target> {
        serde_yaml::from_str(yaml).expect("valid targets")
    }

    fn store() -> MemoryStore {
        MemoryStore::default()
            .with_repository("edge-1", &[("env", "prod"), ("region", "eu")])
            .with_repository("edge-2", &[("env", "prod"), ("region", "us")])
            .with_repository("lab", &[("env", "dev")])
            .with_object(
                "infra.example.com/v1",
                "WorkloadCluster",
                "cluster-a",
                &[("tier", "edge")],
                serde_json::json!({"spec": {"repo": "edge-1"}}),
            )
            .with_object(
                "infra.example.com/v1",
                "WorkloadCluster",
                "cluster-b",
                &[("tier", "core")],
                serde_json::json!({"spec": {"repo": "edge-2"}}),
            )
    }

    fn keys(resolution: &Resolution<'_>) -> Vec<String> {
        resolution
            .targets
            .iter()
            .map(|target| target.key.to_string())
            .collect()
    }

    #[rstest]
    #[case::repositories("repositories: [{name: a}]", true)]
    #[case::repository_selector("repositorySelector: {}", true)]
    #[case::object_selector("objectSelector: {kind: ConfigMap}", true)]
    #[case::none("template: {}", false)]
    #[case::two_modes("{repositories: [{name: a}], repositorySelector: {}}", false)]
    #[case::three_modes(
        "{repositories: [{name: a}], repositorySelector: {}, objectSelector: {}}",
        false
    )]
    fn selection_mode_validation(#[case] target: &str, #[case] valid: bool) {
        let target: Target = serde_yaml::from_str(target).expect("valid target");

        let selection = TargetSelection::try_from(&target);

        assert_eq!(selection.is_ok(), valid);
        if let Err(error) = selection {
            assert_eq!(error.kind(), ErrorKind::SpecInvalid);
        }
    }

    #[tokio::test]
    async fn invalid_entries_resolve_nothing() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - template: {}
            - repositories: [{name: edge-1}]
              repositorySelector: {}
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert!(resolution.targets.is_empty());
        assert_eq!(resolution.errors.len(), 2);
        assert!(matches!(resolution.errors[0], (0, Error::NoSelectionMode)));
        assert!(matches!(
            resolution.errors[1],
            (1, Error::MultipleSelectionModes { count: 2 })
        ));
    }

    #[tokio::test]
    async fn explicit_repositories() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - repositories:
                - name: edge-1
                  packageNames: [ns-a, ns-b]
                - name: edge-2
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert!(resolution.errors.is_empty());
        assert_eq!(keys(&resolution), ["edge-1/ns-a", "edge-1/ns-b", "edge-2/*"]);

        let unset = &resolution.targets[2];
        assert_eq!(unset.package, None);
        assert_eq!(unset.context.get_str("packageDefault"), Some("basens"));
        assert_eq!(unset.context.get_str("repoDefault"), Some("edge-2"));
        assert!(unset.context.get("repository").is_none());
    }

    #[tokio::test]
    async fn unset_package_skipped() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - repositories:
                - name: edge-1
                  packageNames: [ns-a]
                - name: edge-2
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Skip)
            .resolve(&targets)
            .await;

        assert_eq!(keys(&resolution), ["edge-1/ns-a"]);
    }

    #[tokio::test]
    async fn repository_selector() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - repositorySelector:
                matchLabels:
                  env: prod
                packageNames: [ns-a]
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert!(resolution.errors.is_empty());
        assert_eq!(keys(&resolution), ["edge-1/ns-a", "edge-2/ns-a"]);

        let repository = resolution.targets[0]
            .context
            .get("repository")
            .expect("repository is exposed");
        assert_eq!(repository["metadata"]["labels"]["region"], "eu");
    }

    #[tokio::test]
    async fn zero_matches_is_not_an_error() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - repositorySelector:
                matchLabels:
                  env: staging
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert!(resolution.errors.is_empty());
        assert!(resolution.targets.is_empty());
    }

    #[tokio::test]
    async fn object_selector() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - objectSelector:
                apiVersion: infra.example.com/v1
                kind: WorkloadCluster
                matchLabels:
                  tier: edge
              template:
                downstreamExprs:
                  repoExpr: target.spec.repo
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert!(resolution.errors.is_empty());
        assert_eq!(
            keys(&resolution),
            ["infra.example.com/v1/WorkloadCluster/cluster-a/*"]
        );

        let target = &resolution.targets[0];
        assert_eq!(target.repo, None);
        assert!(target.context.get("repoDefault").is_none());
        assert_eq!(target.context.get("target").expect("set")["spec"]["repo"], "edge-1");
    }

    #[tokio::test]
    async fn object_selector_requires_repository() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - objectSelector:
                kind: WorkloadCluster
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert!(resolution.targets.is_empty());
        assert!(matches!(
            resolution.errors.as_slice(),
            [(0, Error::ObjectSelectorWithoutRepository)]
        ));
    }

    #[tokio::test]
    async fn selector_errors_do_not_abort_other_entries() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - repositorySelector:
                matchExpressions:
                  - key: env
                    operator: Exists
                    values: [prod]
            - repositories:
                - name: edge-1
                  packageNames: [ns-a]
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert_eq!(keys(&resolution), ["edge-1/ns-a"]);
        assert_eq!(resolution.errors.len(), 1);
        assert_eq!(resolution.errors[0].0, 0);
        assert_eq!(resolution.errors[0].1.kind(), ErrorKind::Selector);
    }

    #[tokio::test]
    async fn failed_listing_is_a_selector_error() {
        let store = store();
        store.fail_repository_listing();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - repositorySelector: {}
            - repositories:
                - name: edge-1
                  packageNames: [ns-a]
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert_eq!(keys(&resolution), ["edge-1/ns-a"]);
        assert!(matches!(
            resolution.errors.as_slice(),
            [(0, Error::ListRepositories { .. })]
        ));
    }

    #[tokio::test]
    async fn duplicates_keep_first_position_and_last_template() {
        let store = store();
        let upstream = upstream();
        let targets = targets(indoc! {"
            - repositories:
                - name: edge-1
                  packageNames: [ns-a]
                - name: edge-2
                  packageNames: [ns-a]
              template:
                labels:
                  source: first
            - repositorySelector:
                matchLabels:
                  region: eu
                packageNames: [ns-a]
              template:
                labels:
                  source: second
        "});

        let resolution = Resolver::new(&store, "default", &upstream, UnsetPackagePolicy::Upstream)
            .resolve(&targets)
            .await;

        assert_eq!(keys(&resolution), ["edge-1/ns-a", "edge-2/ns-a"]);
        assert_eq!(resolution.targets[0].index, 1);
        assert_eq!(
            resolution.targets[0]
                .template
                .and_then(|template| template.labels.get("source"))
                .map(String::as_str),
            Some("second")
        );
    }

    #[rstest]
    #[case::complete(Some(upstream()), None)]
    #[case::missing(None, Some("spec.upstream must be set"))]
    #[case::missing_package(
        Some(Upstream { package: None, ..upstream() }),
        Some("spec.upstream.package must be set")
    )]
    #[case::empty_repo(
        Some(Upstream { repo: Some(String::new()), ..upstream() }),
        Some("spec.upstream.repo must be set")
    )]
    fn upstream_validation(#[case] upstream: Option<Upstream>, #[case] expected: Option<&str>) {
        let spec = PackageVariantSetSpec {
            upstream,
            targets: Vec::new(),
        };

        let result = validate_upstream(&spec);

        assert_eq!(result.err().map(|error| error.to_string()).as_deref(), expected);
    }
}
