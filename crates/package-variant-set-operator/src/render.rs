//! Rendering of one resolved target into a [`PackageVariantSpec`].
//!
//! Static template fields are copied first, expression fields are evaluated against the context
//! of the target and applied on top. Rendering is a pure function of the target and its template:
//! the same input always yields the same spec.

use std::{collections::BTreeMap, fmt};

use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    crd::{
        PackageVariantSpec,
        variant::{Downstream, InjectionSelector, PackageContext, Upstream},
        variant_set::{InjectionSelectorExprs, MapExpr, PackageVariantTemplate},
    },
    expression::{self, EvaluationContext, ExpressionEvaluator},
    reconcile::ErrorKind,
    resolver::{ResolvedTarget, TargetKey},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to evaluate {field}"))]
    Evaluate {
        source: expression::Error,
        field: String,
    },

    #[snafu(display("{field} evaluated to an empty string"))]
    EmptyValue { field: String },

    #[snafu(display("no downstream repository is set for target {target}"))]
    MissingDownstreamRepository { target: TargetKey },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Evaluate { .. } | Self::EmptyValue { .. } => ErrorKind::Expression,
            Self::MissingDownstreamRepository { .. } => ErrorKind::SpecInvalid,
        }
    }
}

/// The downstream `(repository, package)` pair a PackageVariant writes to.
///
/// At most one PackageVariant per identity is kept for a PackageVariantSet.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct VariantIdentity {
    pub repo: String,
    pub package: String,
}

impl VariantIdentity {
    pub fn new(repo: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            package: package.into(),
        }
    }
}

impl fmt::Display for VariantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.package)
    }
}

/// The desired state of one PackageVariant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedVariant {
    pub identity: VariantIdentity,
    pub spec: PackageVariantSpec,
}

pub struct Renderer<'a> {
    evaluator: &'a dyn ExpressionEvaluator,
    upstream: &'a Upstream,
}

impl<'a> Renderer<'a> {
    pub fn new(evaluator: &'a dyn ExpressionEvaluator, upstream: &'a Upstream) -> Self {
        Self {
            evaluator,
            upstream,
        }
    }

    pub fn render(&self, target: &ResolvedTarget<'_>) -> Result<RenderedVariant> {
        let empty = PackageVariantTemplate::default();
        let template = target.template.unwrap_or(&empty);
        let context = &target.context;

        let identity = self.downstream(target, template)?;

        let labels = self.merge_map(&template.labels, &template.label_exprs, "labelExprs", context)?;
        let annotations = self.merge_map(
            &template.annotations,
            &template.annotation_exprs,
            "annotationExprs",
            context,
        )?;
        let package_context = self.package_context(template, context)?;
        let injectors = self.injectors(template, context)?;

        Ok(RenderedVariant {
            spec: PackageVariantSpec {
                upstream: Some(self.upstream.clone()),
                downstream: Some(Downstream {
                    repo: Some(identity.repo.clone()),
                    package: Some(identity.package.clone()),
                }),
                adoption_policy: template.adoption_policy,
                deletion_policy: template.deletion_policy,
                labels,
                annotations,
                package_context,
                pipeline: template.pipeline.clone(),
                injectors,
            },
            identity,
        })
    }

    /// Target first, then the static downstream, then the downstream expressions. A package which
    /// is still unset falls back to the upstream package.
    fn downstream(
        &self,
        target: &ResolvedTarget<'_>,
        template: &PackageVariantTemplate,
    ) -> Result<VariantIdentity> {
        let mut repo = target.repo.clone();
        let mut package = target.package.clone();

        if let Some(downstream) = &template.downstream {
            if let Some(static_repo) = &downstream.repo {
                repo = Some(static_repo.clone());
            }
            if let Some(static_package) = &downstream.package {
                package = Some(static_package.clone());
            }
        }

        if let Some(exprs) = &template.downstream_exprs {
            if let Some(expression) = &exprs.repo_expr {
                repo = Some(self.evaluate_non_empty(
                    expression,
                    "downstreamExprs.repoExpr",
                    &target.context,
                )?);
            }
            if let Some(expression) = &exprs.package_expr {
                package = Some(self.evaluate_non_empty(
                    expression,
                    "downstreamExprs.packageExpr",
                    &target.context,
                )?);
            }
        }

        let repo = repo.context(MissingDownstreamRepositorySnafu {
            target: target.key.clone(),
        })?;
        let package = package
            .or_else(|| self.upstream.package.clone())
            .unwrap_or_default();

        Ok(VariantIdentity::new(repo, package))
    }

    /// Copies `base` and applies `exprs` in order.
    ///
    /// The key of an entry is `keyExpr` evaluated, else the literal `key`. The value is
    /// `valueExpr` evaluated, else the literal `value`. An entry without any key is skipped. An
    /// entry without any value moves the value found at its literal `key` to the evaluated key and
    /// is skipped if there is none.
    fn merge_map(
        &self,
        base: &BTreeMap<String, String>,
        exprs: &[MapExpr],
        field: &str,
        context: &EvaluationContext,
    ) -> Result<BTreeMap<String, String>> {
        let mut result = base.clone();

        for (index, entry) in exprs.iter().enumerate() {
            let key = match (&entry.key_expr, &entry.key) {
                (Some(expression), _) => {
                    self.evaluate_non_empty(expression, &format!("{field}[{index}].keyExpr"), context)?
                }
                (None, Some(key)) => key.clone(),
                (None, None) => {
                    tracing::debug!(field, index, "skipping entry without key or keyExpr");
                    continue;
                }
            };

            let value = match (&entry.value_expr, &entry.value) {
                (Some(expression), _) => Some(self.evaluate(
                    expression,
                    &format!("{field}[{index}].valueExpr"),
                    context,
                )?),
                (None, Some(value)) => Some(value.clone()),
                (None, None) => None,
            };

            match value {
                Some(value) => {
                    result.insert(key, value);
                }
                None => {
                    let moved = entry.key.as_ref().and_then(|literal| result.remove(literal));
                    match moved {
                        Some(value) => {
                            result.insert(key, value);
                        }
                        None => tracing::debug!(
                            field,
                            index,
                            key = %key,
                            "skipping key remapping, the literal key is not set"
                        ),
                    }
                }
            }
        }

        Ok(result)
    }

    /// Additions are applied before removals, a key both added and removed ends up absent.
    fn package_context(
        &self,
        template: &PackageVariantTemplate,
        context: &EvaluationContext,
    ) -> Result<Option<PackageContext>> {
        let no_exprs = Default::default();
        let exprs = template.package_context_exprs.as_ref().unwrap_or(&no_exprs);

        let mut data = self.merge_map(
            &template.package_context,
            &exprs.data_exprs,
            "packageContextExprs.dataExprs",
            context,
        )?;

        let mut remove_keys = Vec::new();
        for (index, expression) in exprs.remove_key_exprs.iter().enumerate() {
            let key = self.evaluate_non_empty(
                expression,
                &format!("packageContextExprs.removeKeyExprs[{index}]"),
                context,
            )?;
            data.remove(&key);
            if !remove_keys.contains(&key) {
                remove_keys.push(key);
            }
        }

        if data.is_empty() && remove_keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(PackageContext { data, remove_keys }))
    }

    fn injectors(
        &self,
        template: &PackageVariantTemplate,
        context: &EvaluationContext,
    ) -> Result<Vec<InjectionSelector>> {
        let mut injectors = template.injectors.clone();

        for (index, exprs) in template.injector_exprs.iter().enumerate() {
            injectors.push(self.injector(index, exprs, context)?);
        }

        Ok(injectors)
    }

    fn injector(
        &self,
        index: usize,
        exprs: &InjectionSelectorExprs,
        context: &EvaluationContext,
    ) -> Result<InjectionSelector> {
        let optional = |expression: &Option<String>, name: &str| {
            expression
                .as_deref()
                .map(|expression| {
                    self.evaluate(
                        expression,
                        &format!("injectorExprs[{index}].{name}"),
                        context,
                    )
                })
                .transpose()
        };

        Ok(InjectionSelector {
            group: optional(&exprs.group_expr, "groupExpr")?,
            version: optional(&exprs.version_expr, "versionExpr")?,
            kind: optional(&exprs.kind_expr, "kindExpr")?,
            name: self.evaluate_non_empty(
                &exprs.name_expr,
                &format!("injectorExprs[{index}].nameExpr"),
                context,
            )?,
        })
    }

    fn evaluate(&self, expression: &str, field: &str, context: &EvaluationContext) -> Result<String> {
        self.evaluator
            .evaluate(expression, context)
            .context(EvaluateSnafu { field })
    }

    fn evaluate_non_empty(
        &self,
        expression: &str,
        field: &str,
        context: &EvaluationContext,
    ) -> Result<String> {
        let value = self.evaluate(expression, field, context)?;
        if value.is_empty() {
            return EmptyValueSnafu { field }.fail();
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::{
        crd::variant::{AdoptionPolicy, DeletionPolicy},
        expression::JinjaEvaluator,
    };

    /// Evaluates quoted expressions to their content and anything else to itself.
    struct LiteralEvaluator;

    impl ExpressionEvaluator for LiteralEvaluator {
        fn evaluate(&self, expression: &str, _context: &EvaluationContext) -> expression::Result<String> {
            Ok(expression.trim_matches('\'').to_owned())
        }
    }

    fn upstream() -> Upstream {
        Upstream {
            repo: Some("catalog".to_owned()),
            package: Some("basens".to_owned()),
            revision: Some("v1".to_owned()),
        }
    }

    fn repository_target<'a>(
        repo: &str,
        package: Option<&str>,
        template: &'a PackageVariantTemplate,
    ) -> ResolvedTarget<'a> {
        let context = EvaluationContext::new()
            .with_upstream(&upstream())
            .with_repo_default(repo)
            .with_package_default(package.unwrap_or("basens"))
            .with_repository(serde_json::json!({
                "metadata": {"name": repo, "labels": {"region": "eu-west"}},
            }));

        ResolvedTarget {
            key: TargetKey::Repository {
                repo: repo.to_owned(),
                package: package.map(ToOwned::to_owned),
            },
            repo: Some(repo.to_owned()),
            package: package.map(ToOwned::to_owned),
            context,
            template: Some(template),
            index: 0,
        }
    }

    fn object_target(template: &PackageVariantTemplate) -> ResolvedTarget<'_> {
        ResolvedTarget {
            key: TargetKey::Object {
                api_version: "infra.example.com/v1".to_owned(),
                kind: "WorkloadCluster".to_owned(),
                name: "cluster-a".to_owned(),
                package: None,
            },
            repo: None,
            package: None,
            context: EvaluationContext::new()
                .with_upstream(&upstream())
                .with_package_default("basens")
                .with_target(serde_json::json!({
                    "metadata": {"name": "cluster-a"},
                    "spec": {"repo": "edge-1", "configMap": "cluster-a-settings"},
                })),
            template: Some(template),
            index: 0,
        }
    }

    fn template(yaml: &str) -> PackageVariantTemplate {
        serde_yaml::from_str(yaml).expect("valid template")
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn expression_overrides_static_value() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            labels:
              a: "1"
            labelExprs:
              - keyExpr: a
                valueExpr: "'2'"
        "#});
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let rendered = Renderer::new(&LiteralEvaluator, &upstream)
            .render(&target)
            .expect("render succeeds");

        assert_eq!(rendered.spec.labels, labels(&[("a", "2")]));
    }

    #[test]
    fn expression_overrides_static_value_with_jinja() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            labels:
              a: "1"
              b: "1"
            labelExprs:
              - keyExpr: "'a'"
                valueExpr: "'2'"
              - keyExpr: "'region'"
                valueExpr: repository.metadata.labels.region
        "#});
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let rendered = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect("render succeeds");

        assert_eq!(
            rendered.spec.labels,
            labels(&[("a", "2"), ("b", "1"), ("region", "eu-west")])
        );
    }

    #[rstest]
    #[case::value_only_overrides_literal_key(
        "[{key: a, valueExpr: \"'2'\"}]",
        &[("a", "2"), ("b", "1")]
    )]
    #[case::literal_value_at_evaluated_key(
        "[{keyExpr: \"'c'\", value: \"3\"}]",
        &[("a", "1"), ("b", "1"), ("c", "3")]
    )]
    #[case::key_only_remaps_existing_entry(
        "[{key: a, keyExpr: \"'z'\"}]",
        &[("b", "1"), ("z", "1")]
    )]
    #[case::key_only_without_existing_entry_is_skipped(
        "[{key: missing, keyExpr: \"'z'\"}]",
        &[("a", "1"), ("b", "1")]
    )]
    #[case::later_entries_win(
        "[{key: a, value: \"x\"}, {key: a, value: \"y\"}]",
        &[("a", "y"), ("b", "1")]
    )]
    fn map_expression_precedence(#[case] exprs: &str, #[case] expected: &[(&str, &str)]) {
        let upstream = upstream();
        let template = PackageVariantTemplate {
            annotations: labels(&[("a", "1"), ("b", "1")]),
            annotation_exprs: serde_yaml::from_str(exprs).expect("valid exprs"),
            ..Default::default()
        };
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let rendered = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect("render succeeds");

        assert_eq!(rendered.spec.annotations, labels(expected));
    }

    #[test]
    fn map_expression_without_key_is_skipped() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            labels:
              a: "1"
            labelExprs:
              - valueExpr: "'2'"
              - key: b
                value: "3"
        "#});
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let rendered = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect("entry without key is skipped");

        assert_eq!(rendered.spec.labels, labels(&[("a", "1"), ("b", "3")]));
    }

    #[test]
    fn bare_names_are_variables_in_jinja() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            labels:
              a: "1"
            labelExprs:
              - keyExpr: a
                valueExpr: "'2'"
        "#});
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let error = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect_err("`a` is an undefined variable");

        assert_eq!(error.kind(), ErrorKind::Expression);
        assert_eq!(error.to_string(), "failed to evaluate labelExprs[0].keyExpr");
    }

    #[test]
    fn removal_after_additions() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            packageContext:
              keep: "1"
              y: "static"
            packageContextExprs:
              dataExprs:
                - keyExpr: "'x'"
                  valueExpr: "'added'"
              removeKeyExprs:
                - "'x'"
                - "'y'"
        "#});
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let rendered = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect("render succeeds");

        let package_context = rendered.spec.package_context.expect("context is set");
        assert_eq!(package_context.data, labels(&[("keep", "1")]));
        assert_eq!(package_context.remove_keys, ["x", "y"]);
    }

    #[test]
    fn empty_package_context_is_omitted() {
        let upstream = upstream();
        let template = PackageVariantTemplate::default();
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let rendered = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect("render succeeds");

        assert_eq!(rendered.spec.package_context, None);
    }

    #[rstest]
    #[case::target_only("{}", Some("ns-a"), "edge-1/ns-a")]
    #[case::unset_package_uses_upstream("{}", None, "edge-1/basens")]
    #[case::static_downstream_overrides_target(
        "{downstream: {package: fixed}}",
        Some("ns-a"),
        "edge-1/fixed"
    )]
    #[case::expressions_override_static(
        "{downstream: {repo: static}, downstreamExprs: {repoExpr: \"'expr'\", packageExpr: \"packageDefault ~ '-x'\"}}",
        Some("ns-a"),
        "expr/ns-a-x"
    )]
    fn downstream_precedence(
        #[case] template: &str,
        #[case] package: Option<&str>,
        #[case] expected: &str,
    ) {
        let upstream = upstream();
        let template = self::template(template);
        let target = repository_target("edge-1", package, &template);

        let rendered = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect("render succeeds");

        assert_eq!(rendered.identity.to_string(), expected);
        assert_eq!(
            rendered.spec.downstream,
            Some(Downstream {
                repo: Some(rendered.identity.repo.clone()),
                package: Some(rendered.identity.package.clone()),
            })
        );
    }

    #[test]
    fn object_target_takes_repository_from_expression() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            downstreamExprs:
              repoExpr: target.spec.repo
            injectorExprs:
              - nameExpr: target.spec.configMap
                kindExpr: "'ConfigMap'"
        "#});
        let target = object_target(&template);

        let rendered = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect("render succeeds");

        assert_eq!(rendered.identity, VariantIdentity::new("edge-1", "basens"));
        assert_eq!(
            rendered.spec.injectors,
            [InjectionSelector {
                group: None,
                version: None,
                kind: Some("ConfigMap".to_owned()),
                name: "cluster-a-settings".to_owned(),
            }]
        );
    }

    #[test]
    fn object_target_without_repository_fails() {
        let upstream = upstream();
        let template = PackageVariantTemplate::default();
        let target = object_target(&template);

        let error = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect_err("no repository");

        assert_eq!(error.kind(), ErrorKind::SpecInvalid);
    }

    #[test]
    fn failed_expression_fails_target() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            annotationExprs:
              - key: owner
                valueExpr: repository.metadata.annotations.owner
        "#});
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let error = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect_err("undefined attribute");

        assert_eq!(error.kind(), ErrorKind::Expression);
        assert_eq!(
            error.to_string(),
            "failed to evaluate annotationExprs[0].valueExpr"
        );
    }

    #[test]
    fn static_fields_are_copied() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            adoptionPolicy: adoptExisting
            deletionPolicy: orphan
            pipeline:
              mutators:
                - image: gcr.io/kpt-fn/set-namespace:v0.4
                  configMap:
                    namespace: example
            injectors:
              - kind: ConfigMap
                name: shared
            injectorExprs:
              - nameExpr: repoDefault ~ '-settings'
        "#});
        let target = repository_target("edge-1", Some("ns-a"), &template);

        let rendered = Renderer::new(&JinjaEvaluator::new(), &upstream)
            .render(&target)
            .expect("render succeeds");

        assert_eq!(rendered.spec.upstream, Some(upstream.clone()));
        assert_eq!(rendered.spec.adoption_policy, Some(AdoptionPolicy::AdoptExisting));
        assert_eq!(rendered.spec.deletion_policy, Some(DeletionPolicy::Orphan));
        assert_eq!(rendered.spec.pipeline, template.pipeline);
        assert_eq!(
            rendered
                .spec
                .injectors
                .iter()
                .map(|injector| injector.name.as_str())
                .collect::<Vec<_>>(),
            ["shared", "edge-1-settings"]
        );
    }

    #[test]
    fn render_is_deterministic() {
        let upstream = upstream();
        let template = template(indoc! {r#"
            labels:
              tier: edge
            labelExprs:
              - keyExpr: "'region'"
                valueExpr: repository.metadata.labels.region
            packageContextExprs:
              dataExprs:
                - key: cluster
                  valueExpr: repoDefault
        "#});
        let target = repository_target("edge-1", Some("ns-a"), &template);
        let evaluator = JinjaEvaluator::new();
        let renderer = Renderer::new(&evaluator, &upstream);

        let first = renderer.render(&target).expect("render succeeds");
        let second = renderer.render(&target).expect("render succeeds");

        assert_eq!(first, second);
    }
}
