//! Evaluation of template expressions.
//!
//! The renderer only depends on the [`ExpressionEvaluator`] trait: an expression goes in together
//! with the [`EvaluationContext`] of one resolved target and a string comes out. [`JinjaEvaluator`]
//! is the implementation used by the operator, it evaluates [minijinja] expressions such as
//! `target.metadata.labels.region ~ "-" ~ packageDefault`.

use std::fmt;

use minijinja::{Environment, UndefinedBehavior, Value, value::ValueKind};
use snafu::{ResultExt, Snafu};

use crate::crd::variant::Upstream;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to compile expression {expression:?}"))]
    Compile {
        source: minijinja::Error,
        expression: String,
    },

    #[snafu(display("failed to evaluate expression {expression:?}"))]
    Evaluate {
        source: minijinja::Error,
        expression: String,
    },

    #[snafu(display("expression {expression:?} evaluated to {kind}, expected a string, number or bool"))]
    UnusableValue { expression: String, kind: String },
}

/// Evaluates one expression against the context of one resolved target.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &EvaluationContext) -> Result<String>;
}

/// The variables visible to expressions.
///
/// * `repoDefault`: the repository of the target, unset for object-selector targets
/// * `packageDefault`: the package of the target, else the upstream package
/// * `upstream`: the upstream reference of the PackageVariantSet
/// * `repository`: the matched Repository object
/// * `target`: the matched object
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvaluationContext {
    variables: serde_json::Map<String, serde_json::Value>,
}

impl EvaluationContext {
    pub const REPO_DEFAULT: &str = "repoDefault";
    pub const PACKAGE_DEFAULT: &str = "packageDefault";
    pub const UPSTREAM: &str = "upstream";
    pub const REPOSITORY: &str = "repository";
    pub const TARGET: &str = "target";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(name.to_owned(), value.into());
        self
    }

    pub fn with_repo_default(self, repo: &str) -> Self {
        self.with_variable(Self::REPO_DEFAULT, repo)
    }

    pub fn with_package_default(self, package: &str) -> Self {
        self.with_variable(Self::PACKAGE_DEFAULT, package)
    }

    pub fn with_upstream(self, upstream: &Upstream) -> Self {
        self.with_variable(
            Self::UPSTREAM,
            serde_json::json!({
                "repo": upstream.repo,
                "package": upstream.package,
                "revision": upstream.revision,
            }),
        )
    }

    pub fn with_repository(self, repository: serde_json::Value) -> Self {
        self.with_variable(Self::REPOSITORY, repository)
    }

    pub fn with_target(self, target: serde_json::Value) -> Self {
        self.with_variable(Self::TARGET, target)
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(serde_json::Value::as_str)
    }
}

/// Evaluates minijinja expressions with strict undefined handling.
pub struct JinjaEvaluator {
    env: Environment<'static>,
}

impl fmt::Debug for JinjaEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JinjaEvaluator").finish_non_exhaustive()
    }
}

impl Default for JinjaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl JinjaEvaluator {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }
}

impl ExpressionEvaluator for JinjaEvaluator {
    fn evaluate(&self, expression: &str, context: &EvaluationContext) -> Result<String> {
        let compiled = self
            .env
            .compile_expression(expression)
            .context(CompileSnafu { expression })?;
        let value = compiled
            .eval(Value::from_serialize(&context.variables))
            .context(EvaluateSnafu { expression })?;

        match value.kind() {
            ValueKind::String | ValueKind::Number => Ok(value.to_string()),
            // minijinja prints booleans as `True` and `False`
            ValueKind::Bool => Ok(if value.is_true() { "true" } else { "false" }.to_owned()),
            kind => UnusableValueSnafu {
                expression,
                kind: kind.to_string(),
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn context() -> EvaluationContext {
        EvaluationContext::new()
            .with_repo_default("edge-1")
            .with_package_default("basens")
            .with_upstream(&Upstream {
                repo: Some("catalog".to_owned()),
                package: Some("basens".to_owned()),
                revision: Some("v2".to_owned()),
            })
            .with_target(serde_json::json!({
                "metadata": {
                    "name": "cluster-a",
                    "labels": {"region": "eu-west"},
                },
                "spec": {"replicas": 3, "enabled": true, "zones": ["a", "b"], "owner": null},
            }))
    }

    #[rstest]
    #[case::string_literal("'2'", "2")]
    #[case::variable("repoDefault", "edge-1")]
    #[case::nested_attribute("target.metadata.labels.region", "eu-west")]
    #[case::subscript("target.metadata.labels['region']", "eu-west")]
    #[case::concatenation("packageDefault ~ '-' ~ target.metadata.name", "basens-cluster-a")]
    #[case::number("target.spec.replicas", "3")]
    #[case::bool("target.spec.enabled", "true")]
    #[case::negated_bool("not target.spec.enabled", "false")]
    #[case::comparison("target.spec.replicas > 2", "true")]
    #[case::upstream("upstream.revision", "v2")]
    #[case::filter("target.metadata.name | upper", "CLUSTER-A")]
    fn evaluate_scalar(#[case] expression: &str, #[case] expected: &str) {
        let evaluator = JinjaEvaluator::new();

        assert_eq!(
            evaluator
                .evaluate(expression, &context())
                .expect("expression evaluates"),
            expected
        );
    }

    #[rstest]
    #[case::undefined_variable("repository.metadata.name")]
    #[case::undefined_attribute("target.metadata.annotations.owner")]
    #[case::syntax_error("target.metadata.(")]
    #[case::sequence("target.spec.zones")]
    #[case::map("target.metadata.labels")]
    #[case::none("target.spec.owner")]
    fn evaluate_fails(#[case] expression: &str) {
        let evaluator = JinjaEvaluator::new();

        assert!(evaluator.evaluate(expression, &context()).is_err());
    }

    #[test]
    fn unusable_value_names_kind() {
        let evaluator = JinjaEvaluator::new();

        let err = evaluator
            .evaluate("target.spec.zones", &context())
            .expect_err("sequence is not a scalar");

        assert!(matches!(err, Error::UnusableValue { ref kind, .. } if kind == "sequence"));
    }
}
