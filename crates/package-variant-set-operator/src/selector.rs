//! Label selector validation, rendering and matching.
//!
//! Selectors arrive as plain [`LabelSelector`]s from user input. They are parsed into a list of
//! [`Requirement`]s once, which rejects malformed selectors before any API call is made. The parsed
//! form can be rendered into the query string the API server expects, or matched against a label
//! map directly.

use std::{collections::BTreeMap, fmt::Write, sync::LazyLock};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use regex::Regex;
use snafu::{Snafu, ensure};

type Result<T, E = SelectorError> = std::result::Result<T, E>;

static LABEL_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$",
    )
    .expect("failed to compile label key regex")
});

static LABEL_VALUE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?$")
        .expect("failed to compile label value regex")
});

const LABEL_NAME_MAX_LENGTH: usize = 63;
const LABEL_PREFIX_MAX_LENGTH: usize = 253;

#[derive(Debug, PartialEq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    LabelSelectorBinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    LabelSelectorUnaryOperatorWithValues { operator: String },

    #[snafu(display("labelSelector has an invalid operator {operator:?}"))]
    LabelSelectorInvalidOperator { operator: String },

    #[snafu(display("label selector key {key:?} is not a valid label key"))]
    InvalidLabelKey { key: String },

    #[snafu(display("label selector value {value:?} for key {key:?} is not a valid label value"))]
    InvalidLabelValue { key: String, value: String },
}

/// One validated term of a label selector.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals { key: String, value: String },
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals { key, value } => labels.get(key) == Some(value),
            Self::In { key, values } => labels.get(key).is_some_and(|v| values.contains(v)),
            // A missing label is not in any set of values
            Self::NotIn { key, values } => labels.get(key).is_none_or(|v| !values.contains(v)),
            Self::Exists { key } => labels.contains_key(key),
            Self::DoesNotExist { key } => !labels.contains_key(key),
        }
    }

    fn write_query(&self, out: &mut String) {
        // Writing into a String never fails
        let _ = match self {
            Self::Equals { key, value } => write!(out, "{key}={value}"),
            Self::In { key, values } => write!(out, "{key} in ({})", values.join(", ")),
            Self::NotIn { key, values } => write!(out, "{key} notin ({})", values.join(", ")),
            Self::Exists { key } => write!(out, "{key}"),
            Self::DoesNotExist { key } => write!(out, "!{key}"),
        };
    }
}

/// A parsed, validated [`LabelSelector`]. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|requirement| requirement.matches(labels))
    }

    /// Renders the selector into a String that can be used in Kubernetes API calls.
    pub fn to_query_string(&self) -> String {
        let mut query_string = String::new();
        for (index, requirement) in self.requirements.iter().enumerate() {
            if index > 0 {
                query_string.push(',');
            }
            requirement.write_query(&mut query_string);
        }
        query_string
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = SelectorError;

    fn try_from(selector: &LabelSelector) -> Result<Self> {
        let mut requirements = Vec::new();

        // match_labels are the equivalent of a single value "In" requirement
        for (key, value) in selector.match_labels.iter().flatten() {
            validate_key(key)?;
            validate_value(key, value)?;
            requirements.push(Requirement::Equals {
                key: key.clone(),
                value: value.clone(),
            });
        }

        for requirement in selector.match_expressions.iter().flatten() {
            let key = &requirement.key;
            validate_key(key)?;

            let values = requirement.values.clone().unwrap_or_default();
            let operator = requirement.operator.as_str();
            let parsed = match operator {
                "In" | "NotIn" => {
                    ensure!(
                        !values.is_empty(),
                        LabelSelectorBinaryOperatorWithoutValuesSnafu { operator }
                    );
                    for value in &values {
                        validate_value(key, value)?;
                    }

                    if operator == "In" {
                        Requirement::In {
                            key: key.clone(),
                            values,
                        }
                    } else {
                        Requirement::NotIn {
                            key: key.clone(),
                            values,
                        }
                    }
                }
                "Exists" | "DoesNotExist" => {
                    ensure!(
                        values.is_empty(),
                        LabelSelectorUnaryOperatorWithValuesSnafu { operator }
                    );

                    if operator == "Exists" {
                        Requirement::Exists { key: key.clone() }
                    } else {
                        Requirement::DoesNotExist { key: key.clone() }
                    }
                }
                operator => return LabelSelectorInvalidOperatorSnafu { operator }.fail(),
            };
            requirements.push(parsed);
        }

        Ok(Self { requirements })
    }
}

fn validate_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (prefix, name),
        None => ("", key),
    };

    ensure!(
        name.len() <= LABEL_NAME_MAX_LENGTH
            && prefix.len() <= LABEL_PREFIX_MAX_LENGTH
            && LABEL_KEY_REGEX.is_match(key),
        InvalidLabelKeySnafu { key }
    );
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    ensure!(
        value.len() <= LABEL_NAME_MAX_LENGTH && LABEL_VALUE_REGEX.is_match(value),
        InvalidLabelValueSnafu { key, value }
    );
    Ok(())
}
