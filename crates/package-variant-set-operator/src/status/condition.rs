use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::EnumCount;

use crate::crd::PackageVariantSet;

/// A **data structure** that contains a vector of [`Condition`]s.
/// Should usually be implemented on the status of a `CustomResource` or the `CustomResource` itself.
pub trait HasStatusCondition {
    fn conditions(&self) -> Vec<Condition>;
}

impl HasStatusCondition for PackageVariantSet {
    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|status| status.conditions.clone())
            .unwrap_or_default()
    }
}

/// A **data structure** that produces a [`ConditionSet`] containing all required [`Condition`]s.
pub trait ConditionBuilder {
    fn build_conditions(&self) -> ConditionSet;
}

/// Computes the final conditions to be set in the status condition field.
///
/// Conditions produced by several builders are combined first (the one with the highest
/// [`ConditionStatus`] wins, messages of equal status are joined). The result is then merged with
/// the current conditions of `resource`: the transition time is only moved when the status of a
/// condition changes, so an unchanged outcome yields conditions equal to the current ones.
pub fn compute_conditions<T: HasStatusCondition>(
    resource: &T,
    condition_builders: &[&dyn ConditionBuilder],
) -> Vec<Condition> {
    let mut new_resource_conditions = ConditionSet::new();
    for cb in condition_builders {
        let conditions: ConditionSet = cb.build_conditions();
        new_resource_conditions = new_resource_conditions.merge(conditions, update_message);
    }

    let old_resource_conditions: ConditionSet = resource.conditions().into();

    let now = Time(Timestamp::now());
    Vec::from(old_resource_conditions.merge(new_resource_conditions, update_timestamps))
        .into_iter()
        .map(|condition| Condition {
            last_transition_time: condition
                .last_transition_time
                .or_else(|| Some(now.clone())),
            ..condition
        })
        .collect()
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Last time the condition transitioned from one status to another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    /// A human readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// The reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,

    /// Type of the condition.
    #[serde(rename = "type")]
    pub type_: ConditionType,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    EnumCount,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    /// Ready indicates that every resolved target has an up-to-date PackageVariant and that no
    /// error occurred during the last reconciliation.
    #[default]
    Ready,
    /// Stalled indicates that the PackageVariantSet cannot be reconciled until its spec is fixed.
    Stalled,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    /// True means a resource is in the condition.
    #[default]
    True,
    /// False means a resource is not in the condition.
    False,
    /// Unknown means kubernetes cannot decide if a resource is in the condition or not.
    Unknown,
}

/// Helper struct to order and merge [`Condition`] objects.
#[derive(Clone, Debug, Default)]
pub struct ConditionSet {
    conditions: Vec<Option<Condition>>,
}

impl ConditionSet {
    pub fn new() -> Self {
        Self {
            // Every ConditionType has its fixed position, which keeps the ordering stable and
            // rules out storing a condition at the slot of another type. See "put".
            conditions: vec![None; ConditionType::COUNT],
        }
    }

    /// Adds a [`Condition`] to its assigned index in the conditions vector.
    pub fn put(&mut self, condition: Condition) {
        let index = condition.type_ as usize;
        self.conditions[index] = Some(condition);
    }

    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions[type_ as usize].as_ref()
    }

    /// Merges two [`ConditionSet`]s. The `condition_combiner` implements the strategy used to
    /// merge two conditions of the same type.
    fn merge(self, other: Self, condition_combiner: fn(Condition, Condition) -> Condition) -> Self {
        let mut result = Self::new();

        for (old_condition, new_condition) in self.conditions.into_iter().zip(other.conditions) {
            if let Some(condition) = match (old_condition, new_condition) {
                (Some(old), Some(new)) => Some(condition_combiner(old, new)),
                (Some(old), None) => Some(old),
                (None, Some(new)) => Some(new),
                (None, None) => None,
            } {
                result.put(condition);
            }
        }

        result
    }
}

/// A condition combiner which keeps the transition time unless the status changed.
///
/// A cleared transition time is stamped by [`compute_conditions`].
fn update_timestamps(old_condition: Condition, new_condition: Condition) -> Condition {
    if old_condition.status == new_condition.status {
        Condition {
            last_transition_time: old_condition.last_transition_time,
            ..new_condition
        }
    } else {
        Condition {
            last_transition_time: None,
            ..new_condition
        }
    }
}

/// A condition combiner strategy with the following properties:
/// 1. It preserves the condition with the highest status.
/// 2. It joins the previous messages to the current one if both conditions
///    have the same status.
fn update_message(old_condition: Condition, new_condition: Condition) -> Condition {
    match old_condition.status.cmp(&new_condition.status) {
        std::cmp::Ordering::Equal => {
            let message = Some(
                [old_condition.message, new_condition.message]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<String>>()
                    .join("\n"),
            );

            Condition {
                message,
                ..new_condition
            }
        }
        std::cmp::Ordering::Less => new_condition,
        std::cmp::Ordering::Greater => old_condition,
    }
}

impl From<ConditionSet> for Vec<Condition> {
    fn from(value: ConditionSet) -> Self {
        value.conditions.into_iter().flatten().collect()
    }
}

impl From<Vec<Condition>> for ConditionSet {
    fn from(value: Vec<Condition>) -> Self {
        let mut result = Self::new();
        for c in value {
            result.put(c);
        }
        result
    }
}

/// Builds the conditions of a PackageVariantSet whose spec cannot be reconciled at all.
#[derive(Clone, Debug)]
pub struct StalledConditionBuilder<'a> {
    message: &'a str,
}

impl<'a> StalledConditionBuilder<'a> {
    pub const fn new(message: &'a str) -> Self {
        Self { message }
    }
}

impl ConditionBuilder for StalledConditionBuilder<'_> {
    fn build_conditions(&self) -> ConditionSet {
        vec![
            Condition {
                type_: ConditionType::Ready,
                status: ConditionStatus::False,
                reason: Some("Stalled".to_owned()),
                message: Some(self.message.to_owned()),
                last_transition_time: None,
            },
            Condition {
                type_: ConditionType::Stalled,
                status: ConditionStatus::True,
                reason: Some("InvalidSpec".to_owned()),
                message: Some(self.message.to_owned()),
                last_transition_time: None,
            },
        ]
        .into()
    }
}
