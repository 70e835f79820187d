//! The reconciliation pass of a PackageVariantSet.
//!
//! A pass resolves the targets of a set, renders one PackageVariant per target and converges the
//! PackageVariants owned by the set towards the rendered ones:
//!
//! * missing PackageVariants are created,
//! * PackageVariants whose spec differs from the rendered one are updated,
//! * owned PackageVariants which no longer correspond to a target are deleted.
//!
//! Errors of single targets or single store operations are collected in the [`PassReport`] and do
//! not stop the rest of the pass. Only an invalid spec-level field stops a pass before anything
//! is written.

use std::{collections::BTreeMap, fmt};

use futures::{StreamExt, stream};
use indexmap::IndexMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::{ResourceExt, api::ObjectMeta};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, IntoStaticStr};

use crate::{
    crd::{PackageVariant, PackageVariantSet, PackageVariantSetStatus, VARIANT_SET_LABEL},
    expression::ExpressionEvaluator,
    naming::variant_name,
    owner::{self, controller_reference, is_controlled_by},
    render::{self, RenderedVariant, Renderer, VariantIdentity},
    resolver::{self, Resolver, TargetKey, UnsetPackagePolicy, validate_upstream},
    selector::{Selector, SelectorError},
    status::condition::{
        Condition, ConditionBuilder, ConditionSet, ConditionStatus, ConditionType,
        HasStatusCondition, StalledConditionBuilder, compute_conditions,
    },
    store::{self, VariantStore},
};

/// How often an update is attempted when it keeps conflicting with other writers.
pub const MAX_UPDATE_ATTEMPTS: usize = 3;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors which stop a pass before any PackageVariant is written.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("PackageVariantSet has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("invalid PackageVariantSet spec"))]
    InvalidSpec { source: resolver::Error },

    #[snafu(display("failed to build the owner reference of the PackageVariantSet"))]
    OwnerReference { source: owner::Error },

    #[snafu(display("failed to build the selector for owned PackageVariants"))]
    OwnedVariantSelector { source: SelectorError },

    #[snafu(display("failed to list owned PackageVariants"))]
    ListVariants { source: store::Error },

    #[snafu(display("failed to update the status of the PackageVariantSet"))]
    UpdateStatus { source: store::Error },
}

/// The classes of errors a pass reports. The string form is used as condition reason.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, IntoStaticStr)]
pub enum ErrorKind {
    /// A structural constraint of the PackageVariantSet spec is violated.
    #[strum(serialize = "SpecInvalid")]
    SpecInvalid,
    /// A selector is malformed or could not be listed.
    #[strum(serialize = "SelectorError")]
    Selector,
    /// An expression failed or produced an unusable value.
    #[strum(serialize = "ExpressionError")]
    Expression,
    /// A store operation failed.
    #[strum(serialize = "StoreError")]
    Store,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// An error of a single unit of work, reported without aborting the pass.
#[derive(Debug, Snafu)]
pub enum PassError {
    #[snafu(display("failed to resolve spec.targets[{index}]"))]
    Resolve {
        index: usize,
        source: resolver::Error,
    },

    #[snafu(display("failed to render target {target} of spec.targets[{index}]"))]
    Render {
        index: usize,
        target: TargetKey,
        source: render::Error,
    },

    #[snafu(display("failed to {operation} the PackageVariant for {identity}"))]
    Store {
        operation: OperationKind,
        identity: String,
        source: store::Error,
    },
}

impl PassError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolve { source, .. } => source.kind(),
            Self::Render { source, .. } => source.kind(),
            Self::Store { .. } => ErrorKind::Store,
        }
    }

    /// The error message including every source, e.g. for status conditions.
    pub fn full_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(error) = source {
            message.push_str(": ");
            message.push_str(&error.to_string());
            source = error.source();
        }
        message
    }
}

/// The outcome of a pass.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Number of PackageVariants the pass rendered successfully.
    pub desired: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,

    /// Operations which were not started because the set is being deleted.
    pub abandoned: usize,

    pub errors: Vec<PassError>,
}

impl PassReport {
    pub fn is_ready(&self) -> bool {
        self.errors.is_empty() && self.abandoned == 0
    }

    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    /// A one-line description of the errors: their count and the first message.
    pub fn error_summary(&self) -> Option<String> {
        let first = self.errors.first()?;
        Some(format!(
            "{count} error(s), first: {message}",
            count = self.errors.len(),
            message = first.full_message()
        ))
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "desired: {}, created: {}, updated: {}, deleted: {}, unchanged: {}, abandoned: {}, errors: {}",
            self.desired,
            self.created,
            self.updated,
            self.deleted,
            self.unchanged,
            self.abandoned,
            self.errors.len()
        )
    }
}

impl ConditionBuilder for PassReport {
    fn build_conditions(&self) -> ConditionSet {
        if let Some(summary) = self.error_summary() {
            let kind = self.errors.first().map_or(ErrorKind::Store, PassError::kind);
            return FailedPass::new(kind, &summary).build_conditions();
        }

        let ready = if self.abandoned > 0 {
            Condition {
                type_: ConditionType::Ready,
                status: ConditionStatus::False,
                reason: Some("Abandoned".to_owned()),
                message: Some("The PackageVariantSet is being deleted".to_owned()),
                last_transition_time: None,
            }
        } else {
            Condition {
                type_: ConditionType::Ready,
                status: ConditionStatus::True,
                reason: Some("Reconciled".to_owned()),
                message: Some(format!(
                    "{} PackageVariant(s) are up to date",
                    self.desired
                )),
                last_transition_time: None,
            }
        };

        vec![ready, spec_valid()].into()
    }
}

/// The conditions of a pass which failed with an error of `kind`.
#[derive(Clone, Copy, Debug)]
pub struct FailedPass<'a> {
    kind: ErrorKind,
    message: &'a str,
}

impl<'a> FailedPass<'a> {
    pub const fn new(kind: ErrorKind, message: &'a str) -> Self {
        Self { kind, message }
    }
}

impl ConditionBuilder for FailedPass<'_> {
    fn build_conditions(&self) -> ConditionSet {
        let reason: &'static str = self.kind.into();
        let ready = Condition {
            type_: ConditionType::Ready,
            status: ConditionStatus::False,
            reason: Some(reason.to_owned()),
            message: Some(self.message.to_owned()),
            last_transition_time: None,
        };

        vec![ready, spec_valid()].into()
    }
}

fn spec_valid() -> Condition {
    Condition {
        type_: ConditionType::Stalled,
        status: ConditionStatus::False,
        reason: Some("SpecValid".to_owned()),
        message: None,
        last_transition_time: None,
    }
}

#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    pub unset_package_policy: UnsetPackagePolicy,

    /// Upper bound of store operations a pass runs at the same time.
    pub max_concurrent_operations: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            unset_package_policy: UnsetPackagePolicy::default(),
            max_concurrent_operations: 8,
        }
    }
}

/// A single write against the store.
#[derive(Debug)]
enum Operation {
    Create {
        variant: PackageVariant,
        identity: VariantIdentity,
    },
    Update {
        current: PackageVariant,
        desired: RenderedVariant,
    },
    Delete {
        variant: PackageVariant,
        identity: String,
    },
}

impl Operation {
    fn kind(&self) -> OperationKind {
        match self {
            Self::Create { .. } => OperationKind::Create,
            Self::Update { .. } => OperationKind::Update,
            Self::Delete { .. } => OperationKind::Delete,
        }
    }

    fn identity(&self) -> String {
        match self {
            Self::Create { identity, .. } => identity.to_string(),
            Self::Update { desired, .. } => desired.identity.to_string(),
            Self::Delete { identity, .. } => identity.clone(),
        }
    }
}

enum OperationOutcome {
    Done(OperationKind),
    Unchanged,
    Abandoned,
    Failed(PassError),
}

/// The owned PackageVariants compared to the rendered ones.
#[derive(Debug, Default)]
struct Plan {
    operations: Vec<Operation>,
    unchanged: usize,
}

/// Drives the passes of PackageVariantSets against a [`VariantStore`].
pub struct Driver<'a> {
    store: &'a dyn VariantStore,
    evaluator: &'a dyn ExpressionEvaluator,
    options: &'a ReconcileOptions,
}

impl<'a> Driver<'a> {
    pub fn new(
        store: &'a dyn VariantStore,
        evaluator: &'a dyn ExpressionEvaluator,
        options: &'a ReconcileOptions,
    ) -> Self {
        Self {
            store,
            evaluator,
            options,
        }
    }

    /// Runs a pass and publishes its outcome as status conditions.
    ///
    /// An invalid spec marks the set as stalled and is returned as error.
    pub async fn reconcile(
        &self,
        set: &PackageVariantSet,
        abandon: &(dyn Fn() -> bool + Sync),
    ) -> Result<PassReport> {
        match self.apply(set, abandon).await {
            Ok(report) => {
                self.publish_status(set, &report).await?;
                Ok(report)
            }
            Err(Error::InvalidSpec { source }) => {
                let message = source.to_string();
                self.publish_status(set, &StalledConditionBuilder::new(&message))
                    .await?;
                Err(Error::InvalidSpec { source })
            }
            Err(Error::ListVariants { source }) => {
                let message = format!("failed to list owned PackageVariants: {source}");
                self.publish_status(set, &FailedPass::new(ErrorKind::Store, &message))
                    .await?;
                Err(Error::ListVariants { source })
            }
            Err(error) => Err(error),
        }
    }

    /// Converges the owned PackageVariants of `set` towards its targets.
    ///
    /// `abandon` is checked before every store operation. Once it returns `true` no further
    /// operation is started; operations in flight complete.
    #[tracing::instrument(skip_all, fields(set = %set.name_any()))]
    pub async fn apply(
        &self,
        set: &PackageVariantSet,
        abandon: &(dyn Fn() -> bool + Sync),
    ) -> Result<PassReport> {
        let namespace = set.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let upstream = validate_upstream(&set.spec).context(InvalidSpecSnafu)?;
        let owner = controller_reference(set).context(OwnerReferenceSnafu)?;

        let mut errors = Vec::new();

        let resolution = Resolver::new(
            self.store,
            &namespace,
            upstream,
            self.options.unset_package_policy,
        )
        .resolve(&set.spec.targets)
        .await;
        errors.extend(
            resolution
                .errors
                .into_iter()
                .map(|(index, source)| PassError::Resolve { index, source }),
        );

        let renderer = Renderer::new(self.evaluator, upstream);
        let mut desired = IndexMap::new();
        for target in &resolution.targets {
            match renderer.render(target) {
                Ok(rendered) => {
                    if let Some(previous) = desired.insert(rendered.identity.clone(), rendered) {
                        tracing::debug!(
                            identity = %previous.identity,
                            key = %target.key,
                            "several targets render to the same downstream, the later one wins"
                        );
                    }
                }
                Err(source) => {
                    tracing::warn!(
                        key = %target.key,
                        error = &source as &dyn std::error::Error,
                        "failed to render target"
                    );
                    errors.push(PassError::Render {
                        index: target.index,
                        target: target.key.clone(),
                        source,
                    });
                }
            }
        }

        let desired_count = desired.len();
        let owned = self.list_owned_variants(set, &namespace, &owner.uid).await?;
        let plan = plan(set, &namespace, &owner, desired, owned);

        let mut report = PassReport {
            desired: desired_count,
            unchanged: plan.unchanged,
            errors,
            ..PassReport::default()
        };
        self.execute(plan.operations, &namespace, &owner.uid, abandon, &mut report)
            .await;

        tracing::info!(%report, "reconciled PackageVariantSet");
        Ok(report)
    }

    /// Deletes every PackageVariant owned by `set`.
    #[tracing::instrument(skip_all, fields(set = %set.name_any()))]
    pub async fn cleanup(&self, set: &PackageVariantSet) -> Result<PassReport> {
        let namespace = set.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let owner = controller_reference(set).context(OwnerReferenceSnafu)?;

        let owned = self.list_owned_variants(set, &namespace, &owner.uid).await?;
        let plan = plan(set, &namespace, &owner, IndexMap::new(), owned);

        let mut report = PassReport::default();
        self.execute(plan.operations, &namespace, &owner.uid, &|| false, &mut report)
            .await;

        tracing::info!(%report, "retracted PackageVariants of deleted PackageVariantSet");
        Ok(report)
    }

    /// Computes the status conditions of `set` and writes them if they changed.
    ///
    /// Returns whether the status was written.
    pub async fn publish_status(
        &self,
        set: &PackageVariantSet,
        builder: &(dyn ConditionBuilder + Sync),
    ) -> Result<bool> {
        let conditions = compute_conditions(set, &[builder as &dyn ConditionBuilder]);
        if conditions == set.conditions() {
            return Ok(false);
        }

        self.store
            .update_status(set, &PackageVariantSetStatus { conditions })
            .await
            .context(UpdateStatusSnafu)?;
        Ok(true)
    }

    async fn list_owned_variants(
        &self,
        set: &PackageVariantSet,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<PackageVariant>> {
        let labels = Selector::try_from(&LabelSelector {
            match_labels: Some(BTreeMap::from([(
                VARIANT_SET_LABEL.to_owned(),
                set.name_any(),
            )])),
            match_expressions: None,
        })
        .context(OwnedVariantSelectorSnafu)?;

        let mut owned: Vec<_> = self
            .store
            .list_variants(namespace, &labels)
            .await
            .context(ListVariantsSnafu)?
            .into_iter()
            .filter(|variant| is_controlled_by(variant, owner_uid))
            .collect();
        owned.sort_by_key(|variant| variant.name_any());
        Ok(owned)
    }

    async fn execute(
        &self,
        operations: Vec<Operation>,
        namespace: &str,
        owner_uid: &str,
        abandon: &(dyn Fn() -> bool + Sync),
        report: &mut PassReport,
    ) {
        let outcomes: Vec<OperationOutcome> = stream::iter(operations)
            .map(|operation| async move {
                if abandon() {
                    return OperationOutcome::Abandoned;
                }
                self.run(operation, namespace, owner_uid).await
            })
            .buffer_unordered(self.options.max_concurrent_operations.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                OperationOutcome::Done(OperationKind::Create) => report.created += 1,
                OperationOutcome::Done(OperationKind::Update) => report.updated += 1,
                OperationOutcome::Done(OperationKind::Delete) => report.deleted += 1,
                OperationOutcome::Unchanged => report.unchanged += 1,
                OperationOutcome::Abandoned => report.abandoned += 1,
                OperationOutcome::Failed(error) => report.errors.push(error),
            }
        }
    }

    async fn run(&self, operation: Operation, namespace: &str, owner_uid: &str) -> OperationOutcome {
        let kind = operation.kind();
        let identity = operation.identity();

        let result = match operation {
            Operation::Create { variant, .. } => {
                tracing::info!(variant = %variant.name_any(), %identity, "creating PackageVariant");
                self.store
                    .create_variant(&variant)
                    .await
                    .map(|_| OperationOutcome::Done(kind))
            }
            Operation::Update { current, desired } => {
                self.update(current, &desired, namespace, owner_uid).await
            }
            Operation::Delete { variant, .. } => {
                tracing::info!(variant = %variant.name_any(), %identity, "deleting PackageVariant");
                self.store
                    .delete_variant(&variant)
                    .await
                    .map(|()| OperationOutcome::Done(kind))
            }
        };

        result.unwrap_or_else(|source| {
            tracing::warn!(
                %identity,
                operation = %kind,
                error = &source as &dyn std::error::Error,
                "PackageVariant operation failed"
            );
            OperationOutcome::Failed(PassError::Store {
                operation: kind,
                identity,
                source,
            })
        })
    }

    /// Writes the desired spec over `current`. A conflict is resolved by reading the object again
    /// and re-applying the desired spec on top of the fresh copy.
    async fn update(
        &self,
        mut current: PackageVariant,
        desired: &RenderedVariant,
        namespace: &str,
        owner_uid: &str,
    ) -> store::Result<OperationOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let name = current.name_any();
            tracing::info!(variant = %name, identity = %desired.identity, attempt, "updating PackageVariant");

            let error = match self.store.update_variant(&with_desired(current, desired)).await {
                Ok(_) => return Ok(OperationOutcome::Done(OperationKind::Update)),
                Err(error) if error.is_conflict() && attempt < MAX_UPDATE_ATTEMPTS => error,
                Err(error) => return Err(error),
            };
            tracing::debug!(
                variant = %name,
                error = &error as &dyn std::error::Error,
                "update conflicted, retrying with a fresh copy"
            );

            match self.store.get_variant(namespace, &name).await? {
                Some(fresh) if is_controlled_by(&fresh, owner_uid) => {
                    if is_up_to_date(&fresh, desired) {
                        return Ok(OperationOutcome::Unchanged);
                    }
                    current = fresh;
                }
                _ => {
                    tracing::info!(variant = %name, "PackageVariant is gone or no longer owned, skipping update");
                    return Ok(OperationOutcome::Unchanged);
                }
            }
        }
    }
}

/// Compares the owned PackageVariants with the rendered ones.
///
/// Every owned PackageVariant outside of `desired` is deleted, whether or not other targets of the
/// pass failed.
fn plan(
    set: &PackageVariantSet,
    namespace: &str,
    owner: &OwnerReference,
    desired: IndexMap<VariantIdentity, RenderedVariant>,
    owned: Vec<PackageVariant>,
) -> Plan {
    let mut plan = Plan::default();

    // The first owned object of an identity is kept, further ones are duplicates
    let mut existing: IndexMap<VariantIdentity, PackageVariant> = IndexMap::new();
    for variant in owned {
        let identity = variant
            .downstream_target()
            .map(|(repo, package)| VariantIdentity::new(repo, package));

        match identity {
            Some(identity) if !existing.contains_key(&identity) => {
                existing.insert(identity, variant);
            }
            Some(identity) => {
                tracing::info!(variant = %variant.name_any(), %identity, "found duplicate PackageVariant");
                plan.operations.push(Operation::Delete {
                    identity: identity.to_string(),
                    variant,
                });
            }
            None => plan.operations.push(Operation::Delete {
                identity: "<unset>".to_owned(),
                variant,
            }),
        }
    }

    for (identity, rendered) in desired {
        match existing.shift_remove(&identity) {
            Some(current) if is_up_to_date(&current, &rendered) => plan.unchanged += 1,
            Some(current) => plan.operations.push(Operation::Update {
                current,
                desired: rendered,
            }),
            None => plan.operations.push(Operation::Create {
                variant: new_variant(set, namespace, owner, &rendered),
                identity,
            }),
        }
    }

    plan.operations
        .extend(existing.into_iter().map(|(identity, variant)| Operation::Delete {
            identity: identity.to_string(),
            variant,
        }));

    plan
}

fn new_variant(
    set: &PackageVariantSet,
    namespace: &str,
    owner: &OwnerReference,
    rendered: &RenderedVariant,
) -> PackageVariant {
    let set_name = set.name_any();
    PackageVariant {
        metadata: ObjectMeta {
            name: Some(variant_name(&set_name, &rendered.identity)),
            namespace: Some(namespace.to_owned()),
            labels: Some(BTreeMap::from([(VARIANT_SET_LABEL.to_owned(), set_name)])),
            owner_references: Some(vec![owner.clone()]),
            ..ObjectMeta::default()
        },
        spec: rendered.spec.clone(),
    }
}

fn is_up_to_date(current: &PackageVariant, desired: &RenderedVariant) -> bool {
    current.spec == desired.spec && current.labels().contains_key(VARIANT_SET_LABEL)
}

fn with_desired(mut current: PackageVariant, desired: &RenderedVariant) -> PackageVariant {
    current.spec = desired.spec.clone();
    // The label narrows the list call for owned objects, it is restored if it went missing
    if !current.labels().contains_key(VARIANT_SET_LABEL) {
        let set_name = current
            .owner_references()
            .iter()
            .find(|reference| reference.controller == Some(true))
            .map(|reference| reference.name.clone())
            .unwrap_or_default();
        current
            .labels_mut()
            .insert(VARIANT_SET_LABEL.to_owned(), set_name);
    }
    current
}
