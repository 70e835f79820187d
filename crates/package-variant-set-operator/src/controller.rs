//! Wires the reconciliation pass into a [`kube::runtime::Controller`].

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    Api, Resource, ResourceExt,
    runtime::{
        Controller,
        controller::Action,
        finalizer::{self, Event as FinalizerEvent, finalizer},
        reflector::{ObjectRef, Store},
        watcher,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    client::Client,
    crd::{FINALIZER_NAME, PackageVariant, PackageVariantSet},
    expression::JinjaEvaluator,
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
    reconcile::{self, Driver, ReconcileOptions},
};

pub const CONTROLLER_NAME: &str = "packagevariantset";
pub const OPERATOR_NAME: &str = "package-variant-set-operator";

/// Number of reconcile results reported to Kubernetes at the same time.
const REPORT_CONCURRENCY: usize = 16;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("PackageVariantSet has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to reconcile PackageVariantSet"))]
    Apply { source: reconcile::Error },

    #[snafu(display("failed to retract the PackageVariants of the PackageVariantSet"))]
    Cleanup { source: reconcile::Error },

    #[snafu(display("retraction of PackageVariants is incomplete: {summary}"))]
    RetractionIncomplete { summary: String },

    #[snafu(display("failed to manage the finalizer of the PackageVariantSet"))]
    Finalizer {
        #[snafu(source(from(finalizer::Error<Error>, Box::new)))]
        source: Box<finalizer::Error<Error>>,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub struct Ctx {
    pub client: Client,
    pub evaluator: JinjaEvaluator,
    pub options: ReconcileOptions,
    pub requeue_after_error: Duration,
    pub resync_interval: Duration,

    /// The controller's view of all watched PackageVariantSets.
    pub sets: Store<PackageVariantSet>,
}

impl Ctx {
    /// Whether `set` is being deleted (or already gone) according to the latest watch event.
    fn is_deleting(&self, set: &ObjectRef<PackageVariantSet>) -> bool {
        self.sets
            .get(set)
            .is_none_or(|current| current.meta().deletion_timestamp.is_some())
    }
}

pub async fn reconcile(set: Arc<PackageVariantSet>, ctx: Arc<Ctx>) -> Result<Action> {
    tracing::info!("Starting reconcile");

    let namespace = set.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let api: Api<PackageVariantSet> = ctx.client.get_namespaced_api(&namespace);

    finalizer(&api, FINALIZER_NAME, set, |event| async move {
        let driver = Driver::new(&ctx.client, &ctx.evaluator, &ctx.options);
        match event {
            FinalizerEvent::Apply(set) => {
                let set_ref = ObjectRef::from_obj(&*set);
                let abandon = || ctx.is_deleting(&set_ref);
                let report = driver.reconcile(&set, &abandon).await.context(ApplySnafu)?;

                if report.is_ready() {
                    Ok(Action::requeue(ctx.resync_interval))
                } else {
                    if let Some(summary) = report.error_summary() {
                        tracing::warn!(%summary, "PackageVariantSet reconciled with errors");
                    }
                    Ok(Action::requeue(ctx.requeue_after_error))
                }
            }
            FinalizerEvent::Cleanup(set) => {
                let report = driver.cleanup(&set).await.context(CleanupSnafu)?;
                match report.error_summary() {
                    // Keep the finalizer until every owned PackageVariant is gone
                    Some(summary) => RetractionIncompleteSnafu { summary }.fail(),
                    None => Ok(Action::await_change()),
                }
            }
        }
    })
    .await
    .context(FinalizerSnafu)
}

pub fn error_policy(_set: Arc<PackageVariantSet>, _error: &Error, ctx: Arc<Ctx>) -> Action {
    Action::requeue(ctx.requeue_after_error)
}

/// Runs the controller until a termination signal is received.
pub async fn run(
    client: Client,
    watch_namespace: &WatchNamespace,
    options: ReconcileOptions,
    requeue_after_error: Duration,
    resync_interval: Duration,
) {
    let controller = Controller::new(
        watch_namespace.get_api::<PackageVariantSet>(&client),
        watcher::Config::default(),
    );
    let ctx = Arc::new(Ctx {
        client: client.clone(),
        evaluator: JinjaEvaluator::new(),
        options,
        requeue_after_error,
        resync_interval,
        sets: controller.store(),
    });

    tracing::info!(
        controller.name = CONTROLLER_NAME,
        ?watch_namespace,
        "Starting controller"
    );
    controller
        .owns(
            watch_namespace.get_api::<PackageVariant>(&client),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each_concurrent(REPORT_CONCURRENCY, |result| {
            let client = client.clone();
            async move {
                report_controller_reconciled(&client, CONTROLLER_NAME, &result);
            }
        })
        .await;
}
