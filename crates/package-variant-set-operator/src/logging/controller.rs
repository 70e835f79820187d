//! Reporting of the results emitted by the PackageVariantSet controller stream.

use kube::runtime::{
    controller::{self, Action},
    reflector::ObjectRef,
};

use crate::{client::Client, crd::PackageVariantSet, logging::k8s_events};

/// Errors returned by a reconciler, grouped into categories for logs and events.
pub trait ReconcilerError: std::error::Error {
    /// The `PascalCase` category of the error, used as event reason.
    ///
    /// Usually the name of the variant, via [`strum::EnumDiscriminants`] and
    /// [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;
}

pub type ReconcileResult<E, QueueErr> =
    Result<(ObjectRef<PackageVariantSet>, Action), controller::Error<E, QueueErr>>;

/// Logs one item of the controller stream.
///
/// Reconciler failures are additionally published as `Warning` event on the PackageVariantSet,
/// so that they show up in `kubectl describe`. Failures of the controller machinery itself
/// (watch errors, missing objects) are only logged.
pub fn report_controller_reconciled<E, QueueErr>(
    client: &Client,
    controller_name: &str,
    result: &ReconcileResult<E, QueueErr>,
) where
    E: ReconcilerError + 'static,
    QueueErr: std::error::Error + 'static,
{
    match result {
        Ok((set, action)) => tracing::info!(
            controller.name = controller_name,
            %set,
            ?action,
            "Reconciled PackageVariantSet"
        ),
        Err(controller::Error::ReconcilerFailed(error, set)) => {
            tracing::error!(
                controller.name = controller_name,
                %set,
                category = error.category(),
                error = error as &dyn std::error::Error,
                "Failed to reconcile PackageVariantSet"
            );
            k8s_events::publish_error(client, controller_name, error, set);
        }
        Err(error) => tracing::error!(
            controller.name = controller_name,
            error = error as &dyn std::error::Error,
            "Controller failed"
        ),
    }
}
