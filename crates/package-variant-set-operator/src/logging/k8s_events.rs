//! Reconcile errors as Kubernetes events on the failing PackageVariantSet.

use std::fmt::Write as _;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    core::DynamicObject,
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
    },
};
use tracing::Instrument;

use super::controller::ReconcilerError;
use crate::client::Client;

/// Events are rejected by the API server if their note exceeds this many bytes.
const MAX_NOTE_LENGTH: usize = 1024;

const ELLIPSIS: char = '…';

/// Builds a `Warning` event whose note is the whole error chain.
fn warning_event<E: ReconcilerError>(error: &E) -> Event {
    let mut note = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        // Writing to a String cannot fail
        let _ = write!(note, ": {cause}");
        source = cause.source();
    }
    truncate_note(&mut note, MAX_NOTE_LENGTH);

    Event {
        type_: EventType::Warning,
        reason: error.category().to_owned(),
        note: Some(note),
        action: "Reconcile".to_owned(),
        secondary: None,
    }
}

/// Publishes `error` as event on `set` in the background.
///
/// The controller reports failing objects with their type erased, `set` carries the
/// PackageVariantSet's group, version and kind.
#[tracing::instrument(skip(client, error))]
pub(super) fn publish_error<E: ReconcilerError>(
    client: &Client,
    controller: &str,
    error: &E,
    set: &ObjectRef<DynamicObject>,
) {
    let recorder = Recorder::new(
        client.as_kube_client(),
        Reporter {
            controller: controller.to_owned(),
            instance: None,
        },
    );
    let reference = event_reference(set);
    let event = warning_event(error);

    tokio::spawn(
        async move {
            if let Err(error) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "Failed to publish reconcile error as event"
                );
            }
        }
        .in_current_span(),
    );
}

fn event_reference(set: &ObjectRef<DynamicObject>) -> ObjectReference {
    set.clone().into()
}

/// Cuts `note` to at most `max_len` bytes, marking the cut with an ellipsis.
fn truncate_note(note: &mut String, max_len: usize) {
    if note.len() <= max_len {
        return;
    }

    let mut end = max_len.saturating_sub(ELLIPSIS.len_utf8());
    while !note.is_char_boundary(end) {
        end -= 1;
    }
    note.truncate(end);
    if ELLIPSIS.len_utf8() <= max_len {
        note.push(ELLIPSIS);
    }
}
