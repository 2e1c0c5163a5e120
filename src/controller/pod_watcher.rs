use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ACTION_LABEL_KEY;
use crate::controller::worker_pod::{is_terminal_phase, pod_phase, DatasetAction};
use crate::controller::{remove_finalizer, Context};
use crate::errors::Result;
use crate::ext::ProvisionerResourceExt;
use crate::results::annotations_patch;

/// Watches the dataset worker pods for success or failures.
///
/// Terminal phases are propagated to the owning PVC's phase annotation and
/// the worker is removed. Both steps are idempotent, so replaying the same
/// terminal event is harmless.
pub async fn run(ctx: Arc<Context>) -> Result<()> {
    let pods = Api::<Pod>::all(ctx.client.clone());
    let stream = watcher(
        pods,
        watcher::Config::default().labels(ACTION_LABEL_KEY),
    )
    .default_backoff()
    .applied_objects();

    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        let pod = match event {
            Ok(pod) => pod,
            Err(err) => {
                warn!("Worker pod watch error: {}", err);
                continue;
            }
        };

        if let Err(err) = process_pod(&ctx, &pod).await {
            error!(
                "Failed to process worker pod {}: {}",
                pod.full_name(),
                err
            );
        }
    }

    Ok(())
}

async fn process_pod(ctx: &Context, pod: &Pod) -> Result<()> {
    let Some(action) = pod
        .labels()
        .get(ACTION_LABEL_KEY)
        .and_then(|value| DatasetAction::from_label(value))
    else {
        return Ok(());
    };

    let Some(phase) = pod_phase(pod) else {
        return Ok(());
    };
    if !is_terminal_phase(phase) {
        debug!("Worker pod {}: {} -> {}", pod.name_any(), action.as_str(), phase);
        return Ok(());
    }

    info!(
        "Worker pod {}: {} -> {}",
        pod.name_any(),
        action.as_str(),
        phase
    );

    let namespace = pod
        .namespace()
        .unwrap_or_else(|| ctx.config.namespace.clone());

    for owner in pod
        .owner_references()
        .iter()
        .filter(|owner| owner.kind == "PersistentVolumeClaim")
    {
        propagate_phase(ctx, &namespace, owner, action, phase).await?;

        if action == DatasetAction::Delete && phase == "Succeeded" {
            remove_finalizer(ctx.client.clone(), &namespace, &owner.name).await?;
        }
    }

    delete_worker_pod(ctx, &namespace, &pod.name_any()).await
}

/// Records the worker's terminal phase on the owning PVC and emits the
/// matching Kubernetes Event.
async fn propagate_phase(
    ctx: &Context,
    namespace: &str,
    owner: &OwnerReference,
    action: DatasetAction,
    phase: &str,
) -> Result<()> {
    let claims = Api::<PersistentVolumeClaim>::namespaced(ctx.client.clone(), namespace);
    let patch = annotations_patch([(action.phase_annotation_key(), phase.to_owned())]);

    match claims
        .patch(&owner.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(response)) if response.code == 404 => {
            warn!(
                "PVC {}/{} is gone, dropping {} phase {}",
                namespace,
                owner.name,
                action.as_str(),
                phase
            );
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }

    let (event_type, reason, event_action) = match (action, phase) {
        (DatasetAction::Create, "Succeeded") => (EventType::Normal, "DatasetCreated", "Provision"),
        (DatasetAction::Create, _) => (EventType::Warning, "DatasetCreateFailed", "Provision"),
        (DatasetAction::Delete, "Succeeded") => (EventType::Normal, "DatasetDeleted", "Reclaim"),
        (DatasetAction::Delete, _) => (EventType::Warning, "DatasetDeleteFailed", "Reclaim"),
    };

    ctx.publish_event(
        owner_object_ref(owner, namespace),
        Event {
            type_: event_type,
            reason: reason.into(),
            note: Some(format!("Worker pod reached phase {}", phase)),
            action: event_action.into(),
            secondary: None,
        },
    )
    .await;

    Ok(())
}

async fn delete_worker_pod(ctx: &Context, namespace: &str, pod_name: &str) -> Result<()> {
    let pods = Api::<Pod>::namespaced(ctx.client.clone(), namespace);
    match pods.delete(pod_name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!("Deleted worker pod {}/{}", namespace, pod_name);
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn owner_object_ref(owner: &OwnerReference, namespace: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(owner.api_version.clone()),
        kind: Some(owner.kind.clone()),
        name: Some(owner.name.clone()),
        namespace: Some(namespace.to_owned()),
        uid: Some(owner.uid.clone()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_reference_maps_to_the_claim() {
        let owner = OwnerReference {
            api_version: "v1".into(),
            kind: "PersistentVolumeClaim".into(),
            name: "claim-a".into(),
            uid: "u1".into(),
            ..Default::default()
        };
        let reference = owner_object_ref(&owner, "app");
        assert_eq!(reference.kind.as_deref(), Some("PersistentVolumeClaim"));
        assert_eq!(reference.name.as_deref(), Some("claim-a"));
        assert_eq!(reference.namespace.as_deref(), Some("app"));
        assert_eq!(reference.uid.as_deref(), Some("u1"));
    }
}
