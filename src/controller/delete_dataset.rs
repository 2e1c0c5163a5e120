use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RESULTS_ANNOTATION_KEY;
use crate::controller::worker_pod::{build_worker_pod, launch_worker_pod, DatasetAction};
use crate::controller::{remove_finalizer, Context};
use crate::dataset_metadata::DatasetMetadata;
use crate::errors::{Error, Result};
use crate::ext::ProvisionerResourceExt;
use crate::results::{annotations_patch, DatasetWorkerResult, Results};
use crate::storage_class::ReclaimPolicy;

/// Reclaims the dataset of a deleted claim. The finalizer stays until the
/// delete worker reports back, so replays of the deletion event are handled
/// entirely through the phase annotation.
pub async fn reconcile(claim: &PersistentVolumeClaim, ctx: &Context) -> Result<Action> {
    if !claim.has_provisioner_finalizer() {
        // Nothing left to do, deletion proceeds without us.
        return Ok(Action::await_change());
    }

    let namespace = claim
        .namespace()
        .ok_or_else(|| Error::fatal(format!("PVC {} has no namespace", claim.name_any())))?;

    if let Some(phase) = claim.annotation(&DatasetAction::Delete.phase_annotation_key()) {
        return match phase {
            "Succeeded" => {
                remove_finalizer(ctx.client.clone(), &namespace, &claim.name_any()).await?;
                Ok(Action::await_change())
            }
            "Failed" => Err(Error::fatal(format!(
                "dataset deletion for PVC {} failed; inspect the node and clear the {} annotation to retry",
                claim.full_name(),
                DatasetAction::Delete.phase_annotation_key(),
            ))),
            // The existing worker is authoritative, wait for the watcher.
            _ => Ok(Action::requeue(Duration::from_secs(60))),
        };
    }

    let mut results = Results::from_claim(claim)?;
    let Some(create_results) = results.create_dataset.clone() else {
        debug!(
            "PVC {} never got a dataset, releasing finalizer",
            claim.full_name()
        );
        remove_finalizer(ctx.client.clone(), &namespace, &claim.name_any()).await?;
        return Ok(Action::await_change());
    };

    let storage_class_name = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.as_deref())
        .unwrap_or_default();
    let storage_class = ctx.storage_classes.get(storage_class_name).ok_or_else(|| {
        Error::fatal(format!(
            "PVC {} references unknown StorageClass '{}', cannot determine its reclaim policy",
            claim.full_name(),
            storage_class_name
        ))
    })?;

    if storage_class.reclaim_policy == ReclaimPolicy::Retain {
        info!(
            "StorageClass {} retains volumes, releasing PVC {} without touching dataset {}",
            storage_class.name,
            claim.full_name(),
            create_results.dataset_name
        );
        remove_finalizer(ctx.client.clone(), &namespace, &claim.name_any()).await?;
        return Ok(Action::await_change());
    }

    info!(
        "Destroying dataset {} of PVC {}",
        create_results.dataset_name,
        claim.full_name()
    );

    let metadata = DatasetMetadata {
        pv_name: create_results.pv_name.clone(),
        dataset_name: create_results.dataset_name.clone(),
        mount_point: create_results.mount_point.clone(),
    };
    let pod_name = metadata.pod_name(DatasetAction::Delete.as_str());
    let pod = build_worker_pod(
        &ctx.config,
        claim,
        DatasetAction::Delete,
        &pod_name,
        create_results.selected_node.as_deref(),
        delete_worker_args(&metadata),
    )?;
    let phase = launch_worker_pod(ctx.client.clone(), &namespace, &pod).await?;

    // The worker is on its way, the PV must not be handed out again.
    delete_persistent_volume(ctx, &create_results.pv_name).await?;

    results.delete_dataset = Some(DatasetWorkerResult {
        pv_name: create_results.pv_name.clone(),
        pod_name,
        dataset_name: create_results.dataset_name.clone(),
        mount_point: create_results.mount_point.clone(),
        selected_node: create_results.selected_node.clone(),
        phase: phase.clone(),
        ..Default::default()
    });

    let claims = Api::<PersistentVolumeClaim>::namespaced(ctx.client.clone(), &namespace);
    let patch = annotations_patch([
        (RESULTS_ANNOTATION_KEY.to_owned(), results.encode()?),
        (DatasetAction::Delete.phase_annotation_key(), phase),
    ]);
    claims
        .patch(
            &claim.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

    Ok(Action::requeue(Duration::from_secs(60)))
}

pub fn delete_worker_args(metadata: &DatasetMetadata) -> Vec<String> {
    vec![
        "dataset".to_owned(),
        "destroy".to_owned(),
        metadata.dataset_name.clone(),
        metadata.mount_point.clone(),
    ]
}

async fn delete_persistent_volume(ctx: &Context, pv_name: &str) -> Result<()> {
    let volumes = Api::<PersistentVolume>::all(ctx.client.clone());
    match volumes.delete(pv_name, &DeleteParams::default()).await {
        Ok(_) => {
            info!("Deleted PV {}", pv_name);
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!("PV {} already gone", pv_name);
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}
