use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{FINALIZER_NAME, MODE_LOCAL, RESULTS_ANNOTATION_KEY, SELECTED_NODE_ANNOTATION_KEY};
use crate::controller::worker_pod::{build_worker_pod, launch_worker_pod, DatasetAction};
use crate::controller::Context;
use crate::dataset_metadata::DatasetMetadata;
use crate::errors::{Error, Result};
use crate::ext::ProvisionerResourceExt;
use crate::quantity_parser::QuantityParser;
use crate::results::{annotations_patch, DatasetWorkerResult, Results};
use crate::storage_class::{CachedStorageClass, VolumeBindingMode};

/// Schedules a worker pod that creates the ZFS dataset backing a pending
/// claim, then records the derived names and the worker's phase on the PVC
/// in a single patch.
pub async fn reconcile(
    claim: &PersistentVolumeClaim,
    storage_class: &CachedStorageClass,
    ctx: &Context,
) -> Result<Action> {
    let mode = storage_class.mode();
    if mode != MODE_LOCAL {
        return Err(Error::fatal(format!(
            "StorageClass {} requests unsupported mode '{}'",
            storage_class.name, mode
        )));
    }

    let selected_node = claim.annotation(SELECTED_NODE_ANNOTATION_KEY);
    if selected_node.is_none()
        && storage_class.volume_binding_mode == VolumeBindingMode::WaitForFirstConsumer
    {
        // Nothing to do until the scheduler picks a node for the first consumer.
        return Ok(Action::await_change());
    }
    let selected_node = selected_node.ok_or_else(|| {
        Error::fatal(format!(
            "PVC {} uses Immediate binding but has no {} annotation; \
             this provisioner cannot choose a node itself",
            claim.full_name(),
            SELECTED_NODE_ANNOTATION_KEY
        ))
    })?;

    let namespace = claim
        .namespace()
        .ok_or_else(|| Error::fatal(format!("PVC {} has no namespace", claim.name_any())))?;

    let metadata = DatasetMetadata::from_claim(claim, storage_class, &ctx.config)?;
    let pod_name = metadata.pod_name(DatasetAction::Create.as_str());
    let quota = storage_request_bytes(claim);
    let args = create_worker_args(&metadata, quota);

    info!(
        "Creating zfs dataset {} for PVC {} on node {}",
        metadata.dataset_name,
        claim.full_name(),
        selected_node
    );

    let pod = build_worker_pod(
        &ctx.config,
        claim,
        DatasetAction::Create,
        &pod_name,
        Some(selected_node),
        args,
    )?;
    let phase = launch_worker_pod(ctx.client.clone(), &namespace, &pod).await?;

    let mut results = Results::from_claim(claim)?;
    results.create_dataset = Some(DatasetWorkerResult {
        pv_name: metadata.pv_name.clone(),
        pod_name,
        dataset_name: metadata.dataset_name.clone(),
        mount_point: metadata.mount_point.clone(),
        selected_node: Some(selected_node.to_owned()),
        phase: phase.clone(),
        ..Default::default()
    });

    let mut patch = annotations_patch([
        (RESULTS_ANNOTATION_KEY.to_owned(), results.encode()?),
        (DatasetAction::Create.phase_annotation_key(), phase),
    ]);
    if !claim.has_provisioner_finalizer() {
        let mut finalizers = claim.finalizers().to_vec();
        finalizers.push(FINALIZER_NAME.to_owned());
        patch["metadata"]["finalizers"] = json!(finalizers);
    }

    let claims = Api::<PersistentVolumeClaim>::namespaced(ctx.client.clone(), &namespace);
    claims
        .patch(
            &claim.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

    // The pod watcher reports the terminal phase; the requeue is only a
    // level-trigger safety net against missed events.
    Ok(Action::requeue(Duration::from_secs(60)))
}

/// Storage request of the claim in bytes. A missing or malformed request is
/// logged and the dataset is created without a quota.
pub fn storage_request_bytes(claim: &PersistentVolumeClaim) -> Option<u64> {
    let quantity = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"));

    let Some(quantity) = quantity else {
        warn!(
            "PVC {} has no storage request, creating dataset without quota",
            claim.full_name()
        );
        return None;
    };

    match quantity.to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            warn!(
                "Failed to parse storage request '{}' of PVC {}, creating dataset without quota: {}",
                quantity.0,
                claim.full_name(),
                error
            );
            None
        }
    }
}

pub fn create_worker_args(metadata: &DatasetMetadata, quota: Option<u64>) -> Vec<String> {
    let mut args = vec!["dataset".to_owned(), "create".to_owned()];
    if let Some(bytes) = quota {
        args.push("--quota".to_owned());
        args.push(bytes.to_string());
    }
    args.push(metadata.dataset_name.clone());
    args.push(metadata.mount_point.clone());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn claim_requesting(storage: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("claim-a".into()),
                namespace: Some("app".into()),
                uid: Some("u1".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some("local-zfs".into()),
                resources: storage.map(|quantity| ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(quantity.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn worker_args_match_the_dataset_cli() {
        let metadata = DatasetMetadata::derive(
            "u1",
            "pool/data/local-zfs-provisioner",
            "/var/lib/local-zfs-provisioner",
        );
        assert_eq!(
            create_worker_args(&metadata, Some(2_147_483_648)),
            [
                "dataset",
                "create",
                "--quota",
                "2147483648",
                "pool/data/local-zfs-provisioner/pvc-u1",
                "/var/lib/local-zfs-provisioner/pvc-u1",
            ]
        );
    }

    #[test]
    fn quota_flag_is_omitted_without_a_request() {
        let metadata = DatasetMetadata::derive("u1", "pool", "/mnt");
        assert_eq!(
            create_worker_args(&metadata, None),
            ["dataset", "create", "pool/pvc-u1", "/mnt/pvc-u1"]
        );
    }

    #[test]
    fn storage_request_parses_binary_suffixes() {
        assert_eq!(
            storage_request_bytes(&claim_requesting(Some("2Gi"))),
            Some(2_147_483_648)
        );
    }

    #[test]
    fn missing_request_yields_no_quota() {
        assert_eq!(storage_request_bytes(&claim_requesting(None)), None);
    }

    #[test]
    fn malformed_request_yields_no_quota() {
        assert_eq!(storage_request_bytes(&claim_requesting(Some("garbage"))), None);
    }
}
