use k8s_openapi::api::core::v1::{
    LocalVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{
    NODE_HOSTNAME_KEY, PROVISIONED_BY_ANNOTATION_KEY, RESULTS_ANNOTATION_KEY,
    SELECTED_NODE_ANNOTATION_KEY,
};
use crate::controller::worker_pod::DatasetAction;
use crate::controller::Context;
use crate::dataset_metadata::DatasetMetadata;
use crate::errors::{Error, Result};
use crate::ext::ProvisionerResourceExt;
use crate::results::{annotations_patch, CreatePvResult, DatasetWorkerResult, Results};
use crate::storage_class::CachedStorageClass;

/// Publishes the PersistentVolume for a claim whose create worker reached a
/// terminal phase. `Failed` workers park the claim for the operator.
pub async fn reconcile(
    claim: &PersistentVolumeClaim,
    storage_class: &CachedStorageClass,
    dataset_phase: &str,
    ctx: &Context,
) -> Result<Action> {
    if dataset_phase == "Failed" {
        return Err(Error::fatal(format!(
            "dataset creation for PVC {} failed; inspect the node and clear the {} annotation to retry",
            claim.full_name(),
            DatasetAction::Create.phase_annotation_key(),
        )));
    }

    let namespace = claim
        .namespace()
        .ok_or_else(|| Error::fatal(format!("PVC {} has no namespace", claim.name_any())))?;

    let mut results = Results::from_claim(claim)?;
    if results.create_pv.is_some() {
        debug!("PV for PVC {} already published", claim.full_name());
        return Ok(Action::await_change());
    }

    // The watcher can win the race and record the terminal phase before the
    // creating reconciler persisted its results (e.g. across a controller
    // restart). The names are deterministic, so recover them instead of
    // launching anything new.
    let create_results = match results.create_dataset.clone() {
        Some(create_results) => create_results,
        None => {
            let metadata = DatasetMetadata::from_claim(claim, storage_class, &ctx.config)?;
            let recovered = DatasetWorkerResult {
                pod_name: metadata.pod_name(DatasetAction::Create.as_str()),
                pv_name: metadata.pv_name.clone(),
                dataset_name: metadata.dataset_name.clone(),
                mount_point: metadata.mount_point.clone(),
                selected_node: claim
                    .annotation(SELECTED_NODE_ANNOTATION_KEY)
                    .map(String::from),
                phase: dataset_phase.to_owned(),
                ..Default::default()
            };
            results.create_dataset = Some(recovered.clone());
            recovered
        }
    };

    let volume = build_persistent_volume(claim, storage_class, &create_results, &ctx.config.provisioner_name)?;

    info!("Creating PV {} for PVC {}", create_results.pv_name, claim.full_name());
    let volumes = Api::<PersistentVolume>::all(ctx.client.clone());
    match volumes.create(&PostParams::default(), &volume).await {
        Ok(_) => {}
        Err(kube::Error::Api(response)) if response.code == 409 => {
            debug!("PV {} already exists", create_results.pv_name);
        }
        Err(error) => return Err(error.into()),
    }

    results.create_pv = Some(CreatePvResult {
        pv_name: create_results.pv_name.clone(),
        ..Default::default()
    });

    let claims = Api::<PersistentVolumeClaim>::namespaced(ctx.client.clone(), &namespace);
    let patch = annotations_patch([(RESULTS_ANNOTATION_KEY.to_owned(), results.encode()?)]);
    claims
        .patch(
            &claim.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

    ctx.publish_event(
        claim.object_ref(&()),
        Event {
            type_: EventType::Normal,
            reason: "VolumePublished".into(),
            note: Some(format!(
                "Created PersistentVolume {} backed by dataset {}",
                create_results.pv_name, create_results.dataset_name
            )),
            action: "Provision".into(),
            secondary: None,
        },
    )
    .await;

    Ok(Action::await_change())
}

/// Synthesizes the PV bound back to the claim. The capacity is forwarded
/// verbatim from the claim's storage request.
pub fn build_persistent_volume(
    claim: &PersistentVolumeClaim,
    storage_class: &CachedStorageClass,
    create_results: &DatasetWorkerResult,
    provisioner_name: &str,
) -> Result<PersistentVolume> {
    let spec = claim
        .spec
        .as_ref()
        .ok_or_else(|| Error::fatal(format!("PVC {} has no spec", claim.full_name())))?;

    let access_modes = spec.access_modes.clone().unwrap_or_default();
    let access_mode = match access_modes.as_slice() {
        [mode] => mode.clone(),
        [] => {
            return Err(Error::fatal(format!(
                "PVC {} requests no access mode",
                claim.full_name()
            )))
        }
        _ => {
            return Err(Error::fatal(format!(
                "PVC {} requests multiple access modes; exactly one is supported",
                claim.full_name()
            )))
        }
    };

    let storage_request = spec
        .resources
        .as_ref()
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .cloned()
        .ok_or_else(|| {
            Error::fatal(format!(
                "PVC {} has no storage request to size the PV from",
                claim.full_name()
            ))
        })?;

    let selected_node = create_results.selected_node.clone().ok_or_else(|| {
        Error::fatal(format!(
            "no selected node recorded for PVC {}, cannot pin the PV",
            claim.full_name()
        ))
    })?;

    Ok(PersistentVolume {
        metadata: ObjectMeta {
            name: Some(create_results.pv_name.clone()),
            annotations: Some(BTreeMap::from([(
                PROVISIONED_BY_ANNOTATION_KEY.to_owned(),
                provisioner_name.to_owned(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::<String, Quantity>::from([(
                "storage".to_owned(),
                storage_request,
            )])),
            access_modes: Some(vec![access_mode]),
            persistent_volume_reclaim_policy: Some(storage_class.reclaim_policy.as_str().into()),
            storage_class_name: Some(storage_class.name.clone()),
            volume_mode: spec.volume_mode.clone(),
            mount_options: (!storage_class.mount_options.is_empty())
                .then(|| storage_class.mount_options.clone()),
            local: Some(LocalVolumeSource {
                path: create_results.mount_point.clone(),
                ..LocalVolumeSource::default()
            }),
            claim_ref: Some(claim.object_ref(&())),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: NODE_HOSTNAME_KEY.into(),
                            operator: "In".into(),
                            values: Some(vec![selected_node]),
                        }]),
                        ..Default::default()
                    }],
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}
