use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::RESULTS_ANNOTATION_KEY;
use crate::errors::Result;
use crate::ext::ProvisionerResourceExt;

/// Outcome of a dataset worker launch, recorded under the launching
/// reconciler's key so later phases and controller restarts can recover the
/// derived names without recomputing them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetWorkerResult {
    pub pv_name: String,
    pub pod_name: String,
    pub dataset_name: String,
    pub mount_point: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_node: Option<String>,
    pub phase: String,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatePvResult {
    pub pv_name: String,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

/// The `zfs-provisioner/results` annotation. Each reconciler owns one key and
/// never rewrites another reconciler's entry; unknown keys are carried along
/// untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Results {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_dataset: Option<DatasetWorkerResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_pv: Option<CreatePvResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_dataset: Option<DatasetWorkerResult>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl Results {
    /// Decode the results annotation of a PVC, an empty mapping if absent.
    pub fn from_claim(claim: &PersistentVolumeClaim) -> Result<Results> {
        match claim.annotation(RESULTS_ANNOTATION_KEY) {
            Some(encoded) => Ok(serde_json::from_str(encoded)?),
            None => Ok(Results::default()),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Merge patch updating `metadata.annotations` and nothing else. Server-side
/// merge semantics leave annotations owned by other parties alone.
pub fn annotations_patch<I, K, V>(annotations: I) -> Value
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let annotations: BTreeMap<String, String> = annotations
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    json!({ "metadata": { "annotations": annotations } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn claim_with_results(encoded: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(
                    RESULTS_ANNOTATION_KEY.to_string(),
                    encoded.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn absent_annotation_decodes_to_empty() {
        let results = Results::from_claim(&PersistentVolumeClaim::default()).unwrap();
        assert_eq!(results, Results::default());
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let encoded = r#"{"create_dataset":{"pv_name":"pvc-u1","pod_name":"pvc-u1-create","dataset_name":"pool/pvc-u1","mount_point":"/var/lib/local-zfs-provisioner/pvc-u1","selected_node":"node-7","phase":"Pending","extra":1},"resize_dataset":{"phase":"Pending"}}"#;
        let results = Results::from_claim(&claim_with_results(encoded)).unwrap();

        let create = results.create_dataset.as_ref().unwrap();
        assert_eq!(create.pv_name, "pvc-u1");
        assert_eq!(create.unknown.get("extra"), Some(&json!(1)));
        assert!(results.unknown.contains_key("resize_dataset"));

        let reencoded = results.encode().unwrap();
        let reparsed: Results = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(reparsed, results);
    }

    #[test]
    fn earlier_entries_are_preserved_when_a_later_phase_writes() {
        let mut results = Results {
            create_dataset: Some(DatasetWorkerResult {
                pv_name: "pvc-u1".into(),
                pod_name: "pvc-u1-create".into(),
                dataset_name: "pool/pvc-u1".into(),
                mount_point: "/mnt/pvc-u1".into(),
                selected_node: Some("node-1".into()),
                phase: "Succeeded".into(),
                ..Default::default()
            }),
            ..Default::default()
        };

        results.create_pv = Some(CreatePvResult {
            pv_name: "pvc-u1".into(),
            ..Default::default()
        });

        let encoded = results.encode().unwrap();
        let reparsed: Results = serde_json::from_str(&encoded).unwrap();
        assert_eq!(reparsed.create_dataset.unwrap().pv_name, "pvc-u1");
        assert_eq!(reparsed.create_pv.unwrap().pv_name, "pvc-u1");
    }

    #[test]
    fn malformed_annotation_is_an_error() {
        assert!(Results::from_claim(&claim_with_results("not-json")).is_err());
    }

    #[test]
    fn annotations_patch_shape() {
        let patch = annotations_patch([("zfs-provisioner/dataset-phase-create", "Succeeded")]);
        assert_eq!(
            patch,
            json!({"metadata": {"annotations": {"zfs-provisioner/dataset-phase-create": "Succeeded"}}})
        );
    }
}
