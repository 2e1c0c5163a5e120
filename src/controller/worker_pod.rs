use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, PersistentVolumeClaim, Pod, PodSpec, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client, Resource};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{Config, ACTION_LABEL_KEY, HOST_FS_ENV_NAME};
use crate::errors::{Error, Result};
use crate::ext::ProvisionerResourceExt;

/// The two dataset actions executed through worker pods. `resize` is part of
/// the annotation family but has no reconciler yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetAction {
    Create,
    Delete,
}

impl DatasetAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetAction::Create => "create",
            DatasetAction::Delete => "delete",
        }
    }

    pub fn from_label(value: &str) -> Option<DatasetAction> {
        match value {
            "create" => Some(DatasetAction::Create),
            "delete" => Some(DatasetAction::Delete),
            _ => None,
        }
    }

    /// Annotation key holding the last observed worker-pod phase for this
    /// action, e.g. `zfs-provisioner/dataset-phase-create`.
    pub fn phase_annotation_key(&self) -> String {
        format!("zfs-provisioner/dataset-phase-{}", self.as_str())
    }
}

pub fn is_terminal_phase(phase: &str) -> bool {
    matches!(phase, "Succeeded" | "Failed")
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Builds the worker Pod that runs the in-container dataset CLI on the
/// target node. The pod is named deterministically by its caller so retried
/// reconciles collide on `AlreadyExists` instead of spawning twins.
pub fn build_worker_pod(
    config: &Config,
    claim: &PersistentVolumeClaim,
    action: DatasetAction,
    pod_name: &str,
    node_name: Option<&str>,
    args: Vec<String>,
) -> Result<Pod> {
    let owner_reference = claim.controller_owner_ref(&()).ok_or_else(|| {
        Error::fatal(format!(
            "PVC {} has no name or UID to build an owner reference from",
            claim.full_name()
        ))
    })?;

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_owned()),
            labels: Some(BTreeMap::from([(
                ACTION_LABEL_KEY.to_owned(),
                action.as_str().to_owned(),
            )])),
            owner_references: Some(vec![owner_reference]),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".into()),
            node_name: node_name.map(String::from),
            service_account_name: config.service_account.clone(),
            active_deadline_seconds: config.worker_deadline_seconds,
            containers: vec![Container {
                name: "zfs".into(),
                image: Some(config.container_image.clone()),
                image_pull_policy: Some("IfNotPresent".into()),
                args: Some(args),
                env: Some(vec![EnvVar {
                    name: HOST_FS_ENV_NAME.into(),
                    value: Some("/host".into()),
                    ..EnvVar::default()
                }]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..SecurityContext::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "host".into(),
                    mount_path: "/host".into(),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            volumes: Some(vec![Volume {
                name: "host".into(),
                host_path: Some(HostPathVolumeSource {
                    path: "/".into(),
                    ..HostPathVolumeSource::default()
                }),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    })
}

/// Submits a worker pod and returns its phase. `AlreadyExists` is success:
/// a previous reconcile got here first and the existing pod is authoritative.
pub async fn launch_worker_pod(client: Client, namespace: &str, pod: &Pod) -> Result<String> {
    let pods = Api::<Pod>::namespaced(client, namespace);
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();

    match pods.create(&PostParams::default(), pod).await {
        Ok(created) => Ok(created
            .status
            .and_then(|status| status.phase)
            .unwrap_or_else(|| "Pending".into())),
        Err(kube::Error::Api(response)) if response.code == 409 => {
            debug!("Worker pod {} already exists, adopting it", pod_name);
            let existing = pods.get(pod_name).await?;
            Ok(pod_phase(&existing).unwrap_or("Pending").to_owned())
        }
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_config() -> Config {
        Config {
            provisioner_name: "asteven/zfs-provisioner".into(),
            namespace: "kube-system".into(),
            default_parent_dataset: "pool/data/local-zfs-provisioner".into(),
            dataset_mount_dir: "/var/lib/local-zfs-provisioner".into(),
            container_image: "asteven/zfs-provisioner".into(),
            service_account: None,
            worker_deadline_seconds: Some(600),
            workers: 4,
            reconcile_timeout_seconds: 60,
        }
    }

    fn test_claim() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("claim-a".into()),
                namespace: Some("app".into()),
                uid: Some("u1".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn phase_annotation_keys() {
        assert_eq!(
            DatasetAction::Create.phase_annotation_key(),
            "zfs-provisioner/dataset-phase-create"
        );
        assert_eq!(
            DatasetAction::Delete.phase_annotation_key(),
            "zfs-provisioner/dataset-phase-delete"
        );
    }

    #[test]
    fn terminal_phases() {
        assert!(is_terminal_phase("Succeeded"));
        assert!(is_terminal_phase("Failed"));
        assert!(!is_terminal_phase("Pending"));
        assert!(!is_terminal_phase("Running"));
        assert!(!is_terminal_phase("Unknown"));
    }

    #[test]
    fn worker_pod_has_exactly_one_pvc_owner() {
        let pod = build_worker_pod(
            &test_config(),
            &test_claim(),
            DatasetAction::Create,
            "pvc-u1-create",
            Some("node-7"),
            vec!["dataset".into(), "create".into()],
        )
        .unwrap();

        let owners = pod.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "PersistentVolumeClaim");
        assert_eq!(owners[0].name, "claim-a");
        assert_eq!(owners[0].uid, "u1");
    }

    #[test]
    fn worker_pod_is_labeled_and_pinned() {
        let pod = build_worker_pod(
            &test_config(),
            &test_claim(),
            DatasetAction::Delete,
            "pvc-u1-delete",
            Some("node-7"),
            vec![
                "dataset".into(),
                "destroy".into(),
                "pool/data/local-zfs-provisioner/pvc-u1".into(),
                "/var/lib/local-zfs-provisioner/pvc-u1".into(),
            ],
        )
        .unwrap();

        assert_eq!(
            pod.metadata.labels.unwrap().get(ACTION_LABEL_KEY),
            Some(&"delete".to_string())
        );

        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node-7"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.active_deadline_seconds, Some(600));

        let container = &spec.containers[0];
        assert_eq!(
            container.args.as_ref().unwrap()[..2],
            ["dataset".to_string(), "destroy".to_string()]
        );
        assert_eq!(container.security_context.as_ref().unwrap().privileged, Some(true));
    }

    #[test]
    fn claim_without_uid_is_rejected() {
        let mut claim = test_claim();
        claim.metadata.uid = None;
        let result = build_worker_pod(
            &test_config(),
            &claim,
            DatasetAction::Create,
            "pvc-u1-create",
            None,
            vec![],
        );
        assert!(matches!(result, Err(Error::Fatal(_))));
    }
}
