use kube::ResourceExt;

use crate::config::FINALIZER_NAME;

pub trait ProvisionerResourceExt: ResourceExt {
    fn full_name(&self) -> String;

    /// Annotation value by key, if present.
    fn annotation(&self, key: &str) -> Option<&str>;

    /// Whether the resource carries the provisioner's finalizer.
    fn has_provisioner_finalizer(&self) -> bool;
}

impl<K: ResourceExt> ProvisionerResourceExt for K {
    fn full_name(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_else(|| "<>".into()),
            self.name_any()
        )
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()?
            .get(key)
            .map(String::as_str)
    }

    fn has_provisioner_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn full_name_includes_namespace() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("claim-a".into()),
                namespace: Some("app".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(claim.full_name(), "app/claim-a");
    }

    #[test]
    fn annotation_lookup() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(
                    "volume.kubernetes.io/selected-node".to_string(),
                    "node-7".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            claim.annotation("volume.kubernetes.io/selected-node"),
            Some("node-7")
        );
        assert_eq!(claim.annotation("missing"), None);
    }

    #[test]
    fn finalizer_detection() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                finalizers: Some(vec![FINALIZER_NAME.to_string()]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(claim.has_provisioner_finalizer());
        assert!(!PersistentVolumeClaim::default().has_provisioner_finalizer());
    }
}
