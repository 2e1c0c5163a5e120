use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::ext::ProvisionerResourceExt;
use crate::storage_class::CachedStorageClass;

/// Represents a ZFS dataset from the provisioner's perspective. The dataset
/// doesn't necessarily need to exist yet.
///
/// All names are pure functions of the PVC UID and cluster-wide
/// configuration, so retries and controller restarts always arrive at the
/// same dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetMetadata {
    pub pv_name: String,
    pub dataset_name: String,
    pub mount_point: String,
}

impl DatasetMetadata {
    pub fn derive(claim_uid: &str, parent_dataset: &str, mount_dir: &str) -> DatasetMetadata {
        let pv_name = format!("pvc-{}", claim_uid);
        DatasetMetadata {
            dataset_name: format!("{}/{}", parent_dataset, pv_name),
            mount_point: format!("{}/{}", mount_dir.trim_end_matches('/'), pv_name),
            pv_name,
        }
    }

    /// Return a DatasetMetadata derived from a PVC, honoring the class'
    /// `parentDataset` override.
    pub fn from_claim(
        claim: &PersistentVolumeClaim,
        storage_class: &CachedStorageClass,
        config: &Config,
    ) -> Result<DatasetMetadata> {
        let uid = claim
            .uid()
            .ok_or_else(|| Error::fatal(format!("PVC {} has no UID", claim.full_name())))?;
        Ok(DatasetMetadata::derive(
            &uid,
            storage_class.parent_dataset(&config.default_parent_dataset),
            &config.dataset_mount_dir,
        ))
    }

    /// Name of the worker pod for one of the dataset actions.
    pub fn pod_name(&self, action: &str) -> String {
        format!("{}-{}", self.pv_name, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic() {
        let a = DatasetMetadata::derive(
            "u1",
            "pool/data/local-zfs-provisioner",
            "/var/lib/local-zfs-provisioner",
        );
        let b = DatasetMetadata::derive(
            "u1",
            "pool/data/local-zfs-provisioner",
            "/var/lib/local-zfs-provisioner",
        );
        assert_eq!(a, b);
        assert_eq!(a.pv_name, "pvc-u1");
        assert_eq!(a.dataset_name, "pool/data/local-zfs-provisioner/pvc-u1");
        assert_eq!(a.mount_point, "/var/lib/local-zfs-provisioner/pvc-u1");
    }

    #[test]
    fn pod_names_carry_the_action() {
        let metadata = DatasetMetadata::derive("u1", "pool", "/mnt");
        assert_eq!(metadata.pod_name("create"), "pvc-u1-create");
        assert_eq!(metadata.pod_name("delete"), "pvc-u1-delete");
    }

    #[test]
    fn trailing_slash_on_mount_dir_is_tolerated() {
        let metadata = DatasetMetadata::derive("u1", "pool", "/mnt/");
        assert_eq!(metadata.mount_point, "/mnt/pvc-u1");
    }
}
