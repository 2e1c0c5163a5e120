use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::warn;

use crate::config::{MODE_LOCAL, MODE_PARAMETER, PARENT_DATASET_PARAMETER};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimPolicy {
    Delete,
    Retain,
}

impl ReclaimPolicy {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("Retain") => ReclaimPolicy::Retain,
            Some("Delete") | None => ReclaimPolicy::Delete,
            Some(other) => {
                warn!("unknown reclaimPolicy '{}', assuming Delete", other);
                ReclaimPolicy::Delete
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Delete => "Delete",
            ReclaimPolicy::Retain => "Retain",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeBindingMode {
    Immediate,
    WaitForFirstConsumer,
}

impl VolumeBindingMode {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("WaitForFirstConsumer") => VolumeBindingMode::WaitForFirstConsumer,
            Some("Immediate") | None => VolumeBindingMode::Immediate,
            Some(other) => {
                warn!("unknown volumeBindingMode '{}', assuming Immediate", other);
                VolumeBindingMode::Immediate
            }
        }
    }
}

/// The subset of a StorageClass the reconcilers need, decoded once when the
/// class enters the cache.
#[derive(Clone, Debug)]
pub struct CachedStorageClass {
    pub name: String,
    pub reclaim_policy: ReclaimPolicy,
    pub volume_binding_mode: VolumeBindingMode,
    pub allow_volume_expansion: bool,
    pub parameters: BTreeMap<String, String>,
    pub mount_options: Vec<String>,
}

impl CachedStorageClass {
    /// Dataset mode requested by the class. Only `local` is implemented;
    /// anything else must fail the create reconciler.
    pub fn mode(&self) -> &str {
        self.parameters
            .get(MODE_PARAMETER)
            .map(String::as_str)
            .unwrap_or(MODE_LOCAL)
    }

    /// Parent dataset override, falling back to the configured default.
    pub fn parent_dataset<'a>(&'a self, default: &'a str) -> &'a str {
        self.parameters
            .get(PARENT_DATASET_PARAMETER)
            .map(String::as_str)
            .unwrap_or(default)
    }
}

impl From<&StorageClass> for CachedStorageClass {
    fn from(storage_class: &StorageClass) -> Self {
        CachedStorageClass {
            name: storage_class.name_any(),
            reclaim_policy: ReclaimPolicy::parse(storage_class.reclaim_policy.as_deref()),
            volume_binding_mode: VolumeBindingMode::parse(
                storage_class.volume_binding_mode.as_deref(),
            ),
            allow_volume_expansion: storage_class.allow_volume_expansion.unwrap_or(false),
            parameters: storage_class.parameters.clone().unwrap_or_default(),
            mount_options: storage_class.mount_options.clone().unwrap_or_default(),
        }
    }
}

/// In-memory registry of the StorageClasses this controller is responsible
/// for. Reads take a snapshot under a short-lived lock; the lock is never
/// held across await points.
#[derive(Clone, Default)]
pub struct StorageClassCache {
    inner: Arc<RwLock<HashMap<String, Arc<CachedStorageClass>>>>,
}

impl StorageClassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a class. Returns true when the entry is new, which
    /// is the signal used to re-queue PVCs waiting on the class.
    pub fn insert(&self, storage_class: &StorageClass) -> bool {
        let entry = Arc::new(CachedStorageClass::from(storage_class));
        let mut classes = self.inner.write().unwrap();
        classes.insert(entry.name.clone(), entry).is_none()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CachedStorageClass>> {
        self.inner.read().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn storage_class(name: &str) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "asteven/zfs-provisioner".into(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_apply() {
        let cached = CachedStorageClass::from(&storage_class("local-zfs"));
        assert_eq!(cached.name, "local-zfs");
        assert_eq!(cached.reclaim_policy, ReclaimPolicy::Delete);
        assert_eq!(cached.volume_binding_mode, VolumeBindingMode::Immediate);
        assert!(!cached.allow_volume_expansion);
        assert_eq!(cached.mode(), "local");
        assert_eq!(cached.parent_dataset("pool/default"), "pool/default");
    }

    #[test]
    fn explicit_fields_decode() {
        let mut sc = storage_class("local-zfs");
        sc.reclaim_policy = Some("Retain".into());
        sc.volume_binding_mode = Some("WaitForFirstConsumer".into());
        sc.allow_volume_expansion = Some(true);
        sc.parameters = Some(BTreeMap::from([
            ("mode".to_string(), "nfs".to_string()),
            ("parentDataset".to_string(), "tank/volumes".to_string()),
        ]));

        let cached = CachedStorageClass::from(&sc);
        assert_eq!(cached.reclaim_policy, ReclaimPolicy::Retain);
        assert_eq!(
            cached.volume_binding_mode,
            VolumeBindingMode::WaitForFirstConsumer
        );
        assert!(cached.allow_volume_expansion);
        assert_eq!(cached.mode(), "nfs");
        assert_eq!(cached.parent_dataset("pool/default"), "tank/volumes");
    }

    #[test]
    fn insert_reports_new_entries_only() {
        let cache = StorageClassCache::new();
        assert!(cache.insert(&storage_class("local-zfs")));
        assert!(!cache.insert(&storage_class("local-zfs")));
        assert!(cache.get("local-zfs").is_some());
        assert!(cache.get("other").is_none());
    }
}
