use clap::Args;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const RESULTS_ANNOTATION_KEY: &str = "zfs-provisioner/results";
pub const ACTION_LABEL_KEY: &str = "zfs-provisioner/action";
pub const FINALIZER_NAME: &str = "zfs-provisioner/finalizer";
pub const SELECTED_NODE_ANNOTATION_KEY: &str = "volume.kubernetes.io/selected-node";
pub const PROVISIONED_BY_ANNOTATION_KEY: &str = "pv.kubernetes.io/provisioned-by";
pub const NODE_HOSTNAME_KEY: &str = "kubernetes.io/hostname";
pub const HOST_FS_ENV_NAME: &str = "HOST_FS";

// StorageClass parameter keys
pub const MODE_PARAMETER: &str = "mode";
pub const PARENT_DATASET_PARAMETER: &str = "parentDataset";
pub const MODE_LOCAL: &str = "local";

/// Process-wide configuration. Every knob can also be set through the
/// environment so the controller Deployment and the worker pods share one
/// image.
#[derive(Args, Clone, Debug)]
pub struct Config {
    /// Provisioner name matched against StorageClass .provisioner
    #[arg(
        long,
        env = "ZFS_PROVISIONER_NAME",
        default_value = "asteven/zfs-provisioner"
    )]
    pub provisioner_name: String,

    /// Default namespace for worker pods
    #[arg(long, env = "ZFS_PROVISIONER_NAMESPACE", default_value = "kube-system")]
    pub namespace: String,

    /// Parent dataset under which per-PVC datasets are created
    #[arg(
        long,
        env = "ZFS_PROVISIONER_PARENT_DATASET",
        default_value = "pool/data/local-zfs-provisioner"
    )]
    pub default_parent_dataset: String,

    /// Directory under which per-PVC datasets are mounted on the nodes
    #[arg(
        long,
        env = "ZFS_PROVISIONER_DATASET_MOUNT_DIR",
        default_value = "/var/lib/local-zfs-provisioner"
    )]
    pub dataset_mount_dir: String,

    /// Image used for worker pods
    #[arg(
        long,
        env = "ZFS_PROVISIONER_IMAGE",
        default_value = "asteven/zfs-provisioner"
    )]
    pub container_image: String,

    /// Service account assigned to worker pods, if any
    #[arg(long, env = "ZFS_PROVISIONER_SERVICE_ACCOUNT")]
    pub service_account: Option<String>,

    /// activeDeadlineSeconds applied to worker pods, if any
    #[arg(long, env = "ZFS_PROVISIONER_WORKER_DEADLINE_SECONDS")]
    pub worker_deadline_seconds: Option<i64>,

    /// Upper bound on concurrently reconciling PVCs
    #[arg(long, env = "ZFS_PROVISIONER_WORKERS", default_value_t = 4)]
    pub workers: u16,

    /// Deadline for a single reconcile pass, in seconds
    #[arg(long, env = "ZFS_PROVISIONER_RECONCILE_TIMEOUT", default_value_t = 60)]
    pub reconcile_timeout_seconds: u64,
}
