use std::path::{Path, PathBuf};

use color_eyre::eyre::bail;
use color_eyre::Result;
use tracing::{info, warn};

use crate::config::HOST_FS_ENV_NAME;
use crate::zfs_wrapper::ZfsWrapper;

/// Implements the CLI the worker pods run. The controller only ever invokes
/// these two operations; both are safe to replay after a partial failure.
pub struct DatasetManager {
    zfs: ZfsWrapper,
}

impl DatasetManager {
    pub fn new() -> Self {
        DatasetManager {
            zfs: ZfsWrapper::new(),
        }
    }

    /// Creates the dataset with the given quota, sets its mountpoint and
    /// ensures it is mounted. Exits cleanly when the dataset already exists:
    /// quota and mountpoint are re-asserted instead.
    pub fn create(&self, dataset: &str, mount_point: &str, quota: Option<u64>) -> Result<()> {
        if self.zfs.exists(dataset) {
            info!("Dataset {} already exists", dataset);

            let current_mount_point = self.zfs.get_property(dataset, "mountpoint")?;
            if current_mount_point != mount_point {
                bail!(
                    "dataset {} is mounted at {}, expected {}",
                    dataset,
                    current_mount_point,
                    mount_point
                );
            }

            if let Some(bytes) = quota {
                let current_quota = self.zfs.get_property(dataset, "quota")?;
                if current_quota != bytes.to_string() {
                    info!("Re-asserting quota of {} bytes on {}", bytes, dataset);
                    self.zfs
                        .set_property(dataset, "quota", &bytes.to_string())?;
                }
            }
        } else {
            let mount_parent = Path::new(mount_point).parent();
            if let Some(parent) = mount_parent {
                let host_parent = host_path(parent);
                info!("Ensuring mount directory {} exists", host_parent.display());
                let _ = mkdirp::mkdirp(&host_parent)?;
            }

            info!("Creating dataset {} mounted at {}", dataset, mount_point);
            self.zfs.create(dataset, mount_point, quota)?;
        }

        if !self.zfs.is_mounted(dataset)? {
            info!("Mounting dataset {}", dataset);
            self.zfs.mount(dataset)?;
        }

        Ok(())
    }

    /// Unmounts the dataset if mounted and destroys it recursively. Exits
    /// cleanly when it is already gone.
    pub fn destroy(&self, dataset: &str, mount_point: &str) -> Result<()> {
        if !self.zfs.exists(dataset) {
            warn!("Dataset {} does not exist, nothing to destroy", dataset);
            return Ok(());
        }

        if self.zfs.is_mounted(dataset)? {
            info!("Unmounting dataset {} from {}", dataset, mount_point);
            self.zfs.unmount(dataset)?;
        }

        info!("Destroying dataset {}", dataset);
        self.zfs.destroy(dataset)?;

        Ok(())
    }
}

impl Default for DatasetManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the path to an absolute node path as seen from inside the worker
/// pod, honoring the `HOST_FS` chroot prefix.
pub fn host_path(path: &Path) -> PathBuf {
    let mut path_buf = PathBuf::new();

    if let Ok(prefix) = std::env::var(HOST_FS_ENV_NAME) {
        path_buf.push(prefix);
        path_buf.push(
            path.to_string_lossy()
                .trim_start_matches('/')
                .to_string(),
        );
    } else {
        path_buf.push(path);
    }

    path_buf
}
