use std::io::{stderr, stdout, Write};
use std::process::{Command, Output};

use color_eyre::eyre::bail;
use color_eyre::Result;
use tracing::debug;

use crate::config::HOST_FS_ENV_NAME;

pub struct ZfsWrapper {
    chroot_to_host: bool,
}

impl Default for ZfsWrapper {
    fn default() -> Self {
        ZfsWrapper {
            chroot_to_host: true,
        }
    }
}

impl ZfsWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, dataset: &str, mount_point: &str, quota: Option<u64>) -> Result<Output> {
        let mountpoint_property = format!("mountpoint={}", mount_point);
        let quota_property = quota.map(|bytes| format!("quota={}", bytes));

        let mut args = vec!["create", "-o", mountpoint_property.as_str()];
        if let Some(quota_property) = &quota_property {
            args.push("-o");
            args.push(quota_property);
        }
        args.push(dataset);

        self.run_command("zfs", &args)
    }

    pub fn destroy(&self, dataset: &str) -> Result<Output> {
        self.run_command("zfs", &["destroy", "-r", dataset])
    }

    pub fn set_property(&self, dataset: &str, property: &str, value: &str) -> Result<Output> {
        let assignment = format!("{}={}", property, value);
        self.run_command("zfs", &["set", assignment.as_str(), dataset])
    }

    pub fn mount(&self, dataset: &str) -> Result<Output> {
        self.run_command("zfs", &["mount", dataset])
    }

    pub fn unmount(&self, dataset: &str) -> Result<Output> {
        self.run_command("zfs", &["unmount", dataset])
    }

    pub fn exists(&self, dataset: &str) -> bool {
        self.try_run_command("zfs", &["list", "-H", "-o", "name", dataset])
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Value of a single property, as `zfs get -H -o value` reports it.
    pub fn get_property(&self, dataset: &str, property: &str) -> Result<String> {
        let output = self.run_command("zfs", &["get", "-H", "-o", "value", property, dataset])?;
        Ok(String::from_utf8(output.stdout)?.trim().to_owned())
    }

    pub fn is_mounted(&self, dataset: &str) -> Result<bool> {
        Ok(self.get_property(dataset, "mounted")? == "yes")
    }

    /// Runs a command and fails on a nonzero exit status.
    fn run_command(&self, command: &str, args: &[&str]) -> Result<Output> {
        let output = self.try_run_command(command, args)?;

        if !output.status.success() {
            bail!("`{} {}` failed: {}", command, args.join(" "), output.status);
        }

        Ok(output)
    }

    /// Runs a command after eventually `chroot`ing into the host filesystem
    fn try_run_command(&self, command: &str, args: &[&str]) -> Result<Output> {
        fn run_prepared_command(command: &mut Command) -> Result<Output> {
            debug!("Running: {:?}", command);

            let output = command.output()?;

            stdout().write_all(&output.stdout)?;
            stderr().write_all(&output.stderr)?;

            Ok(output)
        }

        if self.chroot_to_host {
            if let Ok(path) = std::env::var(HOST_FS_ENV_NAME) {
                return run_prepared_command(
                    Command::new("chroot")
                        .args(vec![path.as_str(), command])
                        .args(args),
                );
            }
        }

        run_prepared_command(Command::new(command).args(args))
    }
}
