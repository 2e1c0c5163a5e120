use build_time::build_time_local;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::controller::Controller;
use crate::dataset::DatasetManager;

pub mod config;
pub mod controller;
pub mod dataset;
pub mod dataset_metadata;
pub mod errors;
pub mod ext;
pub mod quantity_parser;
pub mod results;
pub mod storage_class;
pub mod zfs_wrapper;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set log level to info
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Set log level to debug
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(flatten)]
    config: config::Config,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Manage ZFS datasets, run from inside a worker pod
    Dataset {
        #[command(subcommand)]
        command: DatasetCommand,
    },
}

#[derive(Subcommand)]
enum DatasetCommand {
    /// Create a dataset, apply its quota and ensure it is mounted
    Create {
        /// Quota in bytes applied to the dataset
        #[arg(long)]
        quota: Option<u64>,

        dataset: String,
        mount_point: String,
    },
    /// Unmount a dataset and destroy it recursively
    Destroy {
        dataset: String,
        mount_point: String,
    },
}

/// `--verbose` and `--debug` pick the default level;
/// `ZFS_PROVISIONER_LOG_LEVEL` overrides both.
fn init_logging(verbose: bool, debug: bool) {
    let default_directive = if debug {
        "zfs_provisioner=debug"
    } else if verbose {
        "zfs_provisioner=info"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_env("ZFS_PROVISIONER_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debug);

    info!(
        "Running zfs-provisioner v{} built at {}",
        config::VERSION,
        build_time_local!()
    );

    match cli.command {
        Some(Command::Dataset { command }) => {
            let manager = DatasetManager::new();
            match command {
                DatasetCommand::Create {
                    quota,
                    dataset,
                    mount_point,
                } => manager.create(&dataset, &mount_point, quota),
                DatasetCommand::Destroy {
                    dataset,
                    mount_point,
                } => manager.destroy(&dataset, &mount_point),
            }
        }
        None => Controller::create(cli.config).await?.run().await,
    }
}
