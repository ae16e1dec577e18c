use clap::Arg;
use csi_resize::{
    node::{mount::MOUNT_TABLE, HostFilesystem, NodeResizer},
    store::k8s::KubeStore,
};
use kube::Client;
use std::sync::Arc;
use tracing::{debug, error, info};

mod config;
use config::NodeConfig;

/// Grow the filesystems of the claims attached to this node, until asked to stop.
async fn node_agent(config: NodeConfig) -> anyhow::Result<()> {
    let k8s = Client::try_default().await?;
    let resizer = NodeResizer::new(
        Arc::new(KubeStore::new(k8s)),
        Arc::new(HostFilesystem::new(config.mount_table())),
    );

    info!(
        node = config.node_name(),
        interval = ?config.interval(),
        "Starting CSI volume resize node agent"
    );

    let mut interval = tokio::time::interval(config.interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match resizer.reconcile_node(config.node_name()).await {
                    Ok(0) => debug!("No pending filesystem resize"),
                    Ok(resized) => info!(resized, "Filesystems resized"),
                    Err(error) => error!(%error, "Failed to reconcile node claims"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = clap::Command::new(utils::package_description!())
        .version(utils::version_info_str!())
        .arg(
            Arg::new("node-name")
                .long("node-name")
                .short('n')
                .env("NODE_NAME")
                .required(true)
                .help("the name of the node this agent runs on"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .env("INTERVAL")
                .default_value(utils::RESIZE_POLL_INTERVAL)
                .help("specify timer based reconciliation loop"),
        )
        .arg(
            Arg::new("mount-table")
                .long("mount-table")
                .env("MOUNT_TABLE")
                .default_value(MOUNT_TABLE)
                .help("the mount table used to find mounted volumes"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .env("LOG_FORMAT")
                .value_parser(["pretty", "compact", "json"])
                .default_value("pretty")
                .help("formatting style of the logs"),
        )
        .get_matches();

    utils::print_package_info!();

    let config = NodeConfig::from_args(&args)?;
    utils::tracing_telemetry::init_tracing("csi-resize-node", config.log_format());

    node_agent(config).await
}
