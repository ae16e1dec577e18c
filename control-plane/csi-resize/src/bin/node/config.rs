use anyhow::Context;
use clap::ArgMatches;
use std::{str::FromStr, time::Duration};
use utils::tracing_telemetry::FmtStyle;

/// Configuration of the node agent, parsed from the command line.
#[derive(Debug)]
pub(crate) struct NodeConfig {
    /// Name of the node this agent runs on.
    node_name: String,
    /// Period of the resize passes.
    interval: Duration,
    /// Mount table to look up mounted volumes.
    mount_table: String,
    log_format: FmtStyle,
}

impl NodeConfig {
    /// Parse the configuration from the command line arguments.
    pub(crate) fn from_args(args: &ArgMatches) -> anyhow::Result<Self> {
        let node_name = args
            .get_one::<String>("node-name")
            .cloned()
            .context("node name must be specified")?;
        let interval = args
            .get_one::<String>("interval")
            .context("interval must be specified")?
            .parse::<humantime::Duration>()
            .context("interval value is invalid")?;
        let mount_table = args
            .get_one::<String>("mount-table")
            .cloned()
            .context("mount table must be specified")?;
        let log_format = args
            .get_one::<String>("log-format")
            .context("log format must be specified")?;
        Ok(Self {
            node_name,
            interval: interval.into(),
            mount_table,
            log_format: FmtStyle::from_str(log_format)
                .map_err(|_| anyhow::anyhow!("log format '{log_format}' is invalid"))?,
        })
    }

    /// Get the node name.
    pub(crate) fn node_name(&self) -> &str {
        &self.node_name
    }
    /// Get the resize pass period.
    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }
    /// Get the mount table path.
    pub(crate) fn mount_table(&self) -> &str {
        &self.mount_table
    }
    /// Get the log format.
    pub(crate) fn log_format(&self) -> FmtStyle {
        self.log_format
    }
}
