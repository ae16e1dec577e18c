use anyhow::Context;
use clap::ArgMatches;
use csi_resize::config::{ResizeConfig, TerminalFailurePolicy};
use std::{str::FromStr, time::Duration};
use strum_macros::{AsRefStr, EnumString};
use utils::tracing_telemetry::FmtStyle;

/// Where the backing volumes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum BackendKind {
    /// A CNS REST gateway.
    Cns,
    /// Claims of the supervisor cluster, for guest clusters.
    Supervisor,
}

/// Configuration of the resize controller, parsed from the command line.
#[derive(Debug)]
pub(crate) struct ControllerConfig {
    backend: BackendKind,
    /// CNS REST endpoint URL.
    cns_endpoint: String,
    /// Supervisor namespace holding the guest volumes.
    supervisor_namespace: Option<String>,
    /// Kubeconfig of the supervisor cluster.
    supervisor_kubeconfig: Option<String>,
    /// Timeout for remote requests.
    request_timeout: Duration,
    log_format: FmtStyle,
    resize: ResizeConfig,
}

fn duration(args: &ArgMatches, name: &str) -> anyhow::Result<Duration> {
    let value = args
        .get_one::<String>(name)
        .with_context(|| format!("{name} must be specified"))?;
    Ok(value
        .parse::<humantime::Duration>()
        .with_context(|| format!("{name} value '{value}' is invalid"))?
        .into())
}

fn parse<T: FromStr>(args: &ArgMatches, name: &str) -> anyhow::Result<T> {
    let value = args
        .get_one::<String>(name)
        .with_context(|| format!("{name} must be specified"))?;
    T::from_str(value).map_err(|_| anyhow::anyhow!("{name} value '{value}' is invalid"))
}

impl ControllerConfig {
    /// Parse the configuration from the command line arguments.
    pub(crate) fn from_args(args: &ArgMatches) -> anyhow::Result<Self> {
        let backend = parse::<BackendKind>(args, "backend")?;
        let supervisor_namespace = args.get_one::<String>("supervisor-namespace").cloned();
        if backend == BackendKind::Supervisor && supervisor_namespace.is_none() {
            anyhow::bail!("the supervisor backend requires a supervisor namespace");
        }

        let resize = ResizeConfig::new()
            .with_online_expansion(
                args.get_one::<bool>("online-expansion")
                    .copied()
                    .unwrap_or(true),
            )
            .with_retry_interval(duration(args, "retry-interval")?)
            .with_terminal_retry_interval(duration(args, "terminal-retry-interval")?)
            .with_failure_policy(parse::<TerminalFailurePolicy>(args, "failure-policy")?);

        Ok(Self {
            backend,
            cns_endpoint: args
                .get_one::<String>("cns-endpoint")
                .cloned()
                .context("cns endpoint must be specified")?,
            supervisor_namespace,
            supervisor_kubeconfig: args.get_one::<String>("supervisor-kubeconfig").cloned(),
            request_timeout: duration(args, "request-timeout")?,
            log_format: parse::<FmtStyle>(args, "log-format")?,
            resize,
        })
    }

    /// Get the backend kind.
    pub(crate) fn backend(&self) -> BackendKind {
        self.backend
    }
    /// Get the CNS endpoint.
    pub(crate) fn cns_endpoint(&self) -> &str {
        &self.cns_endpoint
    }
    /// Get the supervisor namespace.
    pub(crate) fn supervisor_namespace(&self) -> Option<&str> {
        self.supervisor_namespace.as_deref()
    }
    /// Get the supervisor kubeconfig path.
    pub(crate) fn supervisor_kubeconfig(&self) -> Option<&str> {
        self.supervisor_kubeconfig.as_deref()
    }
    /// Get the remote request timeout.
    pub(crate) fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
    /// Get the log format.
    pub(crate) fn log_format(&self) -> FmtStyle {
        self.log_format
    }
    /// Get the resize tunables.
    pub(crate) fn resize(&self) -> &ResizeConfig {
        &self.resize
    }
}
