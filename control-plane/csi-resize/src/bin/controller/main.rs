use clap::{Arg, ArgAction};
use csi_resize::{
    backend::{cns::CnsClient, supervisor::SupervisorBackend, StorageBackend},
    context::ResizeContext,
    store::k8s::KubeStore,
    types::ClaimKey,
    Error,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{controller::Action, watcher, Controller},
    Api, Client, ResourceExt,
};
use std::{sync::Arc, time::Duration};
use tracing::{info, trace, warn};

mod config;
use config::{BackendKind, ControllerConfig};

const BACKOFF_PERIOD: Duration = Duration::from_secs(20);

/// Check if the claim is provisioned by our CSI driver.
fn is_ours(pvc: &PersistentVolumeClaim) -> bool {
    let annotations = pvc.annotations();
    utils::STORAGE_PROVISIONER_ANNOTATIONS
        .iter()
        .any(|key| annotations.get(*key).map(String::as_str) == Some(utils::CSI_PLUGIN_NAME))
}

/// Determine what we want to do when dealing with errors from the
/// reconciliation loop
fn error_policy(pvc: Arc<PersistentVolumeClaim>, error: &Error, ctx: Arc<ResizeContext>) -> Action {
    let duration = match error.is_transient() {
        true => ctx.config().retry_interval(),
        false => BACKOFF_PERIOD,
    };
    let when = chrono::Duration::from_std(duration)
        .ok()
        .and_then(|duration| chrono::Utc::now().checked_add_signed(duration));
    warn!(
        claim.name = pvc.name_any(),
        "{}, retry scheduled @{} ({} seconds from now)",
        error,
        when.map(|when| when.to_rfc2822()).unwrap_or_default(),
        duration.as_secs()
    );
    Action::requeue(duration)
}

/// The main work horse
#[tracing::instrument(fields(name = %pvc.name_any()) skip(pvc, ctx))]
async fn reconcile(pvc: Arc<PersistentVolumeClaim>, ctx: Arc<ResizeContext>) -> Result<Action, Error> {
    if !is_ours(&pvc) {
        return Ok(Action::await_change());
    }
    let key = ClaimKey::new(pvc.namespace().unwrap_or_default(), pvc.name_any());
    ctx.reconciler().reconcile(&key).await
}

/// Build the storage backend selected by the configuration.
async fn storage_backend(
    config: &ControllerConfig,
    k8s: &Client,
) -> anyhow::Result<Arc<dyn StorageBackend>> {
    Ok(match config.backend() {
        BackendKind::Cns => Arc::new(
            CnsClient::new(config.cns_endpoint(), config.request_timeout())
                .map_err(|error| anyhow::anyhow!("Failed to create CNS client: {error}"))?,
        ),
        BackendKind::Supervisor => {
            let client = match config.supervisor_kubeconfig() {
                Some(path) => {
                    let kubeconfig = Kubeconfig::read_from(path)?;
                    let options = KubeConfigOptions::default();
                    Client::try_from(kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?)?
                }
                None => k8s.clone(),
            };
            let namespace = config
                .supervisor_namespace()
                .ok_or_else(|| anyhow::anyhow!("supervisor namespace must be specified"))?;
            Arc::new(SupervisorBackend::new(client, namespace))
        }
    })
}

async fn resize_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let k8s = Client::try_default().await?;
    let backend = storage_backend(&config, &k8s).await?;
    let store = Arc::new(KubeStore::new(k8s.clone()));
    let context = ResizeContext::new(store, backend, config.resize().clone());

    info!(
        backend = config.backend().as_ref(),
        online_expansion = config.resize().online_expansion(),
        failure_policy = %config.resize().failure_policy(),
        "Starting CSI volume resize controller"
    );

    let claims: Api<PersistentVolumeClaim> = Api::all(k8s);
    Controller::new(claims, watcher::Config::default())
        .run(reconcile, error_policy, Arc::new(context))
        .for_each(|res| async move {
            match res {
                Ok(o) => {
                    trace!(?o);
                }
                Err(e) => {
                    trace!(?e);
                }
            }
        })
        .await;

    Ok(())
}

#[tokio::main(worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let args = clap::Command::new(utils::package_description!())
        .version(utils::version_info_str!())
        .arg(
            Arg::new("backend")
                .long("backend")
                .short('b')
                .env("RESIZE_BACKEND")
                .value_parser(["cns", "supervisor"])
                .default_value("cns")
                .help("where the backing volumes live"),
        )
        .arg(
            Arg::new("cns-endpoint")
                .long("cns-endpoint")
                .short('e')
                .env("CNS_ENDPOINT")
                .default_value("http://cns-gateway:8080")
                .help("a URL endpoint to the CNS REST gateway"),
        )
        .arg(
            Arg::new("supervisor-namespace")
                .long("supervisor-namespace")
                .env("SUPERVISOR_NAMESPACE")
                .help("the supervisor cluster namespace holding the guest cluster volumes"),
        )
        .arg(
            Arg::new("supervisor-kubeconfig")
                .long("supervisor-kubeconfig")
                .env("SUPERVISOR_KUBECONFIG")
                .help("kubeconfig of the supervisor cluster, defaults to the local cluster"),
        )
        .arg(
            Arg::new("request-timeout")
                .short('t')
                .long("request-timeout")
                .env("REQUEST_TIMEOUT")
                .default_value(utils::DEFAULT_REQ_TIMEOUT)
                .help("the timeout for remote requests"),
        )
        .arg(
            Arg::new("retry-interval")
                .long("retry-interval")
                .env("RETRY_INTERVAL")
                .default_value(utils::RESIZE_RETRY_INTERVAL)
                .help("delay before retrying a transient expansion failure"),
        )
        .arg(
            Arg::new("terminal-retry-interval")
                .long("terminal-retry-interval")
                .env("TERMINAL_RETRY_INTERVAL")
                .default_value(utils::TERMINAL_RESIZE_RETRY_INTERVAL)
                .help("delay before retrying a terminal expansion failure left pending"),
        )
        .arg(
            Arg::new("failure-policy")
                .long("failure-policy")
                .env("FAILURE_POLICY")
                .value_parser(["leave-pending", "revert"])
                .default_value("leave-pending")
                .help("what to do with the request of a claim whose expansion failed terminally"),
        )
        .arg(
            Arg::new("online-expansion")
                .long("online-expansion")
                .env("ONLINE_EXPANSION")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool))
                .default_value("true")
                .help("allow expansion of volumes attached to a node"),
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

    let config = ControllerConfig::from_args(&args)?;
    utils::tracing_telemetry::init_tracing("csi-resize-controller", config.log_format());

    resize_controller(config).await
}
