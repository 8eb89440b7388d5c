//! Wires the NodeTemplate controller and the background workers together

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use reclaim_aws::{load_sdk_config, EventBridgeProvider, QueueProvider, SqsQueueProvider};
use reclaim_common::crd::NodeTemplate;
use reclaim_common::events::{EventPublisher, KubeEventPublisher};
use reclaim_common::kube_utils::create_client;
use reclaim_common::{Settings, UnavailableOfferings, FIELD_MANAGER};
use reclaim_infra::{error_policy, reconcile, Context, InfrastructureManager, KubeOwnerStore};
use reclaim_interruption::{InterruptionController, KubeNodeStore};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Reporter name on emitted events
const CONTROLLER_NAME: &str = "reclaim-controller";

/// Process-level options that are not part of [`Settings`]
pub struct RunOptions {
    pub aws_region: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub cache_sweep_interval: Duration,
}

/// Run until SIGTERM or Ctrl-C
///
/// The controller stops on the signal; the queue consumer and cache sweep
/// are then cancelled and awaited.
pub async fn run(settings: Settings, options: RunOptions) -> anyhow::Result<()> {
    let client = create_client(options.kubeconfig.as_deref()).await?;
    ensure_crd_installed(&client).await?;

    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
    let offerings = Arc::new(UnavailableOfferings::with_ttl(
        settings.unavailable_offerings_ttl,
    ));
    let cancel = CancellationToken::new();
    let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let manager = if settings.interruption_handling {
        let sdk = load_sdk_config(options.aws_region).await;
        let queues: Arc<dyn QueueProvider> = Arc::new(SqsQueueProvider::new(&sdk));
        let router = Arc::new(EventBridgeProvider::new(&sdk));

        let consumer = InterruptionController::new(
            &settings,
            queues.clone(),
            Arc::new(KubeNodeStore::new(client.clone())),
            events.clone(),
            offerings.clone(),
        );
        let token = cancel.clone();
        workers.push((
            "interruption consumer",
            tokio::spawn(async move { consumer.run(token).await }),
        ));

        Some(InfrastructureManager::new(&settings, queues, router))
    } else {
        tracing::info!("Interruption handling disabled, no queue will be provisioned or polled");
        None
    };

    workers.push((
        "offering cache sweep",
        tokio::spawn(sweep_offerings(
            offerings,
            options.cache_sweep_interval,
            cancel.clone(),
        )),
    ));

    let ctx = Arc::new(Context::new(
        Arc::new(KubeOwnerStore::new(client.clone())),
        manager,
        events,
        settings.reconcile_timeout,
    ));
    let templates: Api<NodeTemplate> = Api::all(client);

    tracing::info!("- NodeTemplate controller");
    Controller::new(
        templates,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("NodeTemplate"))
    .await;

    tracing::info!("Controller stopped, shutting down workers");
    cancel.cancel();
    for (name, handle) in workers {
        if let Err(e) = handle.await {
            tracing::error!(worker = name, error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Install the NodeTemplate CRD with server-side apply so it always matches
/// the running operator version
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing NodeTemplate CRD...");
    crds.patch(
        NodeTemplate::crd_name(),
        &params,
        &Patch::Apply(&NodeTemplate::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install NodeTemplate CRD: {}", e))?;
    Ok(())
}

/// Periodically drop expired unavailable offerings
async fn sweep_offerings(
    offerings: Arc<UnavailableOfferings>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                offerings.cleanup_expired();
                tracing::trace!(remaining = offerings.len(), "Swept unavailable offerings");
            }
        }
    }
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
