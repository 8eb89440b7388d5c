//! Reclaim operator - interruption handling for provisioned nodes

mod runner;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use kube::CustomResourceExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reclaim_common::crd::NodeTemplate;
use reclaim_common::Settings;

use crate::runner::RunOptions;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Reclaim - drains nodes ahead of provider interruptions
#[derive(Parser, Debug)]
#[command(name = "reclaim", version, about, long_about = None)]
struct Cli {
    /// Print the NodeTemplate CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Name of the Kubernetes cluster; scopes the queue and rules
    #[arg(long, env = "RECLAIM_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Interruption queue name (defaults to the cluster name)
    #[arg(long, env = "RECLAIM_INTERRUPTION_QUEUE")]
    interruption_queue: Option<String>,

    /// AWS region (defaults to the SDK provider chain)
    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,

    /// Run without a queue: no rules are provisioned and nothing is polled
    #[arg(long, env = "RECLAIM_DISABLE_INTERRUPTION_HANDLING")]
    disable_interruption_handling: bool,

    /// Deadline in seconds for each infrastructure ensure or teardown
    #[arg(long, env = "RECLAIM_RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    reconcile_timeout_secs: u64,

    /// Seconds an interrupted offering stays unavailable
    #[arg(long, env = "RECLAIM_UNAVAILABLE_OFFERINGS_TTL_SECS", default_value_t = 180)]
    unavailable_offerings_ttl_secs: u64,

    /// Seconds between sweeps of expired unavailable offerings
    #[arg(long, env = "RECLAIM_CACHE_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    cache_sweep_interval_secs: u64,

    /// Path to a kubeconfig; in-cluster config is used otherwise
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, env = "RECLAIM_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn settings(&self) -> anyhow::Result<Settings> {
        let cluster_name = self
            .cluster_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--cluster-name (or RECLAIM_CLUSTER_NAME) is required"))?;

        let mut settings = Settings::new(cluster_name)?;
        if let Some(queue) = &self.interruption_queue {
            settings = settings.with_queue_name(queue.clone())?;
        }
        if self.reconcile_timeout_secs == 0 {
            anyhow::bail!("reconcile timeout must be positive");
        }
        settings.interruption_handling = !self.disable_interruption_handling;
        settings.reconcile_timeout = Duration::from_secs(self.reconcile_timeout_secs);
        settings.unavailable_offerings_ttl = Duration::from_secs(self.unavailable_offerings_ttl_secs);
        Ok(settings)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and the AWS SDK both pull in rustls; pin one process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&NodeTemplate::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_format);

    let settings = cli.settings()?;
    tracing::info!(
        cluster = %settings.cluster_name,
        queue = %settings.queue_name,
        interruption_handling = settings.interruption_handling,
        "Starting Reclaim operator"
    );

    runner::run(
        settings,
        RunOptions {
            aws_region: cli.aws_region.clone(),
            kubeconfig: cli.kubeconfig.clone(),
            cache_sweep_interval: Duration::from_secs(cli.cache_sweep_interval_secs.max(1)),
        },
    )
    .await
}
