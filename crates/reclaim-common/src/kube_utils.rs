//! Kubernetes helpers shared by the Reclaim controllers

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout; must outlast watch long-polls
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Scheme prefix of AWS node provider IDs
const AWS_PROVIDER_ID_PREFIX: &str = "aws://";

/// Create a kube client from an optional kubeconfig path.
///
/// Without a path the in-cluster config is inferred (service account, then
/// `KUBECONFIG`, then `~/.kube/config`).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to infer kube config: {}", e),
            )
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Compute a short deterministic hash of a string.
///
/// Returns the first 16 hex characters of the SHA-256 digest. Used to make
/// provider resource names unique per cluster without leaking the name.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Extract the instance ID from a node provider ID.
///
/// Accepts `aws:///<zone>/<instance-id>` and the zone-less
/// `aws:///<instance-id>` form. Returns `None` for other providers or
/// malformed values.
pub fn parse_instance_id(provider_id: &str) -> Option<&str> {
    let rest = provider_id.strip_prefix(AWS_PROVIDER_ID_PREFIX)?;
    let id = rest.rsplit('/').next()?;
    if id.starts_with("i-") && id.len() > 2 {
        Some(id)
    } else {
        None
    }
}
