//! Node operations used when acting on an interruption

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use reclaim_common::error::is_kube_not_found;
use reclaim_common::{Error, FIELD_MANAGER};

/// Annotation marking static (mirror) pods, which cannot be evicted
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Cluster node operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// List every node
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Mark a node unschedulable; a missing node is success
    async fn cordon(&self, name: &str) -> Result<(), Error>;

    /// Evict evictable pods from a node, returning how many evictions were issued
    async fn evict_pods(&self, name: &str) -> Result<usize, Error>;

    /// Delete the node object; a missing node is success
    async fn delete_node(&self, name: &str) -> Result<(), Error>;
}

/// [`NodeStore`] backed by the Kubernetes API
pub struct KubeNodeStore {
    client: Client,
}

impl KubeNodeStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Whether the eviction API should be used for this pod
///
/// DaemonSet pods would be recreated on the same node, mirror pods are owned
/// by the kubelet, and finished or terminating pods need nothing.
pub fn is_evictable(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return false;
    }
    if pod
        .owner_references()
        .iter()
        .any(|o| o.kind == "DaemonSet")
    {
        return false;
    }
    !matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn cordon(&self, name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "spec": {
                "unschedulable": true
            }
        });
        match api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => {
                debug!(node = %name, "Node already gone, nothing to cordon");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn evict_pods(&self, name: &str) -> Result<usize, Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let on_node = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", name)))
            .await?;

        let mut evicted = 0;
        for pod in on_node.items.iter().filter(|p| is_evictable(p)) {
            let pod_name = pod.name_any();
            let namespace = pod.namespace().unwrap_or_default();
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            match api.evict(&pod_name, &EvictParams::default()).await {
                Ok(_) => evicted += 1,
                Err(e) if is_kube_not_found(&e) => {}
                // Disruption budget would be violated; deleting the node
                // still removes the pod once it is gone.
                Err(kube::Error::Api(ae)) if ae.code == 429 => {
                    warn!(node = %name, pod = %pod_name, namespace = %namespace, "Eviction blocked by disruption budget");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(evicted)
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => {
                debug!(node = %name, "Node already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
