//! Access to the NodeTemplates that own the shared infrastructure

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use reclaim_common::crd::{NodeTemplate, NodeTemplateStatus};
use reclaim_common::error::is_kube_not_found;
use reclaim_common::{Error, FIELD_MANAGER, INFRASTRUCTURE_FINALIZER};

/// Kubernetes operations on NodeTemplates needed by the infrastructure controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OwnerStore: Send + Sync {
    /// List NodeTemplates across all namespaces
    async fn list_templates(&self) -> Result<Vec<NodeTemplate>, Error>;

    /// Add the infrastructure finalizer
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Remove the infrastructure finalizer; a missing template is success
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Replace the template status
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeTemplateStatus,
    ) -> Result<(), Error>;
}

/// [`OwnerStore`] backed by the Kubernetes API
pub struct KubeOwnerStore {
    client: Client,
}

impl KubeOwnerStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<NodeTemplate> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl OwnerStore for KubeOwnerStore {
    async fn list_templates(&self) -> Result<Vec<NodeTemplate>, Error> {
        let api: Api<NodeTemplate> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api = self.api(namespace);
        let template = api.get(name).await?;
        let mut finalizers = template.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == INFRASTRUCTURE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(INFRASTRUCTURE_FINALIZER.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api = self.api(namespace);
        let template = match api.get(name).await {
            Ok(t) => t,
            Err(e) if is_kube_not_found(&e) => {
                debug!(template = %name, "NodeTemplate already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let finalizers: Vec<String> = template
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != INFRASTRUCTURE_FINALIZER)
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        match api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeTemplateStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
