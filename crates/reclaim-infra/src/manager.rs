//! Provisioning and teardown of the interruption queue and routing rules
//!
//! Every step is a create-or-update, so an attempt interrupted halfway is
//! finished by the next one. Nothing is remembered between calls: the queue
//! is looked up by name and rules are discovered by listing and tag, which
//! keeps a restarted controller and a concurrent reconcile equally correct.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use reclaim_aws::{EventRouterProvider, QueueProvider, RuleSummary};
use reclaim_common::crd::NodeTemplate;
use reclaim_common::{Error, ProviderError, Settings, DISCOVERY_TAG_KEY};

use crate::catalog::{queue_attributes, rule_catalog, CatalogRule, RULE_NAME_PREFIX, TARGET_ID};
use crate::owners::OwnerStore;

/// Wait before retrying after the provider refused to recreate a recently
/// deleted queue; matches the provider's minimum recreation interval
pub const RECENTLY_DELETED_REQUEUE: Duration = Duration::from_secs(60);

/// Result of [`InfrastructureManager::ensure`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Queue and all rules exist and point at each other
    Ready {
        /// Queue URL
        queue_url: String,
        /// Queue ARN used as rule target
        queue_arn: String,
    },
    /// Queue cannot be created yet; try again after the delay
    RequeueAfter(Duration),
}

/// Result of [`InfrastructureManager::maybe_teardown`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Other live NodeTemplates still need the infrastructure
    Retained {
        /// Live templates besides the one being deleted
        remaining: usize,
    },
    /// Rules and queue are gone
    Deleted {
        /// Rules found and deleted
        rules_deleted: usize,
    },
    /// Queue deletion must be retried after the delay
    RequeueAfter(Duration),
}

/// Owns the lifecycle of the shared queue and its rule set
pub struct InfrastructureManager {
    queues: Arc<dyn QueueProvider>,
    router: Arc<dyn EventRouterProvider>,
    cluster_name: String,
    queue_name: String,
    tags: BTreeMap<String, String>,
    catalog: Vec<CatalogRule>,
}

impl InfrastructureManager {
    /// Create a manager for the cluster named in `settings`
    pub fn new(
        settings: &Settings,
        queues: Arc<dyn QueueProvider>,
        router: Arc<dyn EventRouterProvider>,
    ) -> Self {
        Self {
            queues,
            router,
            cluster_name: settings.cluster_name.clone(),
            queue_name: settings.queue_name.clone(),
            tags: settings.discovery_tags(),
            catalog: rule_catalog(&settings.cluster_name),
        }
    }

    /// Name of the managed queue
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Rules this manager provisions
    pub fn catalog(&self) -> &[CatalogRule] {
        &self.catalog
    }

    /// Create or repair the queue and every catalog rule
    #[instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn ensure(&self) -> Result<EnsureOutcome, Error> {
        let queue_url = match self.ensure_queue().await {
            Ok(url) => url,
            Err(e) if e.is_recently_deleted() => {
                info!(
                    queue = %self.queue_name,
                    requeue_secs = RECENTLY_DELETED_REQUEUE.as_secs(),
                    "Queue was deleted recently, waiting before recreating"
                );
                return Ok(EnsureOutcome::RequeueAfter(RECENTLY_DELETED_REQUEUE));
            }
            Err(e) => return Err(e.into()),
        };

        let queue_arn = self.queues.queue_arn(&queue_url).await?;
        self.queues
            .set_queue_attributes(&queue_url, &queue_attributes(&queue_arn))
            .await?;

        let results = join_all(
            self.catalog
                .iter()
                .map(|rule| self.ensure_rule(rule, &queue_arn)),
        )
        .await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err.into());
        }

        debug!(queue = %self.queue_name, rules = self.catalog.len(), "Infrastructure in place");
        Ok(EnsureOutcome::Ready {
            queue_url,
            queue_arn,
        })
    }

    async fn ensure_queue(&self) -> Result<String, ProviderError> {
        let url = match self.queues.queue_url(&self.queue_name).await {
            Ok(url) => url,
            Err(e) if e.is_not_found() => {
                info!(queue = %self.queue_name, "Creating interruption queue");
                match self
                    .queues
                    .create_queue(&self.queue_name, &BTreeMap::new(), &self.tags)
                    .await
                {
                    Ok(url) => return Ok(url),
                    Err(e) if e.is_already_exists() => {
                        debug!(queue = %self.queue_name, "Queue created concurrently");
                        self.queues.queue_url(&self.queue_name).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        // A queue we did not create may be missing the discovery tag
        self.queues.tag_queue(&url, &self.tags).await?;
        Ok(url)
    }

    async fn ensure_rule(&self, rule: &CatalogRule, queue_arn: &str) -> Result<(), ProviderError> {
        let rule_arn = self
            .router
            .put_rule(&rule.name, &rule.event_pattern, &rule.description())
            .await?;
        self.router.tag_resource(&rule_arn, &self.tags).await?;
        self.router
            .put_targets(&rule.name, TARGET_ID, queue_arn)
            .await?;
        debug!(rule = %rule.name, "Rule in place");
        Ok(())
    }

    /// Tear everything down if `deleting` is the last live NodeTemplate.
    ///
    /// The owner count comes from a fresh listing, never from local state.
    #[instrument(skip(self, owners, deleting), fields(template = %deleting.name_any()))]
    pub async fn maybe_teardown(
        &self,
        owners: &dyn OwnerStore,
        deleting: &NodeTemplate,
    ) -> Result<TeardownOutcome, Error> {
        let remaining = owners
            .list_templates()
            .await?
            .iter()
            .filter(|t| !is_same_template(t, deleting) && !t.is_deleting())
            .count();

        if remaining > 0 {
            info!(remaining, "Other NodeTemplates remain, keeping infrastructure");
            return Ok(TeardownOutcome::Retained { remaining });
        }

        info!("Last NodeTemplate deleted, tearing down infrastructure");
        self.teardown().await
    }

    /// Delete every discovered rule and the queue, unconditionally
    pub async fn teardown(&self) -> Result<TeardownOutcome, Error> {
        let rules = self.discover_rules().await?;
        let rules_deleted = rules.len();

        let results = join_all(rules.iter().map(|rule| self.delete_rule(rule))).await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err.into());
        }

        match self.delete_queue().await {
            Ok(()) => {}
            Err(e) if e.is_recently_deleted() => {
                return Ok(TeardownOutcome::RequeueAfter(RECENTLY_DELETED_REQUEUE));
            }
            Err(e) => return Err(e.into()),
        }

        info!(rules_deleted, queue = %self.queue_name, "Infrastructure deleted");
        Ok(TeardownOutcome::Deleted { rules_deleted })
    }

    /// Rules in this cluster's catalog that carry this cluster's discovery tag
    pub async fn discover_rules(&self) -> Result<Vec<RuleSummary>, ProviderError> {
        let candidates: Vec<RuleSummary> = self
            .router
            .list_rules(RULE_NAME_PREFIX)
            .await?
            .into_iter()
            .filter(|r| self.catalog.iter().any(|c| c.name == r.name))
            .collect();

        let mut owned = Vec::with_capacity(candidates.len());
        for rule in candidates {
            let tags = match self.router.list_tags_for_resource(&rule.arn).await {
                Ok(tags) => tags,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if tags.get(DISCOVERY_TAG_KEY) == Some(&self.cluster_name) {
                owned.push(rule);
            } else {
                warn!(rule = %rule.name, "Rule name matches but discovery tag does not, skipping");
            }
        }
        Ok(owned)
    }

    async fn delete_rule(&self, rule: &RuleSummary) -> Result<(), ProviderError> {
        ignore_not_found(
            self.router
                .remove_targets(&rule.name, &[TARGET_ID.to_string()])
                .await,
        )?;
        ignore_not_found(self.router.delete_rule(&rule.name).await)?;
        debug!(rule = %rule.name, "Rule deleted");
        Ok(())
    }

    async fn delete_queue(&self) -> Result<(), ProviderError> {
        let url = match self.queues.queue_url(&self.queue_name).await {
            Ok(url) => url,
            Err(e) if e.is_not_found() => {
                debug!(queue = %self.queue_name, "Queue already deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        ignore_not_found(self.queues.delete_queue(&url).await)
    }
}

fn ignore_not_found(result: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn is_same_template(a: &NodeTemplate, b: &NodeTemplate) -> bool {
    match (&a.metadata.uid, &b.metadata.uid) {
        (Some(x), Some(y)) => x == y,
        _ => a.namespace() == b.namespace() && a.name_any() == b.name_any(),
    }
}
