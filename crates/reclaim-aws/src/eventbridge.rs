//! Event-routing service boundary and its EventBridge implementation

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_eventbridge::types::{RuleState, Tag, Target};
use aws_sdk_eventbridge::Client;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use reclaim_common::retry::{retry_throttled, RetryConfig};
use reclaim_common::{ProviderError, ProviderErrorKind};

use crate::error::{build_error, from_sdk, missing_field};

/// A rule as returned by a listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSummary {
    /// Rule name
    pub name: String,
    /// Rule ARN, used for tag lookups
    pub arn: String,
}

/// Operations against the event-routing service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventRouterProvider: Send + Sync {
    /// Create or update a rule, returning its ARN
    async fn put_rule(
        &self,
        name: &str,
        event_pattern: &str,
        description: &str,
    ) -> Result<String, ProviderError>;

    /// Apply tags to a rule
    async fn tag_resource(
        &self,
        arn: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError>;

    /// Attach a single target to a rule, replacing one with the same id
    async fn put_targets(
        &self,
        rule_name: &str,
        target_id: &str,
        target_arn: &str,
    ) -> Result<(), ProviderError>;

    /// List every rule whose name starts with `prefix`
    async fn list_rules(&self, prefix: &str) -> Result<Vec<RuleSummary>, ProviderError>;

    /// Tags on a rule
    async fn list_tags_for_resource(
        &self,
        arn: &str,
    ) -> Result<BTreeMap<String, String>, ProviderError>;

    /// Detach targets from a rule
    async fn remove_targets(
        &self,
        rule_name: &str,
        target_ids: &[String],
    ) -> Result<(), ProviderError>;

    /// Delete a rule; targets must already be removed
    async fn delete_rule(&self, name: &str) -> Result<(), ProviderError>;
}

/// [`EventRouterProvider`] backed by AWS EventBridge on the default bus
#[derive(Clone)]
pub struct EventBridgeProvider {
    client: Client,
    retry: RetryConfig,
}

impl EventBridgeProvider {
    /// Create a provider from a loaded SDK config
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self::from_client(Client::new(config))
    }

    /// Create a provider from an existing client
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }
}

fn failed_entries(operation: &str, rule_name: &str, count: i32) -> Result<(), ProviderError> {
    if count > 0 {
        return Err(ProviderError::new(
            ProviderErrorKind::Other,
            operation,
            "FailedEntries",
            format!("{} entries failed for rule {}", count, rule_name),
        ));
    }
    Ok(())
}

#[async_trait]
impl EventRouterProvider for EventBridgeProvider {
    #[instrument(skip(self, event_pattern, description))]
    async fn put_rule(
        &self,
        name: &str,
        event_pattern: &str,
        description: &str,
    ) -> Result<String, ProviderError> {
        let output = retry_throttled(&self.retry, "PutRule", || {
            let client = self.client.clone();
            async move {
                client
                    .put_rule()
                    .name(name)
                    .event_pattern(event_pattern)
                    .description(description)
                    .state(RuleState::Enabled)
                    .send()
                    .await
                    .map_err(|e| from_sdk("PutRule", e))
            }
        })
        .await?;

        output
            .rule_arn()
            .map(str::to_string)
            .ok_or_else(|| missing_field("PutRule", "RuleArn"))
    }

    #[instrument(skip(self, tags))]
    async fn tag_resource(
        &self,
        arn: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let tags = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| build_error("TagResource", e))?;

        retry_throttled(&self.retry, "TagResource", || {
            let request = self
                .client
                .tag_resource()
                .resource_arn(arn)
                .set_tags(Some(tags.clone()));
            async move { request.send().await.map_err(|e| from_sdk("TagResource", e)) }
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn put_targets(
        &self,
        rule_name: &str,
        target_id: &str,
        target_arn: &str,
    ) -> Result<(), ProviderError> {
        let target = Target::builder()
            .id(target_id)
            .arn(target_arn)
            .build()
            .map_err(|e| build_error("PutTargets", e))?;

        let output = retry_throttled(&self.retry, "PutTargets", || {
            let request = self
                .client
                .put_targets()
                .rule(rule_name)
                .targets(target.clone());
            async move { request.send().await.map_err(|e| from_sdk("PutTargets", e)) }
        })
        .await?;

        failed_entries("PutTargets", rule_name, output.failed_entry_count())
    }

    #[instrument(skip(self))]
    async fn list_rules(&self, prefix: &str) -> Result<Vec<RuleSummary>, ProviderError> {
        let mut rules = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let token = next_token.take();
            let output = retry_throttled(&self.retry, "ListRules", || {
                let request = self
                    .client
                    .list_rules()
                    .name_prefix(prefix)
                    .set_next_token(token.clone());
                async move { request.send().await.map_err(|e| from_sdk("ListRules", e)) }
            })
            .await?;

            rules.extend(output.rules().iter().filter_map(|r| {
                Some(RuleSummary {
                    name: r.name()?.to_string(),
                    arn: r.arn()?.to_string(),
                })
            }));

            match output.next_token() {
                Some(t) if !t.is_empty() => next_token = Some(t.to_string()),
                _ => break,
            }
        }

        debug!(prefix = %prefix, count = rules.len(), "Listed rules");
        Ok(rules)
    }

    #[instrument(skip(self))]
    async fn list_tags_for_resource(
        &self,
        arn: &str,
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        let output = retry_throttled(&self.retry, "ListTagsForResource", || {
            let client = self.client.clone();
            async move {
                client
                    .list_tags_for_resource()
                    .resource_arn(arn)
                    .send()
                    .await
                    .map_err(|e| from_sdk("ListTagsForResource", e))
            }
        })
        .await?;

        Ok(output
            .tags()
            .iter()
            .map(|t| (t.key().to_string(), t.value().to_string()))
            .collect())
    }

    #[instrument(skip(self))]
    async fn remove_targets(
        &self,
        rule_name: &str,
        target_ids: &[String],
    ) -> Result<(), ProviderError> {
        let output = retry_throttled(&self.retry, "RemoveTargets", || {
            let request = self
                .client
                .remove_targets()
                .rule(rule_name)
                .set_ids(Some(target_ids.to_vec()));
            async move { request.send().await.map_err(|e| from_sdk("RemoveTargets", e)) }
        })
        .await?;

        failed_entries("RemoveTargets", rule_name, output.failed_entry_count())
    }

    #[instrument(skip(self))]
    async fn delete_rule(&self, name: &str) -> Result<(), ProviderError> {
        retry_throttled(&self.retry, "DeleteRule", || {
            let client = self.client.clone();
            async move {
                client
                    .delete_rule()
                    .name(name)
                    .send()
                    .await
                    .map_err(|e| from_sdk("DeleteRule", e))
            }
        })
        .await?;
        Ok(())
    }
}
