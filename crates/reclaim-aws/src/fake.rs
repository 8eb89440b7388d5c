//! In-memory queue and event-router provider
//!
//! Behaves like SQS and EventBridge closely enough to test idempotence,
//! partial state and teardown: queues hold messages, receive moves them in
//! flight, deleting a queue blocks recreating it until
//! [`FakeProvider::expire_recently_deleted`] is called, and failures can be
//! injected per operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reclaim_common::settings::PollSettings;
use reclaim_common::{ProviderError, ProviderErrorKind};

use crate::eventbridge::{EventRouterProvider, RuleSummary};
use crate::sqs::{QueueMessage, QueueProvider};

const ACCOUNT: &str = "123456789012";
const REGION: &str = "us-west-2";

/// A queue held by the fake
#[derive(Clone, Debug, Default)]
pub struct FakeQueue {
    /// Queue URL
    pub url: String,
    /// Queue ARN
    pub arn: String,
    /// Current attributes
    pub attributes: BTreeMap<String, String>,
    /// Current tags
    pub tags: BTreeMap<String, String>,
    pending: VecDeque<(String, String)>,
    in_flight: HashMap<String, (String, String)>,
}

/// A rule held by the fake
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeRule {
    /// Rule ARN
    pub arn: String,
    /// Event pattern JSON
    pub event_pattern: String,
    /// Tags on the rule
    pub tags: BTreeMap<String, String>,
    /// Target id to target ARN
    pub targets: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<String, FakeQueue>,
    recently_deleted: BTreeSet<String>,
    rules: BTreeMap<String, FakeRule>,
    calls: HashMap<String, usize>,
    fail_next: HashMap<String, VecDeque<ProviderErrorKind>>,
    fail_always: HashMap<String, ProviderErrorKind>,
    deleted_messages: Vec<String>,
    next_id: u64,
}

impl State {
    fn queue_by_url(&mut self, operation: &str, url: &str) -> Result<&mut FakeQueue, ProviderError> {
        self.queues
            .values_mut()
            .find(|q| q.url == url)
            .ok_or_else(|| not_found(operation, url))
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn not_found(operation: &str, what: &str) -> ProviderError {
    ProviderError::new(
        ProviderErrorKind::NotFound,
        operation,
        "ResourceNotFoundException",
        format!("{} does not exist", what),
    )
}

fn queue_url(name: &str) -> String {
    format!("https://sqs.{}.amazonaws.com/{}/{}", REGION, ACCOUNT, name)
}

/// Stateful fake implementing both provider traits
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<State>,
}

impl FakeProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and return an injected failure, if any
    fn enter(&self, operation: &str) -> Result<MutexGuard<'_, State>, ProviderError> {
        let mut state = self.state();
        *state.calls.entry(operation.to_string()).or_default() += 1;

        let injected = state
            .fail_next
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.fail_always.get(operation).copied());
        if let Some(kind) = injected {
            return Err(ProviderError::new(kind, operation, "Injected", "injected failure"));
        }
        Ok(state)
    }

    /// Fail the next call of `operation` with `kind`; repeated calls queue up
    pub fn fail_next(&self, operation: &str, kind: ProviderErrorKind) {
        self.state()
            .fail_next
            .entry(operation.to_string())
            .or_default()
            .push_back(kind);
    }

    /// Fail every call of `operation` until [`Self::clear_failures`]
    pub fn fail_always(&self, operation: &str, kind: ProviderErrorKind) {
        self.state()
            .fail_always
            .insert(operation.to_string(), kind);
    }

    /// Drop all injected failures
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_next.clear();
        state.fail_always.clear();
    }

    /// Number of calls made to `operation`
    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    /// Reset all call counters
    pub fn reset_calls(&self) {
        self.state().calls.clear();
    }

    /// Let queues deleted so far be recreated
    pub fn expire_recently_deleted(&self) {
        self.state().recently_deleted.clear();
    }

    /// Snapshot of a queue by name
    pub fn queue(&self, name: &str) -> Option<FakeQueue> {
        self.state().queues.get(name).cloned()
    }

    /// Number of queues
    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    /// Snapshot of a rule by name
    pub fn rule(&self, name: &str) -> Option<FakeRule> {
        self.state().rules.get(name).cloned()
    }

    /// Names of all rules
    pub fn rule_names(&self) -> Vec<String> {
        self.state().rules.keys().cloned().collect()
    }

    /// Seed a rule directly, bypassing call counting
    pub fn insert_rule(&self, name: &str, tags: BTreeMap<String, String>) {
        self.state().rules.insert(
            name.to_string(),
            FakeRule {
                arn: format!("arn:aws:events:{}:{}:rule/{}", REGION, ACCOUNT, name),
                tags,
                ..Default::default()
            },
        );
    }

    /// Enqueue a message body on a named queue, returning its message id
    pub fn send_message(&self, queue_name: &str, body: impl Into<String>) -> Option<String> {
        let mut state = self.state();
        let id = format!("msg-{}", state.next_id());
        let queue = state.queues.get_mut(queue_name)?;
        queue.pending.push_back((id.clone(), body.into()));
        Some(id)
    }

    /// Messages waiting to be received
    pub fn pending_messages(&self, queue_name: &str) -> usize {
        self.state()
            .queues
            .get(queue_name)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Messages received but not yet deleted
    pub fn in_flight_messages(&self, queue_name: &str) -> usize {
        self.state()
            .queues
            .get(queue_name)
            .map(|q| q.in_flight.len())
            .unwrap_or(0)
    }

    /// Message ids deleted so far, in order
    pub fn deleted_messages(&self) -> Vec<String> {
        self.state().deleted_messages.clone()
    }

    /// Return every in-flight message to the queue, as a visibility timeout would
    pub fn expire_visibility(&self) {
        let mut state = self.state();
        for queue in state.queues.values_mut() {
            let returned: Vec<_> = queue.in_flight.drain().map(|(_, m)| m).collect();
            queue.pending.extend(returned);
        }
    }
}

#[async_trait]
impl QueueProvider for FakeProvider {
    async fn queue_url(&self, name: &str) -> Result<String, ProviderError> {
        let state = self.enter("GetQueueUrl")?;
        state
            .queues
            .get(name)
            .map(|q| q.url.clone())
            .ok_or_else(|| not_found("GetQueueUrl", name))
    }

    async fn queue_arn(&self, url: &str) -> Result<String, ProviderError> {
        let mut state = self.enter("GetQueueAttributes")?;
        Ok(state.queue_by_url("GetQueueAttributes", url)?.arn.clone())
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &BTreeMap<String, String>,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError> {
        let mut state = self.enter("CreateQueue")?;
        if state.recently_deleted.contains(name) {
            return Err(ProviderError::new(
                ProviderErrorKind::RecentlyDeleted,
                "CreateQueue",
                "AWS.SimpleQueueService.QueueDeletedRecently",
                "wait 60 seconds after deleting a queue before creating a queue with the same name",
            ));
        }
        if let Some(existing) = state.queues.get(name) {
            return Ok(existing.url.clone());
        }
        let queue = FakeQueue {
            url: queue_url(name),
            arn: format!("arn:aws:sqs:{}:{}:{}", REGION, ACCOUNT, name),
            attributes: attributes.clone(),
            tags: tags.clone(),
            ..Default::default()
        };
        let url = queue.url.clone();
        state.queues.insert(name.to_string(), queue);
        Ok(url)
    }

    async fn tag_queue(
        &self,
        url: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("TagQueue")?;
        let queue = state.queue_by_url("TagQueue", url)?;
        queue
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn set_queue_attributes(
        &self,
        url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("SetQueueAttributes")?;
        let queue = state.queue_by_url("SetQueueAttributes", url)?;
        queue
            .attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_queue(&self, url: &str) -> Result<(), ProviderError> {
        let mut state = self.enter("DeleteQueue")?;
        let name = state
            .queues
            .iter()
            .find(|(_, q)| q.url == url)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| not_found("DeleteQueue", url))?;
        state.queues.remove(&name);
        state.recently_deleted.insert(name);
        Ok(())
    }

    async fn receive_messages(
        &self,
        url: &str,
        poll: &PollSettings,
    ) -> Result<Vec<QueueMessage>, ProviderError> {
        let batch = {
            let mut state = self.enter("ReceiveMessage")?;
            let receipt_base = state.next_id();
            let queue = state.queue_by_url("ReceiveMessage", url)?;
            let take = usize::try_from(poll.max_messages).unwrap_or(1).max(1);
            let mut batch = Vec::new();
            for n in 0..take {
                let Some((id, body)) = queue.pending.pop_front() else {
                    break;
                };
                let receipt_handle = format!("rh-{}-{}", receipt_base, n);
                queue
                    .in_flight
                    .insert(receipt_handle.clone(), (id.clone(), body.clone()));
                batch.push(QueueMessage {
                    message_id: id,
                    body,
                    receipt_handle,
                });
            }
            batch
        };

        if batch.is_empty() {
            // Long poll with nothing to deliver
            tokio::time::sleep(poll.wait_time).await;
        }
        Ok(batch)
    }

    async fn delete_message(&self, url: &str, receipt_handle: &str) -> Result<(), ProviderError> {
        let mut state = self.enter("DeleteMessage")?;
        let removed = state
            .queue_by_url("DeleteMessage", url)?
            .in_flight
            .remove(receipt_handle);
        if let Some((id, _)) = removed {
            state.deleted_messages.push(id);
        }
        Ok(())
    }
}

#[async_trait]
impl EventRouterProvider for FakeProvider {
    async fn put_rule(
        &self,
        name: &str,
        event_pattern: &str,
        _description: &str,
    ) -> Result<String, ProviderError> {
        let mut state = self.enter("PutRule")?;
        let rule = state.rules.entry(name.to_string()).or_insert_with(|| FakeRule {
            arn: format!("arn:aws:events:{}:{}:rule/{}", REGION, ACCOUNT, name),
            ..Default::default()
        });
        rule.event_pattern = event_pattern.to_string();
        Ok(rule.arn.clone())
    }

    async fn tag_resource(
        &self,
        arn: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("TagResource")?;
        let rule = state
            .rules
            .values_mut()
            .find(|r| r.arn == arn)
            .ok_or_else(|| not_found("TagResource", arn))?;
        rule.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn put_targets(
        &self,
        rule_name: &str,
        target_id: &str,
        target_arn: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("PutTargets")?;
        let rule = state
            .rules
            .get_mut(rule_name)
            .ok_or_else(|| not_found("PutTargets", rule_name))?;
        rule.targets
            .insert(target_id.to_string(), target_arn.to_string());
        Ok(())
    }

    async fn list_rules(&self, prefix: &str) -> Result<Vec<RuleSummary>, ProviderError> {
        let state = self.enter("ListRules")?;
        Ok(state
            .rules
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, rule)| RuleSummary {
                name: name.clone(),
                arn: rule.arn.clone(),
            })
            .collect())
    }

    async fn list_tags_for_resource(
        &self,
        arn: &str,
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        let state = self.enter("ListTagsForResource")?;
        state
            .rules
            .values()
            .find(|r| r.arn == arn)
            .map(|r| r.tags.clone())
            .ok_or_else(|| not_found("ListTagsForResource", arn))
    }

    async fn remove_targets(
        &self,
        rule_name: &str,
        target_ids: &[String],
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("RemoveTargets")?;
        let rule = state
            .rules
            .get_mut(rule_name)
            .ok_or_else(|| not_found("RemoveTargets", rule_name))?;
        for id in target_ids {
            rule.targets.remove(id);
        }
        Ok(())
    }

    async fn delete_rule(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.enter("DeleteRule")?;
        let has_targets = match state.rules.get(name) {
            None => return Err(not_found("DeleteRule", name)),
            Some(rule) => !rule.targets.is_empty(),
        };
        if has_targets {
            return Err(ProviderError::new(
                ProviderErrorKind::Other,
                "DeleteRule",
                "ValidationException",
                "rule can't be deleted since it has targets",
            ));
        }
        state.rules.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_lifecycle_blocks_quick_recreation() {
        let fake = FakeProvider::new();
        let url = fake
            .create_queue("prod", &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(fake.queue_url("prod").await.unwrap(), url);

        fake.delete_queue(&url).await.unwrap();
        assert!(fake.queue_url("prod").await.unwrap_err().is_not_found());

        let err = fake
            .create_queue("prod", &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_recently_deleted());

        fake.expire_recently_deleted();
        assert!(fake
            .create_queue("prod", &BTreeMap::new(), &BTreeMap::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn messages_move_in_flight_until_deleted() {
        let fake = FakeProvider::new();
        let url = fake
            .create_queue("prod", &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        fake.send_message("prod", "{}").unwrap();
        fake.send_message("prod", "{}").unwrap();

        let batch = fake
            .receive_messages(&url, &PollSettings::default())
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(fake.in_flight_messages("prod"), 2);

        fake.delete_message(&url, &batch[0].receipt_handle)
            .await
            .unwrap();
        fake.expire_visibility();
        assert_eq!(fake.pending_messages("prod"), 1);
        assert_eq!(fake.deleted_messages(), vec![batch[0].message_id.clone()]);
    }

    #[tokio::test]
    async fn rules_with_targets_cannot_be_deleted() {
        let fake = FakeProvider::new();
        fake.put_rule("r", "{}", "").await.unwrap();
        fake.put_targets("r", "t", "arn:q").await.unwrap();
        assert!(fake.delete_rule("r").await.is_err());

        fake.remove_targets("r", &["t".to_string()]).await.unwrap();
        fake.delete_rule("r").await.unwrap();
        assert!(fake.delete_rule("r").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let fake = FakeProvider::new();
        fake.fail_next("PutRule", ProviderErrorKind::PermissionDenied);
        assert_eq!(
            fake.put_rule("r", "{}", "").await.unwrap_err().kind,
            ProviderErrorKind::PermissionDenied
        );
        assert!(fake.put_rule("r", "{}", "").await.is_ok());
        assert_eq!(fake.calls("PutRule"), 2);

        fake.fail_always("ListRules", ProviderErrorKind::Other);
        assert!(fake.list_rules("").await.is_err());
        assert!(fake.list_rules("").await.is_err());
        fake.clear_failures();
        assert!(fake.list_rules("").await.is_ok());
    }
}
