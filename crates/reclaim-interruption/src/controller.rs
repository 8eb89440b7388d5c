//! Interruption queue consumer
//!
//! A single worker long-polls the interruption queue, classifies each
//! message, resolves the instances it names to nodes, acts on those nodes and
//! deletes the message. A message is only deleted once its action succeeded
//! (or there was nothing to do); otherwise the queue redelivers it after the
//! visibility timeout.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use kube::{Resource, ResourceExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use reclaim_aws::{QueueMessage, QueueProvider};
use reclaim_common::events::{actions, EventPublisher};
use reclaim_common::kube_utils::parse_instance_id;
use reclaim_common::settings::PollSettings;
use reclaim_common::{
    labels, Error, OfferingKey, ProviderError, Settings, UnavailableOfferings,
    CAPACITY_TYPE_SPOT,
};

use crate::actions::{decide, event_for, NodeAction};
use crate::messages::{self, Kind, Notification};
use crate::nodes::NodeStore;

/// What happened to one message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// At least one node was acted on or notified
    Actioned,
    /// Nothing to do: unresolved instances or a non-terminal state change
    NoOp,
    /// Malformed or of an unknown type
    Rejected,
    /// Acting failed; the message stays on the queue for redelivery
    Failed,
}

/// Counts for one received batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Messages in the batch
    pub received: usize,
    /// Messages that led to an action or event
    pub actioned: usize,
    /// Messages with nothing to do
    pub no_op: usize,
    /// Malformed or unknown messages
    pub rejected: usize,
    /// Messages left on the queue
    pub failed: usize,
    /// Messages removed from the queue
    pub deleted: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: MessageOutcome, deleted: bool) {
        match outcome {
            MessageOutcome::Actioned => self.actioned += 1,
            MessageOutcome::NoOp => self.no_op += 1,
            MessageOutcome::Rejected => self.rejected += 1,
            MessageOutcome::Failed => self.failed += 1,
        }
        if deleted {
            self.deleted += 1;
        }
    }
}

/// Long-running consumer of the interruption queue
pub struct InterruptionController {
    queue_name: String,
    poll: PollSettings,
    queue: Arc<dyn QueueProvider>,
    nodes: Arc<dyn NodeStore>,
    events: Arc<dyn EventPublisher>,
    offerings: Arc<UnavailableOfferings>,
    queue_url: Mutex<Option<String>>,
}

impl InterruptionController {
    /// Create a consumer for the queue named in `settings`
    pub fn new(
        settings: &Settings,
        queue: Arc<dyn QueueProvider>,
        nodes: Arc<dyn NodeStore>,
        events: Arc<dyn EventPublisher>,
        offerings: Arc<UnavailableOfferings>,
    ) -> Self {
        Self {
            queue_name: settings.queue_name.clone(),
            poll: settings.poll.clone(),
            queue,
            nodes,
            events,
            offerings,
            queue_url: Mutex::new(None),
        }
    }

    /// Poll until `cancel` fires
    ///
    /// Receive failures never end the loop: the worker backs off for
    /// `poll.error_backoff` and tries again. A missing queue also drops the
    /// cached URL so the next attempt looks it up by name.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(queue = %self.queue_name, "Starting interruption queue consumer");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.receive() => received,
            };

            match received {
                Ok((url, batch)) => {
                    if batch.is_empty() {
                        continue;
                    }
                    let summary = self.process_batch(&url, batch).await;
                    debug!(
                        received = summary.received,
                        actioned = summary.actioned,
                        no_op = summary.no_op,
                        rejected = summary.rejected,
                        failed = summary.failed,
                        deleted = summary.deleted,
                        "Processed interruption batch"
                    );
                }
                Err(e) => {
                    if e.is_not_found() {
                        *self.queue_url.lock().await = None;
                        info!(queue = %self.queue_name, "Interruption queue not found, waiting for it to be provisioned");
                    } else {
                        warn!(queue = %self.queue_name, error = %e, "Failed to receive interruption messages");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll.error_backoff) => {}
                    }
                }
            }
        }

        info!(queue = %self.queue_name, "Interruption queue consumer stopped");
    }

    /// Resolve the queue URL (cached) and long-poll one batch
    pub async fn receive(&self) -> Result<(String, Vec<QueueMessage>), ProviderError> {
        let url = self.resolve_queue_url().await?;
        let batch = self.queue.receive_messages(&url, &self.poll).await?;
        Ok((url, batch))
    }

    async fn resolve_queue_url(&self) -> Result<String, ProviderError> {
        let mut cached = self.queue_url.lock().await;
        if let Some(url) = cached.as_ref() {
            return Ok(url.clone());
        }
        let url = self.queue.queue_url(&self.queue_name).await?;
        debug!(queue = %self.queue_name, url = %url, "Resolved interruption queue");
        *cached = Some(url.clone());
        Ok(url)
    }

    /// Handle one received batch
    ///
    /// Nodes are listed once for the whole batch and messages are handled
    /// concurrently. If the listing fails no message is deleted.
    #[instrument(skip(self, batch), fields(count = batch.len()))]
    pub async fn process_batch(&self, url: &str, batch: Vec<QueueMessage>) -> BatchSummary {
        let mut summary = BatchSummary {
            received: batch.len(),
            ..Default::default()
        };

        let nodes = match self.nodes.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "Failed to list nodes, leaving batch for redelivery");
                summary.failed = batch.len();
                return summary;
            }
        };
        let by_instance = index_by_instance(&nodes);

        let outcomes = join_all(
            batch
                .iter()
                .map(|message| self.handle_message(url, message, &by_instance)),
        )
        .await;
        for (outcome, deleted) in outcomes {
            summary.record(outcome, deleted);
        }
        summary
    }

    async fn handle_message(
        &self,
        url: &str,
        message: &QueueMessage,
        by_instance: &HashMap<&str, &Node>,
    ) -> (MessageOutcome, bool) {
        let outcome = match messages::parse(&message.body) {
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Rejecting malformed notification");
                MessageOutcome::Rejected
            }
            Ok(notification) if notification.kind == Kind::Unknown => {
                info!(
                    message_id = %message.message_id,
                    source = %notification.source,
                    detail_type = %notification.detail_type,
                    "Rejecting notification of unknown type"
                );
                MessageOutcome::Rejected
            }
            Ok(notification) => match self.act(&notification, by_instance).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        kind = %notification.kind,
                        error = %e,
                        "Failed to act on notification, leaving it for redelivery"
                    );
                    return (MessageOutcome::Failed, false);
                }
            },
        };

        match self.queue.delete_message(url, &message.receipt_handle).await {
            Ok(()) => (outcome, true),
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Failed to delete processed notification");
                (outcome, false)
            }
        }
    }

    async fn act(
        &self,
        notification: &Notification,
        by_instance: &HashMap<&str, &Node>,
    ) -> Result<MessageOutcome, Error> {
        let action = decide(notification.kind);
        if action == NodeAction::NoOp {
            debug!(event_id = %notification.event_id, kind = %notification.kind, "Nothing to do for notification");
            return Ok(MessageOutcome::NoOp);
        }

        let mut resolved = Vec::new();
        for instance_id in &notification.instance_ids {
            match by_instance.get(instance_id.as_str()) {
                Some(node) => resolved.push(*node),
                None => debug!(
                    instance_id = %instance_id,
                    kind = %notification.kind,
                    "Instance does not belong to a cluster node"
                ),
            }
        }
        if resolved.is_empty() {
            return Ok(MessageOutcome::NoOp);
        }

        for node in resolved {
            self.act_on_node(notification, action, node).await?;
        }
        Ok(MessageOutcome::Actioned)
    }

    async fn act_on_node(
        &self,
        notification: &Notification,
        action: NodeAction,
        node: &Node,
    ) -> Result<(), Error> {
        let name = node.name_any();

        if notification.kind == Kind::SpotInterruption {
            if let Some(key) = spot_offering(node) {
                self.offerings.mark_unavailable(key);
            }
        }

        let action_label = match action {
            NodeAction::CordonAndEvict => {
                self.nodes.cordon(&name).await?;
                let evicted = self.nodes.evict_pods(&name).await?;
                self.nodes.delete_node(&name).await?;
                info!(node = %name, kind = %notification.kind, evicted, "Cordoned and drained interrupted node");
                actions::CORDON_AND_EVICT
            }
            _ => actions::NOTIFY,
        };

        if let Some(event) = event_for(notification) {
            self.events
                .publish(
                    &node.object_ref(&()),
                    event.type_,
                    event.reason,
                    action_label,
                    Some(event.note),
                )
                .await;
        }
        Ok(())
    }
}

/// Map instance ids to the nodes running them
fn index_by_instance(nodes: &[Node]) -> HashMap<&str, &Node> {
    nodes
        .iter()
        .filter_map(|node| {
            let provider_id = node.spec.as_ref()?.provider_id.as_deref()?;
            Some((parse_instance_id(provider_id)?, node))
        })
        .collect()
}

/// Offering of a spot node, when it carries every label needed to name it
fn spot_offering(node: &Node) -> Option<OfferingKey> {
    let node_labels = node.labels();
    let capacity_type = node_labels.get(labels::CAPACITY_TYPE)?;
    if capacity_type != CAPACITY_TYPE_SPOT {
        return None;
    }
    Some(OfferingKey::new(
        node_labels.get(labels::INSTANCE_TYPE)?.clone(),
        node_labels.get(labels::ZONE)?.clone(),
        capacity_type.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::MockNodeStore;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use reclaim_aws::fake::FakeProvider;
    use reclaim_common::events::{reasons, RecordingEventPublisher};
    use kube::runtime::events::EventType;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const QUEUE: &str = "test-cluster";

    fn node(name: &str, instance_id: &str, spot: bool) -> Node {
        let mut node_labels = BTreeMap::from([
            (labels::INSTANCE_TYPE.to_string(), "m5.large".to_string()),
            (labels::ZONE.to_string(), "us-west-2a".to_string()),
        ]);
        if spot {
            node_labels.insert(labels::CAPACITY_TYPE.to_string(), CAPACITY_TYPE_SPOT.to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(node_labels),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(format!("aws:///us-west-2a/{}", instance_id)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn spot_body(instance_id: &str) -> String {
        serde_json::json!({
            "id": "spot-1",
            "source": "aws.ec2",
            "detail-type": "EC2 Spot Instance Interruption Warning",
            "detail": {"instance-id": instance_id, "instance-action": "terminate"}
        })
        .to_string()
    }

    fn rebalance_body(instance_id: &str) -> String {
        serde_json::json!({
            "id": "rebalance-1",
            "source": "aws.ec2",
            "detail-type": "EC2 Instance Rebalance Recommendation",
            "detail": {"instance-id": instance_id}
        })
        .to_string()
    }

    fn state_body(instance_id: &str, state: &str) -> String {
        serde_json::json!({
            "id": "state-1",
            "source": "aws.ec2",
            "detail-type": "EC2 Instance State-change Notification",
            "detail": {"instance-id": instance_id, "state": state}
        })
        .to_string()
    }

    fn health_body(instance_ids: &[&str]) -> String {
        let entities: Vec<_> = instance_ids
            .iter()
            .map(|id| serde_json::json!({"entityValue": id}))
            .collect();
        serde_json::json!({
            "id": "health-1",
            "source": "aws.health",
            "detail-type": "AWS Health Event",
            "detail": {
                "service": "EC2",
                "eventTypeCategory": "scheduledChange",
                "affectedEntities": entities
            }
        })
        .to_string()
    }

    struct Harness {
        fake: Arc<FakeProvider>,
        events: Arc<RecordingEventPublisher>,
        offerings: Arc<UnavailableOfferings>,
        controller: InterruptionController,
    }

    async fn harness(nodes: MockNodeStore) -> Harness {
        let fake = Arc::new(FakeProvider::new());
        fake.create_queue(QUEUE, &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        let events = Arc::new(RecordingEventPublisher::new());
        let offerings = Arc::new(UnavailableOfferings::new());
        let settings = Settings::new(QUEUE).unwrap();
        let controller = InterruptionController::new(
            &settings,
            fake.clone(),
            Arc::new(nodes),
            events.clone(),
            offerings.clone(),
        );
        Harness {
            fake,
            events,
            offerings,
            controller,
        }
    }

    async fn deliver(h: &Harness, bodies: &[String]) -> BatchSummary {
        for body in bodies {
            h.fake.send_message(QUEUE, body.clone()).unwrap();
        }
        let (url, batch) = h.controller.receive().await.unwrap();
        h.controller.process_batch(&url, batch).await
    }

    fn listing(nodes: Vec<Node>) -> MockNodeStore {
        let mut store = MockNodeStore::new();
        store
            .expect_list_nodes()
            .returning(move || Ok(nodes.clone()));
        store
    }

    #[tokio::test]
    async fn spot_interruption_drains_node_and_marks_offering() {
        let mut store = listing(vec![node("node-a", "i-0aaaaaaaaaaaaaaa1", true)]);
        store
            .expect_cordon()
            .withf(|name| name == "node-a")
            .times(1)
            .returning(|_| Ok(()));
        store.expect_evict_pods().times(1).returning(|_| Ok(3));
        store.expect_delete_node().times(1).returning(|_| Ok(()));
        let h = harness(store).await;

        let summary = deliver(&h, &[spot_body("i-0aaaaaaaaaaaaaaa1")]).await;

        assert_eq!(summary.actioned, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(h.fake.in_flight_messages(QUEUE), 0);
        assert_eq!(h.events.calls(reasons::INSTANCE_SPOT_INTERRUPTED), 1);
        assert_eq!(h.events.events()[0].action, actions::CORDON_AND_EVICT);
        assert_eq!(h.events.events()[0].object.as_deref(), Some("node-a"));
        assert!(h.offerings.is_unavailable("m5.large", "us-west-2a", CAPACITY_TYPE_SPOT));
    }

    #[tokio::test]
    async fn spot_interruption_on_unlabeled_node_leaves_cache_alone() {
        let mut store = listing(vec![node("node-a", "i-0aaaaaaaaaaaaaaa1", false)]);
        store.expect_cordon().returning(|_| Ok(()));
        store.expect_evict_pods().returning(|_| Ok(0));
        store.expect_delete_node().returning(|_| Ok(()));
        let h = harness(store).await;

        deliver(&h, &[spot_body("i-0aaaaaaaaaaaaaaa1")]).await;

        assert!(h.offerings.is_empty());
        assert_eq!(h.events.len(), 1);
    }

    #[tokio::test]
    async fn scheduled_change_emits_event_per_node_without_draining() {
        let store = listing(vec![
            node("node-a", "i-0aaaaaaaaaaaaaaa1", false),
            node("node-b", "i-0aaaaaaaaaaaaaaa2", false),
        ]);
        let h = harness(store).await;

        let summary = deliver(
            &h,
            &[health_body(&["i-0aaaaaaaaaaaaaaa1", "i-0aaaaaaaaaaaaaaa2"])],
        )
        .await;

        assert_eq!(summary.actioned, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(h.events.calls(reasons::INSTANCE_UNHEALTHY), 2);
        assert!(h.events.events().iter().all(|e| e.action == actions::NOTIFY));
    }

    #[tokio::test]
    async fn terminal_state_change_drains_node() {
        let mut store = listing(vec![node("node-a", "i-0aaaaaaaaaaaaaaa1", false)]);
        store.expect_cordon().times(1).returning(|_| Ok(()));
        store.expect_evict_pods().times(1).returning(|_| Ok(0));
        store.expect_delete_node().times(1).returning(|_| Ok(()));
        let h = harness(store).await;

        deliver(&h, &[state_body("i-0aaaaaaaaaaaaaaa1", "stopping")]).await;

        assert_eq!(h.events.calls(reasons::INSTANCE_STOPPING), 1);
    }

    #[tokio::test]
    async fn non_terminal_state_change_is_deleted_without_action() {
        let store = listing(vec![node("node-a", "i-0aaaaaaaaaaaaaaa1", false)]);
        let h = harness(store).await;

        let summary = deliver(&h, &[state_body("i-0aaaaaaaaaaaaaaa1", "running")]).await;

        assert_eq!(summary.no_op, 1);
        assert_eq!(summary.deleted, 1);
        assert!(h.events.is_empty());
    }

    #[tokio::test]
    async fn unresolved_instance_is_deleted_as_no_op() {
        let store = listing(vec![node("node-a", "i-0aaaaaaaaaaaaaaa1", false)]);
        let h = harness(store).await;

        let summary = deliver(&h, &[spot_body("i-0fffffffffffffff9")]).await;

        assert_eq!(summary.no_op, 1);
        assert_eq!(summary.deleted, 1);
        assert!(h.events.is_empty());
        assert!(h.offerings.is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_are_rejected_and_deleted() {
        let store = listing(Vec::new());
        let h = harness(store).await;
        let unknown = serde_json::json!({
            "source": "aws.ec2",
            "detail-type": "EC2 AMI State Change",
            "detail": {}
        })
        .to_string();

        let summary = deliver(&h, &["{not json".to_string(), unknown]).await;

        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.deleted, 2);
        assert_eq!(h.fake.deleted_messages().len(), 2);
    }

    #[tokio::test]
    async fn failed_action_is_retried_after_visibility_timeout() {
        let mut store = listing(vec![node("node-a", "i-0aaaaaaaaaaaaaaa1", false)]);
        let cordons = Arc::new(AtomicUsize::new(0));
        let attempts = cordons.clone();
        store.expect_cordon().times(2).returning(move |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::internal("apiserver unavailable"))
            } else {
                Ok(())
            }
        });
        store.expect_evict_pods().times(1).returning(|_| Ok(1));
        store.expect_delete_node().times(1).returning(|_| Ok(()));
        let h = harness(store).await;

        let first = deliver(&h, &[spot_body("i-0aaaaaaaaaaaaaaa1")]).await;

        assert_eq!(first.failed, 1);
        assert_eq!(first.deleted, 0);
        assert_eq!(h.fake.in_flight_messages(QUEUE), 1);
        assert!(h.events.is_empty());

        // Nothing retries locally; the message comes back only through redelivery
        h.fake.expire_visibility();
        let (url, batch) = h.controller.receive().await.unwrap();
        assert_eq!(batch.len(), 1);
        let second = h.controller.process_batch(&url, batch).await;

        assert_eq!(second.actioned, 1);
        assert_eq!(second.deleted, 1);
        assert_eq!(h.fake.deleted_messages().len(), 1);
        assert_eq!(h.fake.in_flight_messages(QUEUE), 0);
        assert_eq!(h.events.calls(reasons::INSTANCE_SPOT_INTERRUPTED), 1);
        assert_eq!(cordons.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rebalance_only_notifies() {
        // No cordon, eviction or delete expectations: any call fails the test
        let store = listing(vec![node("node-a", "i-0aaaaaaaaaaaaaaa1", true)]);
        let h = harness(store).await;

        let summary = deliver(&h, &[rebalance_body("i-0aaaaaaaaaaaaaaa1")]).await;

        assert_eq!(summary.actioned, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(h.fake.deleted_messages().len(), 1);
        let events = h.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, EventType::Normal);
        assert_eq!(events[0].reason, reasons::INSTANCE_REBALANCE_RECOMMENDATION);
        assert_eq!(events[0].action, actions::NOTIFY);
        assert!(h.offerings.is_empty());
    }

    #[tokio::test]
    async fn node_listing_failure_deletes_nothing() {
        let mut store = MockNodeStore::new();
        store
            .expect_list_nodes()
            .returning(|| Err(Error::internal("apiserver unavailable")));
        let h = harness(store).await;

        let summary = deliver(
            &h,
            &[spot_body("i-0aaaaaaaaaaaaaaa1"), "{not json".to_string()],
        )
        .await;

        assert_eq!(summary.failed, 2);
        assert_eq!(h.fake.calls("DeleteMessage"), 0);
        assert_eq!(h.fake.in_flight_messages(QUEUE), 2);
    }

    #[tokio::test]
    async fn nodes_are_listed_once_per_batch() {
        let mut store = MockNodeStore::new();
        store.expect_list_nodes().times(1).returning(|| Ok(Vec::new()));
        let h = harness(store).await;

        let bodies: Vec<_> = (0..5).map(|_| spot_body("i-0aaaaaaaaaaaaaaa1")).collect();
        let summary = deliver(&h, &bodies).await;

        assert_eq!(summary.received, 5);
        assert_eq!(summary.no_op, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_url_is_cached() {
        let h = harness(listing(Vec::new())).await;
        h.fake.send_message(QUEUE, spot_body("i-1")).unwrap();
        h.controller.receive().await.unwrap();
        h.controller.receive().await.unwrap();
        assert_eq!(h.fake.calls("GetQueueUrl"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_waits_for_queue_then_processes_until_cancelled() {
        let fake = Arc::new(FakeProvider::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let store = listing(vec![node("node-a", "i-0aaaaaaaaaaaaaaa1", false)]);
        let settings = Settings::new(QUEUE).unwrap();
        let controller = Arc::new(InterruptionController::new(
            &settings,
            fake.clone(),
            Arc::new(store),
            events.clone(),
            Arc::new(UnavailableOfferings::new()),
        ));

        let cancel = CancellationToken::new();
        let worker = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        // Queue does not exist yet: the worker keeps retrying
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(fake.calls("GetQueueUrl") >= 2);

        fake.create_queue(QUEUE, &BTreeMap::new(), &BTreeMap::new())
            .await
            .unwrap();
        fake.send_message(QUEUE, health_body(&["i-0aaaaaaaaaaaaaaa1"]))
            .unwrap();

        for _ in 0..10 {
            if !fake.deleted_messages().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        assert_eq!(fake.deleted_messages().len(), 1);
        assert_eq!(events.calls(reasons::INSTANCE_UNHEALTHY), 1);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_queue_is_looked_up_again() {
        let h = harness(listing(Vec::new())).await;
        h.controller.receive().await.unwrap();

        let url = h.fake.queue(QUEUE).unwrap().url;
        h.fake.delete_queue(&url).await.unwrap();

        let cancel = CancellationToken::new();
        let controller = Arc::new(h.controller);
        let worker = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(15)).await;
        cancel.cancel();
        worker.await.unwrap();

        // One lookup before the deletion, at least one after NotFound cleared the cache
        assert!(h.fake.calls("GetQueueUrl") >= 2);
    }
}
