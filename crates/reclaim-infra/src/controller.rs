//! NodeTemplate reconciliation
//!
//! Each NodeTemplate holds the infrastructure finalizer while it exists.
//! Reconcile ensures the queue and rules; deletion runs the reference-counted
//! teardown and only then releases the finalizer.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use reclaim_common::crd::{NodeTemplate, NodeTemplatePhase, NodeTemplateStatus};
use reclaim_common::events::{actions, reasons, EventPublisher};
use reclaim_common::Error;

use crate::manager::{EnsureOutcome, InfrastructureManager, TeardownOutcome};
use crate::owners::OwnerStore;

/// Periodic requeue to repair drift such as a rule deleted by hand
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// First error-policy delay
const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Longest error-policy delay
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Shared state for the NodeTemplate controller
pub struct Context {
    /// NodeTemplate access
    pub owners: Arc<dyn OwnerStore>,
    /// Infrastructure manager; `None` when interruption handling is disabled
    pub manager: Option<InfrastructureManager>,
    /// Kubernetes event sink
    pub events: Arc<dyn EventPublisher>,
    /// Deadline for each ensure or teardown call
    pub reconcile_timeout: Duration,
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a controller context
    pub fn new(
        owners: Arc<dyn OwnerStore>,
        manager: Option<InfrastructureManager>,
        events: Arc<dyn EventPublisher>,
        reconcile_timeout: Duration,
    ) -> Self {
        Self {
            owners,
            manager,
            events,
            reconcile_timeout,
            failures: DashMap::new(),
        }
    }

    /// Consecutive failures recorded for a template
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.get(key).map(|c| *c).unwrap_or(0)
    }

    fn reset_backoff(&self, key: &str) {
        self.failures.remove(key);
    }

    fn next_backoff(&self, key: &str) -> Duration {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        backoff_delay(*count)
    }
}

/// Exponential backoff: 5s, 10s, 20s, ... capped at 5 minutes
pub fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_CAP)
}

fn object_key(template: &NodeTemplate) -> String {
    format!(
        "{}/{}",
        template.namespace().unwrap_or_default(),
        template.name_any()
    )
}

/// Reconcile a NodeTemplate
#[instrument(skip(template, ctx), fields(template = %object_key(&template)))]
pub async fn reconcile(template: Arc<NodeTemplate>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = object_key(&template);

    let action = if template.is_deleting() {
        handle_deletion(&template, &ctx).await?
    } else {
        reconcile_live(&template, &ctx).await?
    };

    ctx.reset_backoff(&key);
    Ok(action)
}

/// Requeue with per-template exponential backoff
pub fn error_policy(template: Arc<NodeTemplate>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&template);
    let delay = if error.is_retryable() {
        ctx.next_backoff(&key)
    } else {
        BACKOFF_CAP
    };
    warn!(
        template = %key,
        error = %error,
        retryable = error.is_retryable(),
        requeue_secs = delay.as_secs(),
        "NodeTemplate reconcile failed, will retry"
    );
    Action::requeue(delay)
}

async fn reconcile_live(template: &NodeTemplate, ctx: &Context) -> Result<Action, Error> {
    let name = template.name_any();
    let namespace = namespace_of(template)?;

    let Some(manager) = &ctx.manager else {
        debug!(template = %name, "Interruption handling disabled, no infrastructure to ensure");
        update_status(template, ctx, NodeTemplatePhase::Ready, None, None).await?;
        return Ok(Action::requeue(RESYNC_INTERVAL));
    };

    if !template.has_finalizer() {
        info!(template = %name, "Adding infrastructure finalizer");
        ctx.owners.add_finalizer(&namespace, &name).await?;
    }

    let outcome = match tokio::time::timeout(ctx.reconcile_timeout, manager.ensure()).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout("ensure infrastructure", ctx.reconcile_timeout)),
    };

    match outcome {
        Ok(EnsureOutcome::Ready { .. }) => {
            let was_ready = template.phase() == NodeTemplatePhase::Ready;
            update_status(
                template,
                ctx,
                NodeTemplatePhase::Ready,
                None,
                Some(manager.queue_name().to_string()),
            )
            .await?;
            if !was_ready {
                publish(
                    template,
                    ctx,
                    EventType::Normal,
                    reasons::INFRASTRUCTURE_READY,
                    actions::RECONCILE,
                    format!("Interruption queue {} and rules are ready", manager.queue_name()),
                )
                .await;
            }
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Ok(EnsureOutcome::RequeueAfter(delay)) => {
            update_status(
                template,
                ctx,
                NodeTemplatePhase::Pending,
                Some("Queue was deleted recently; waiting to recreate it".to_string()),
                Some(manager.queue_name().to_string()),
            )
            .await?;
            Ok(Action::requeue(delay))
        }
        Err(e) => {
            let message = e.to_string();
            if let Err(status_err) = update_status(
                template,
                ctx,
                NodeTemplatePhase::Failed,
                Some(message.clone()),
                Some(manager.queue_name().to_string()),
            )
            .await
            {
                warn!(template = %name, error = %status_err, "Failed to record Failed status");
            }
            publish(
                template,
                ctx,
                EventType::Warning,
                reasons::INFRASTRUCTURE_FAILED,
                actions::RECONCILE,
                message,
            )
            .await;
            Err(e)
        }
    }
}

async fn handle_deletion(template: &NodeTemplate, ctx: &Context) -> Result<Action, Error> {
    let name = template.name_any();
    let namespace = namespace_of(template)?;

    if !template.has_finalizer() {
        debug!(template = %name, "No finalizer, allowing deletion");
        return Ok(Action::await_change());
    }

    if let Some(manager) = &ctx.manager {
        if template.phase() != NodeTemplatePhase::Deleting {
            update_status(
                template,
                ctx,
                NodeTemplatePhase::Deleting,
                None,
                Some(manager.queue_name().to_string()),
            )
            .await?;
        }

        let outcome = match tokio::time::timeout(
            ctx.reconcile_timeout,
            manager.maybe_teardown(ctx.owners.as_ref(), template),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::timeout(
                    "tear down infrastructure",
                    ctx.reconcile_timeout,
                ))
            }
        };

        match outcome {
            TeardownOutcome::Retained { remaining } => {
                debug!(template = %name, remaining, "Infrastructure retained");
            }
            TeardownOutcome::Deleted { rules_deleted } => {
                publish(
                    template,
                    ctx,
                    EventType::Normal,
                    reasons::INFRASTRUCTURE_DELETED,
                    actions::DELETE,
                    format!(
                        "Deleted interruption queue {} and {} rules",
                        manager.queue_name(),
                        rules_deleted
                    ),
                )
                .await;
            }
            TeardownOutcome::RequeueAfter(delay) => {
                info!(template = %name, requeue_secs = delay.as_secs(), "Queue deletion must wait");
                return Ok(Action::requeue(delay));
            }
        }
    }

    info!(template = %name, "Removing infrastructure finalizer");
    ctx.owners.remove_finalizer(&namespace, &name).await?;
    Ok(Action::await_change())
}

fn namespace_of(template: &NodeTemplate) -> Result<String, Error> {
    template
        .namespace()
        .ok_or_else(|| Error::validation_for(template.name_any(), "NodeTemplate must be namespaced"))
}

/// Patch status unless it already matches
async fn update_status(
    template: &NodeTemplate,
    ctx: &Context,
    phase: NodeTemplatePhase,
    message: Option<String>,
    queue_name: Option<String>,
) -> Result<(), Error> {
    let status = NodeTemplateStatus {
        phase,
        message,
        queue_name,
    };
    if template.status.as_ref() == Some(&status) {
        debug!(template = %template.name_any(), "Status unchanged, skipping update");
        return Ok(());
    }
    let namespace = namespace_of(template)?;
    ctx.owners
        .patch_status(&namespace, &template.name_any(), &status)
        .await
}

async fn publish(
    template: &NodeTemplate,
    ctx: &Context,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&template.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owners::MockOwnerStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use reclaim_aws::fake::FakeProvider;
    use reclaim_common::crd::NodeTemplateSpec;
    use reclaim_common::events::RecordingEventPublisher;
    use reclaim_common::{ProviderErrorKind, Settings, INFRASTRUCTURE_FINALIZER};

    fn template(name: &str, with_finalizer: bool) -> NodeTemplate {
        let mut t = NodeTemplate::new(name, NodeTemplateSpec::default());
        t.metadata.namespace = Some("default".to_string());
        t.metadata.uid = Some(format!("uid-{}", name));
        if with_finalizer {
            t.metadata.finalizers = Some(vec![INFRASTRUCTURE_FINALIZER.to_string()]);
        }
        t
    }

    fn deleting(name: &str) -> NodeTemplate {
        let mut t = template(name, true);
        t.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        t
    }

    struct Harness {
        fake: Arc<FakeProvider>,
        events: Arc<RecordingEventPublisher>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                fake: Arc::new(FakeProvider::new()),
                events: Arc::new(RecordingEventPublisher::new()),
            }
        }

        fn context(&self, owners: MockOwnerStore) -> Arc<Context> {
            let settings = Settings::new("prod").unwrap();
            let manager =
                InfrastructureManager::new(&settings, self.fake.clone(), self.fake.clone());
            Arc::new(Context::new(
                Arc::new(owners),
                Some(manager),
                self.events.clone(),
                Duration::from_secs(60),
            ))
        }
    }

    #[tokio::test]
    async fn new_template_gets_finalizer_and_infrastructure() {
        let harness = Harness::new();
        let mut owners = MockOwnerStore::new();
        owners
            .expect_add_finalizer()
            .withf(|ns, name| ns == "default" && name == "a")
            .times(1)
            .returning(|_, _| Ok(()));
        owners
            .expect_patch_status()
            .withf(|_, _, status| status.phase == NodeTemplatePhase::Ready)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = harness.context(owners);
        let action = reconcile(Arc::new(template("a", false)), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
        assert_eq!(harness.fake.calls("CreateQueue"), 1);
        assert_eq!(harness.fake.calls("PutRule"), 4);
        assert_eq!(harness.events.calls(reasons::INFRASTRUCTURE_READY), 1);
    }

    #[tokio::test]
    async fn unchanged_ready_status_is_not_patched() {
        let harness = Harness::new();
        let mut owners = MockOwnerStore::new();
        owners.expect_patch_status().never();
        owners.expect_add_finalizer().never();

        let mut t = template("a", true);
        t.status = Some(NodeTemplateStatus {
            phase: NodeTemplatePhase::Ready,
            message: None,
            queue_name: Some("prod".to_string()),
        });

        let ctx = harness.context(owners);
        reconcile(Arc::new(t), ctx).await.unwrap();
        assert!(harness.events.is_empty());
    }

    #[tokio::test]
    async fn permission_denied_fails_reconcile_and_records_status() {
        let harness = Harness::new();
        harness
            .fake
            .fail_always("CreateQueue", ProviderErrorKind::PermissionDenied);
        let mut owners = MockOwnerStore::new();
        owners
            .expect_patch_status()
            .withf(|_, _, status| status.phase == NodeTemplatePhase::Failed)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = harness.context(owners);
        let err = reconcile(Arc::new(template("a", true)), ctx.clone())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(harness.events.calls(reasons::INFRASTRUCTURE_FAILED), 1);

        let action = error_policy(Arc::new(template("a", true)), &err, ctx.clone());
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert_eq!(ctx.failure_count("default/a"), 1);
    }

    #[tokio::test]
    async fn recently_deleted_requeues_after_a_minute() {
        let harness = Harness::new();
        harness
            .fake
            .fail_always("CreateQueue", ProviderErrorKind::RecentlyDeleted);
        let mut owners = MockOwnerStore::new();
        owners
            .expect_patch_status()
            .withf(|_, _, status| status.phase == NodeTemplatePhase::Pending)
            .returning(|_, _, _| Ok(()));

        let ctx = harness.context(owners);
        let action = reconcile(Arc::new(template("a", true)), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert_eq!(harness.fake.calls("CreateQueue"), 1);
    }

    #[tokio::test]
    async fn deletion_with_other_owners_only_releases_finalizer() {
        let harness = Harness::new();
        let mut owners = MockOwnerStore::new();
        owners
            .expect_list_templates()
            .returning(|| Ok(vec![deleting("a"), template("b", true)]));
        owners.expect_patch_status().returning(|_, _, _| Ok(()));
        owners
            .expect_remove_finalizer()
            .withf(|ns, name| ns == "default" && name == "a")
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = harness.context(owners);
        let action = reconcile(Arc::new(deleting("a")), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(harness.fake.calls("ListRules"), 0);
        assert_eq!(harness.fake.calls("DeleteQueue"), 0);
        assert!(harness.events.is_empty());
    }

    #[tokio::test]
    async fn deleting_last_owner_tears_down_then_releases_finalizer() {
        let harness = Harness::new();
        let settings = Settings::new("prod").unwrap();
        InfrastructureManager::new(&settings, harness.fake.clone(), harness.fake.clone())
            .ensure()
            .await
            .unwrap();

        let mut owners = MockOwnerStore::new();
        owners
            .expect_list_templates()
            .returning(|| Ok(vec![deleting("a")]));
        owners.expect_patch_status().returning(|_, _, _| Ok(()));
        owners
            .expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = harness.context(owners);
        reconcile(Arc::new(deleting("a")), ctx).await.unwrap();

        assert_eq!(harness.fake.calls("DeleteQueue"), 1);
        assert_eq!(harness.fake.calls("DeleteRule"), 4);
        assert_eq!(harness.events.calls(reasons::INFRASTRUCTURE_DELETED), 1);
    }

    #[tokio::test]
    async fn failed_teardown_keeps_finalizer() {
        let harness = Harness::new();
        harness
            .fake
            .fail_always("ListRules", ProviderErrorKind::PermissionDenied);
        let mut owners = MockOwnerStore::new();
        owners
            .expect_list_templates()
            .returning(|| Ok(vec![deleting("a")]));
        owners.expect_patch_status().returning(|_, _, _| Ok(()));
        owners.expect_remove_finalizer().never();

        let ctx = harness.context(owners);
        assert!(reconcile(Arc::new(deleting("a")), ctx).await.is_err());
    }

    #[tokio::test]
    async fn deletion_without_finalizer_is_noop() {
        let harness = Harness::new();
        let mut owners = MockOwnerStore::new();
        owners.expect_list_templates().never();
        owners.expect_remove_finalizer().never();

        let mut t = deleting("a");
        t.metadata.finalizers = None;
        let ctx = harness.context(owners);
        let action = reconcile(Arc::new(t), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn disabled_interruption_handling_skips_infrastructure() {
        let mut owners = MockOwnerStore::new();
        owners.expect_add_finalizer().never();
        owners.expect_patch_status().returning(|_, _, _| Ok(()));
        let ctx = Arc::new(Context::new(
            Arc::new(owners),
            None,
            Arc::new(RecordingEventPublisher::new()),
            Duration::from_secs(60),
        ));

        let action = reconcile(Arc::new(template("a", false)), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(7), Duration::from_secs(300));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn success_resets_backoff() {
        let ctx = Context::new(
            Arc::new(MockOwnerStore::new()),
            None,
            Arc::new(RecordingEventPublisher::new()),
            Duration::from_secs(60),
        );
        assert_eq!(ctx.next_backoff("default/a"), Duration::from_secs(5));
        assert_eq!(ctx.next_backoff("default/a"), Duration::from_secs(10));
        ctx.reset_backoff("default/a");
        assert_eq!(ctx.failure_count("default/a"), 0);
        assert_eq!(ctx.next_backoff("default/a"), Duration::from_secs(5));
    }
}
