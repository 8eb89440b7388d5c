//! Queue service boundary and its SQS implementation

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use reclaim_common::retry::{retry_throttled, RetryConfig};
use reclaim_common::settings::PollSettings;
use reclaim_common::ProviderError;

use crate::error::{from_sdk, missing_field};

/// Queue attribute: seconds a message is retained
pub const ATTR_MESSAGE_RETENTION_PERIOD: &str = "MessageRetentionPeriod";

/// Queue attribute: access policy JSON
pub const ATTR_POLICY: &str = "Policy";

/// One message received from the queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    /// Provider-assigned message id
    pub message_id: String,
    /// Raw body
    pub body: String,
    /// Token needed to delete this delivery
    pub receipt_handle: String,
}

/// Operations against the message queue service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Resolve a queue URL by name; `NotFound` when the queue does not exist
    async fn queue_url(&self, name: &str) -> Result<String, ProviderError>;

    /// Resolve the ARN of a queue
    async fn queue_arn(&self, url: &str) -> Result<String, ProviderError>;

    /// Create a queue, returning its URL
    async fn create_queue(
        &self,
        name: &str,
        attributes: &BTreeMap<String, String>,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError>;

    /// Add or overwrite tags on an existing queue
    async fn tag_queue(
        &self,
        url: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError>;

    /// Overwrite queue attributes
    async fn set_queue_attributes(
        &self,
        url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError>;

    /// Delete a queue
    async fn delete_queue(&self, url: &str) -> Result<(), ProviderError>;

    /// Long-poll for a batch of messages
    async fn receive_messages(
        &self,
        url: &str,
        poll: &PollSettings,
    ) -> Result<Vec<QueueMessage>, ProviderError>;

    /// Delete one delivered message
    async fn delete_message(&self, url: &str, receipt_handle: &str) -> Result<(), ProviderError>;
}

/// [`QueueProvider`] backed by AWS SQS
#[derive(Clone)]
pub struct SqsQueueProvider {
    client: Client,
    retry: RetryConfig,
}

impl SqsQueueProvider {
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

#[async_trait]
impl QueueProvider for SqsQueueProvider {
    #[instrument(skip(self))]
    async fn queue_url(&self, name: &str) -> Result<String, ProviderError> {
        let output = retry_throttled(&self.retry, "GetQueueUrl", || {
            let client = self.client.clone();
            async move {
                client
                    .get_queue_url()
                    .queue_name(name)
                    .send()
                    .await
                    .map_err(|e| from_sdk("GetQueueUrl", e))
            }
        })
        .await?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| missing_field("GetQueueUrl", "QueueUrl"))
    }

    #[instrument(skip(self))]
    async fn queue_arn(&self, url: &str) -> Result<String, ProviderError> {
        let output = retry_throttled(&self.retry, "GetQueueAttributes", || {
            let client = self.client.clone();
            async move {
                client
                    .get_queue_attributes()
                    .queue_url(url)
                    .attribute_names(QueueAttributeName::QueueArn)
                    .send()
                    .await
                    .map_err(|e| from_sdk("GetQueueAttributes", e))
            }
        })
        .await?;

        output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| missing_field("GetQueueAttributes", "QueueArn"))
    }

    #[instrument(skip(self, attributes, tags))]
    async fn create_queue(
        &self,
        name: &str,
        attributes: &BTreeMap<String, String>,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError> {
        let output = retry_throttled(&self.retry, "CreateQueue", || {
            let mut request = self.client.create_queue().queue_name(name);
            for (key, value) in attributes {
                request = request.attributes(QueueAttributeName::from(key.as_str()), value);
            }
            for (key, value) in tags {
                request = request.tags(key, value);
            }
            async move { request.send().await.map_err(|e| from_sdk("CreateQueue", e)) }
        })
        .await?;

        let url = output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| missing_field("CreateQueue", "QueueUrl"))?;
        debug!(queue = %name, url = %url, "Created queue");
        Ok(url)
    }

    #[instrument(skip(self, tags))]
    async fn tag_queue(
        &self,
        url: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        retry_throttled(&self.retry, "TagQueue", || {
            let mut request = self.client.tag_queue().queue_url(url);
            for (key, value) in tags {
                request = request.tags(key, value);
            }
            async move { request.send().await.map_err(|e| from_sdk("TagQueue", e)) }
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self, attributes))]
    async fn set_queue_attributes(
        &self,
        url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        retry_throttled(&self.retry, "SetQueueAttributes", || {
            let mut request = self.client.set_queue_attributes().queue_url(url);
            for (key, value) in attributes {
                request = request.attributes(QueueAttributeName::from(key.as_str()), value);
            }
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| from_sdk("SetQueueAttributes", e))
            }
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, url: &str) -> Result<(), ProviderError> {
        retry_throttled(&self.retry, "DeleteQueue", || {
            let client = self.client.clone();
            async move {
                client
                    .delete_queue()
                    .queue_url(url)
                    .send()
                    .await
                    .map_err(|e| from_sdk("DeleteQueue", e))
            }
        })
        .await?;
        Ok(())
    }

    async fn receive_messages(
        &self,
        url: &str,
        poll: &PollSettings,
    ) -> Result<Vec<QueueMessage>, ProviderError> {
        let wait_time = i32::try_from(poll.wait_time.as_secs()).unwrap_or(20);
        let visibility_timeout = i32::try_from(poll.visibility_timeout.as_secs()).unwrap_or(20);

        let output = self
            .client
            .receive_message()
            .queue_url(url)
            .max_number_of_messages(poll.max_messages)
            .wait_time_seconds(wait_time)
            .visibility_timeout(visibility_timeout)
            .send()
            .await
            .map_err(|e| from_sdk("ReceiveMessage", e))?;

        // Messages without a receipt handle cannot be deleted; leave them to
        // the visibility timeout.
        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                Some(QueueMessage {
                    message_id: m.message_id().unwrap_or_default().to_string(),
                    body: m.body().unwrap_or_default().to_string(),
                    receipt_handle: m.receipt_handle()?.to_string(),
                })
            })
            .collect();
        Ok(messages)
    }

    async fn delete_message(&self, url: &str, receipt_handle: &str) -> Result<(), ProviderError> {
        retry_throttled(&self.retry, "DeleteMessage", || {
            let client = self.client.clone();
            async move {
                client
                    .delete_message()
                    .queue_url(url)
                    .receipt_handle(receipt_handle)
                    .send()
                    .await
                    .map_err(|e| from_sdk("DeleteMessage", e))
            }
        })
        .await?;
        Ok(())
    }
}
