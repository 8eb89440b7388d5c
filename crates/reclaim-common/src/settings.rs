//! Runtime settings shared by the infrastructure and interruption controllers
//!
//! The operator binary builds a [`Settings`] from CLI flags and environment
//! variables; library crates only ever see this struct.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::{Error, DISCOVERY_TAG_KEY};

/// Maximum SQS queue name length
const MAX_QUEUE_NAME_LEN: usize = 80;

/// Default TTL for unavailable offerings
pub const DEFAULT_UNAVAILABLE_OFFERINGS_TTL: Duration = Duration::from_secs(180);

/// Default deadline for a single infrastructure reconcile step
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

/// Long-poll parameters for the interruption queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollSettings {
    /// Messages per receive call (provider maximum is 10)
    pub max_messages: i32,
    /// Long-poll wait
    pub wait_time: Duration,
    /// How long a received message stays invisible before redelivery
    pub visibility_timeout: Duration,
    /// Pause before retrying after a failed receive
    pub error_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(20),
            error_backoff: Duration::from_secs(10),
        }
    }
}

/// Settings for one Reclaim deployment
#[derive(Clone, Debug)]
pub struct Settings {
    /// Name of the Kubernetes cluster; scopes every provider resource
    pub cluster_name: String,
    /// Interruption queue name
    pub queue_name: String,
    /// When false, no queue or rules are managed and no queue is polled
    pub interruption_handling: bool,
    /// Deadline applied to each infrastructure ensure/teardown call
    pub reconcile_timeout: Duration,
    /// TTL of entries in the unavailable-offerings cache
    pub unavailable_offerings_ttl: Duration,
    /// Long-poll parameters
    pub poll: PollSettings,
}

impl Settings {
    /// Create settings for a cluster with defaults for everything else
    ///
    /// The queue name defaults to the cluster name made SQS-safe.
    pub fn new(cluster_name: impl Into<String>) -> Result<Self, Error> {
        let cluster_name = cluster_name.into();
        if cluster_name.trim().is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }
        Ok(Self {
            queue_name: sanitize_queue_name(&cluster_name),
            cluster_name,
            interruption_handling: true,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            unavailable_offerings_ttl: DEFAULT_UNAVAILABLE_OFFERINGS_TTL,
            poll: PollSettings::default(),
        })
    }

    /// Override the queue name
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Result<Self, Error> {
        let queue_name = queue_name.into();
        if queue_name.is_empty()
            || queue_name.len() > MAX_QUEUE_NAME_LEN
            || !queue_name.chars().all(is_queue_name_char)
        {
            return Err(Error::validation_for(
                queue_name,
                "queue name must be 1-80 characters of [A-Za-z0-9_-]",
            ));
        }
        self.queue_name = queue_name;
        Ok(self)
    }

    /// Tags applied to every provider resource owned by this cluster
    pub fn discovery_tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(DISCOVERY_TAG_KEY.to_string(), self.cluster_name.clone())])
    }
}

fn is_queue_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Map an arbitrary cluster name onto the SQS queue name alphabet
pub fn sanitize_queue_name(name: &str) -> String {
    name.chars()
        .map(|c| if is_queue_name_char(c) { c } else { '-' })
        .take(MAX_QUEUE_NAME_LEN)
        .collect()
}
