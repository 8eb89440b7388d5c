//! Unavailable-offerings cache
//!
//! Records (instance type, zone, capacity type) combinations the provider has
//! recently shown to be out of capacity, so the scheduler can skip them.
//! Entries expire after a fixed TTL; expired entries read as absent even
//! before the periodic sweep removes them. State is process-local and is
//! rebuilt from future interruptions after a restart.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::settings::DEFAULT_UNAVAILABLE_OFFERINGS_TTL;

/// Cache key: one purchasable offering
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OfferingKey {
    /// Instance shape (e.g. `m5.large`)
    pub instance_type: String,
    /// Availability zone (e.g. `us-west-2a`)
    pub zone: String,
    /// Purchase option (`spot` or `on-demand`)
    pub capacity_type: String,
}

impl OfferingKey {
    /// Build a key from its parts
    pub fn new(
        instance_type: impl Into<String>,
        zone: impl Into<String>,
        capacity_type: impl Into<String>,
    ) -> Self {
        Self {
            instance_type: instance_type.into(),
            zone: zone.into(),
            capacity_type: capacity_type.into(),
        }
    }
}

impl fmt::Display for OfferingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.capacity_type, self.instance_type, self.zone)
    }
}

/// Thread-safe TTL set of unavailable offerings
pub struct UnavailableOfferings {
    entries: DashMap<OfferingKey, Instant>,
    ttl: Duration,
    seq_num: AtomicU64,
}

impl UnavailableOfferings {
    /// Create a cache with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_UNAVAILABLE_OFFERINGS_TTL)
    }

    /// Create a cache with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            seq_num: AtomicU64::new(0),
        }
    }

    /// Mark an offering unavailable, refreshing the TTL if already present
    pub fn mark_unavailable(&self, key: OfferingKey) {
        debug!(offering = %key, ttl_secs = self.ttl.as_secs(), "Marking offering unavailable");
        self.entries.insert(key, Instant::now());
        self.seq_num.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether an offering is currently unavailable
    pub fn is_unavailable(&self, instance_type: &str, zone: &str, capacity_type: &str) -> bool {
        self.contains(&OfferingKey::new(instance_type, zone, capacity_type))
    }

    /// Whether a key is present and not yet expired
    pub fn contains(&self, key: &OfferingKey) -> bool {
        match self.entries.get(key) {
            Some(marked_at) => marked_at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Remove expired entries
    pub fn cleanup_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, marked_at| marked_at.elapsed() < ttl);
    }

    /// Monotonic counter bumped on every mark; lets readers invalidate
    /// derived caches cheaply
    pub fn seq_num(&self) -> u64 {
        self.seq_num.load(Ordering::SeqCst)
    }

    /// Number of entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for UnavailableOfferings {
    fn default() -> Self {
        Self::new()
    }
}
