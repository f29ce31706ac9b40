//! Account tier resolution.
//!
//! Authenticated partitions are mapped to a [`Tier`] through an external
//! [`TierLookup`]. A failed, missing or slow lookup degrades the caller to
//! [`Tier::Free`] and is never surfaced as a request failure.

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    config::{TierOverride, TierSettings},
    error::{AdmissionError, Result},
    identity::PartitionKey,
    metrics::Metrics,
    token::Claim,
};

/// Named quota class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Premium, Tier::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self> {
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AdmissionError::Config(format!("unknown tier: {}", s)))
    }
}

/// Account service capability: which tier does a subject pay for?
#[async_trait]
pub trait TierLookup: Send + Sync {
    /// `Ok(None)` means the subject has no account record.
    async fn lookup(&self, subject: &str) -> Result<Option<Tier>>;
}

/// Lookup backed by a fixed subject table
#[derive(Debug, Clone, Default)]
pub struct StaticTierLookup {
    tiers: HashMap<String, Tier>,
}

impl StaticTierLookup {
    pub fn new(tiers: HashMap<String, Tier>) -> Self {
        Self { tiers }
    }

    pub fn from_overrides(overrides: &[TierOverride]) -> Self {
        Self::new(
            overrides
                .iter()
                .map(|o| (o.subject.clone(), o.tier))
                .collect(),
        )
    }
}

#[async_trait]
impl TierLookup for StaticTierLookup {
    async fn lookup(&self, subject: &str) -> Result<Option<Tier>> {
        Ok(self.tiers.get(subject).copied())
    }
}

pub struct TierResolver {
    lookup: Arc<dyn TierLookup>,
    cache: Option<Cache<String, Tier>>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl TierResolver {
    pub fn new(
        lookup: Arc<dyn TierLookup>,
        settings: &TierSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cache = (settings.cache_ttl_ms > 0).then(|| {
            Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_millis(settings.cache_ttl_ms))
                .build()
        });

        Self {
            lookup,
            cache,
            timeout: Duration::from_millis(settings.lookup_timeout_ms),
            metrics,
        }
    }

    /// Resolve the tier for a partition. Never fails.
    pub async fn resolve_tier(&self, key: &PartitionKey, claim: Option<&Claim>) -> Tier {
        let Some(subject) = claim.map(|c| c.sub.as_str()).or_else(|| key.subject()) else {
            return Tier::Free;
        };
        if key.is_anonymous() {
            return Tier::Free;
        }

        let tier = match &self.cache {
            Some(cache) => {
                // Concurrent misses on one key share a single lookup; only
                // successful lookups are stored.
                let entry = cache
                    .entry(key.to_string())
                    .or_optionally_insert_with(self.fetch(subject))
                    .await;
                match entry {
                    Some(entry) => {
                        if entry.is_fresh() {
                            self.metrics.record_tier_cache_miss();
                        } else {
                            self.metrics.record_tier_cache_hit();
                        }
                        entry.into_value()
                    }
                    None => Tier::Free,
                }
            }
            None => self.fetch(subject).await.unwrap_or(Tier::Free),
        };

        self.metrics.record_resolved_tier(tier.as_str());
        tier
    }

    /// Drop a cached tier, e.g. after a billing change.
    pub async fn invalidate(&self, key: &PartitionKey) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&key.to_string()).await;
        }
    }

    async fn fetch(&self, subject: &str) -> Option<Tier> {
        match tokio::time::timeout(self.timeout, self.lookup.lookup(subject)).await {
            Ok(Ok(Some(tier))) => {
                debug!(subject, tier = %tier, "Resolved account tier");
                self.metrics.record_tier_lookup("success");
                Some(tier)
            }
            Ok(Ok(None)) => {
                warn!(subject, "No account tier found, falling back to free");
                self.metrics.record_tier_lookup("not_found");
                None
            }
            Ok(Err(e)) => {
                warn!(subject, error = %e, "Tier lookup failed, falling back to free");
                self.metrics.record_tier_lookup("error");
                None
            }
            Err(_) => {
                warn!(
                    subject,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Tier lookup timed out, falling back to free"
                );
                self.metrics.record_tier_lookup("timeout");
                None
            }
        }
    }
}
