use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

use crate::{
    cache::{CounterStore, WindowSnapshot},
    config::Quota,
    error::{AdmissionError, Result},
    identity::PartitionKey,
    metrics::Metrics,
    tier::Tier,
};

/// Provisional record of one counted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub bucket: String,
    pub window_start_ms: u64,
}

/// Outcome of a single ledger check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub admit: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the current window closes
    pub reset_after_ms: u64,
    /// Set only on deny
    pub retry_after_ms: Option<u64>,
    pub ticket: Ticket,
}

impl Decision {
    fn from_snapshot(bucket: &str, quota: Quota, snapshot: WindowSnapshot) -> Self {
        let reset_after_ms = snapshot.reset_after_ms();
        let ticket = Ticket {
            bucket: bucket.to_string(),
            window_start_ms: snapshot.window_start_ms,
        };

        // The hit was already counted, so the first request past the limit
        // is itself denied.
        if snapshot.count > quota.limit {
            Self {
                admit: false,
                limit: quota.limit,
                remaining: 0,
                reset_after_ms,
                retry_after_ms: Some(reset_after_ms),
                ticket,
            }
        } else {
            Self {
                admit: true,
                limit: quota.limit,
                remaining: quota.limit - snapshot.count,
                reset_after_ms,
                retry_after_ms: None,
                ticket,
            }
        }
    }
}

/// Owns all window counters and renders admit/deny decisions
pub struct AdmissionLedger {
    store: Box<dyn CounterStore>,
    tier_quotas: BTreeMap<Tier, Quota>,
    metrics: Arc<Metrics>,
}

impl AdmissionLedger {
    pub fn new(
        store: Box<dyn CounterStore>,
        tier_quotas: BTreeMap<Tier, Quota>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            tier_quotas,
            metrics,
        }
    }

    pub fn quota_for(&self, tier: Tier) -> Result<Quota> {
        self.tier_quotas
            .get(&tier)
            .copied()
            .ok_or_else(|| AdmissionError::Config(format!("tier quota for {} is missing", tier)))
    }

    /// Count a request for `key` against its tier quota
    pub async fn check(&self, key: &PartitionKey, tier: Tier) -> Result<Decision> {
        let quota = self.quota_for(tier)?;
        self.check_bucket(&key.to_string(), quota).await
    }

    /// Count a request against an arbitrary bucket and quota
    pub async fn check_bucket(&self, bucket: &str, quota: Quota) -> Result<Decision> {
        let snapshot = self.store.increment(bucket, quota).await.map_err(|e| {
            warn!(bucket, error = %e, "Counter store increment failed");
            self.metrics.record_store_error("increment");
            e
        })?;

        let decision = Decision::from_snapshot(bucket, quota, snapshot);
        debug!(
            bucket,
            count = snapshot.count,
            limit = quota.limit,
            admit = decision.admit,
            "Ledger check"
        );
        Ok(decision)
    }

    /// Release a counted request after a successful downstream outcome
    pub async fn rollback(&self, ticket: &Ticket) -> Result<bool> {
        let released = self
            .store
            .rollback(&ticket.bucket, ticket.window_start_ms)
            .await
            .map_err(|e| {
                self.metrics.record_store_error("rollback");
                e
            })?;
        if released {
            self.metrics.record_rollback();
        }
        Ok(released)
    }

    /// Health check for the ledger's store
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::MemoryCounterStore, config::TierSettings, utils::TimeSource};
    use async_trait::async_trait;
    use std::time::Duration;

    const HOUR_MS: u64 = 3_600_000;

    fn ledger(clock: TimeSource) -> AdmissionLedger {
        let store = MemoryCounterStore::new(Duration::from_millis(2 * HOUR_MS), clock);
        AdmissionLedger::new(
            Box::new(store),
            TierSettings::default().quotas,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_free_tier_scenario() {
        let ledger = ledger(TimeSource::manual(0));
        let key = PartitionKey::Address("198.51.100.4".parse().unwrap());

        for expected_remaining in (0..20).rev() {
            let decision = ledger.check(&key, Tier::Free).await.unwrap();
            assert!(decision.admit);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.retry_after_ms, None);
        }

        let denied = ledger.check(&key, Tier::Free).await.unwrap();
        assert!(!denied.admit);
        assert_eq!(denied.remaining, 0);
        let retry = denied.retry_after_ms.unwrap();
        assert!(retry > 0 && retry <= HOUR_MS);
    }

    #[tokio::test]
    async fn test_limit_is_inclusive() {
        let ledger = ledger(TimeSource::manual(0));
        let quota = Quota { limit: 3, window_ms: 1_000 };

        let mut admitted = Vec::new();
        for _ in 0..4 {
            admitted.push(ledger.check_bucket("k", quota).await.unwrap().admit);
        }
        assert_eq!(admitted, vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn test_window_expiry_starts_fresh_window() {
        let clock = TimeSource::manual(5_000);
        let ledger = ledger(clock.clone());
        let quota = Quota { limit: 2, window_ms: 1_000 };

        ledger.check_bucket("k", quota).await.unwrap();
        ledger.check_bucket("k", quota).await.unwrap();
        clock.advance(Duration::from_millis(400));
        let denied = ledger.check_bucket("k", quota).await.unwrap();
        assert!(!denied.admit);
        assert_eq!(denied.retry_after_ms, Some(600));

        clock.advance(Duration::from_millis(600));
        let fresh = ledger.check_bucket("k", quota).await.unwrap();
        assert!(fresh.admit);
        assert_eq!(fresh.remaining, 1);
        assert_eq!(fresh.ticket.window_start_ms, 6_000);
    }

    #[tokio::test]
    async fn test_tiers_use_their_own_quota() {
        let ledger = ledger(TimeSource::manual(0));
        let key = PartitionKey::User("ada".to_string());

        let decision = ledger.check(&key, Tier::Premium).await.unwrap();
        assert_eq!(decision.limit, 500);
        assert_eq!(decision.remaining, 499);
        assert_eq!(decision.ticket.bucket, "user:ada");
    }

    #[tokio::test]
    async fn test_rollback_frees_a_slot() {
        let ledger = ledger(TimeSource::manual(0));
        let quota = Quota { limit: 1, window_ms: 1_000 };

        let first = ledger.check_bucket("login", quota).await.unwrap();
        assert!(first.admit);
        assert!(ledger.rollback(&first.ticket).await.unwrap());

        assert!(ledger.check_bucket("login", quota).await.unwrap().admit);
        assert!(!ledger.check_bucket("login", quota).await.unwrap().admit);
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str, _quota: Quota) -> Result<WindowSnapshot> {
            Err(AdmissionError::Store("connection reset".to_string()))
        }

        async fn rollback(&self, _key: &str, _window_start_ms: u64) -> Result<bool> {
            Err(AdmissionError::Store("connection reset".to_string()))
        }

        async fn health_check(&self) -> Result<()> {
            Err(AdmissionError::Store("connection reset".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let ledger = AdmissionLedger::new(
            Box::new(BrokenStore),
            TierSettings::default().quotas,
            Arc::new(Metrics::new().unwrap()),
        );
        let key = PartitionKey::User("ada".to_string());
        assert!(ledger.check(&key, Tier::Free).await.is_err());
        assert!(ledger.health_check().await.is_err());
    }
}
