use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stowage_ledger::entity::annotation;
use stowage_ledger::{EntityDraft, LedgerPool, QueryFilter, RetryPolicy};
use stowage_types::{Result, StowageError};

use crate::config::QuotaSection;

/// Deadline on the best-effort authoritative quota write.
const COMMIT_DEADLINE: Duration = Duration::from_secs(30);

/// Per-user, per-day usage counters. `date` scopes both counters; a date
/// change resets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub used_bytes: u64,
    pub uploads_today: u32,
    pub date: String,
}

impl QuotaRecord {
    fn empty(user_id: &str, date: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            used_bytes: 0,
            uploads_today: 0,
            date: date.to_string(),
        }
    }
}

/// Usage summary for the quota endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub uploads_today: u32,
    pub max_uploads_per_day: u32,
    pub usage_percentage: f64,
}

/// Persisted payload of a ledger quota entity.
#[derive(Debug, Serialize, Deserialize)]
struct QuotaPayload {
    user_address: String,
    used_bytes: u64,
    uploads_today: u32,
    last_updated: chrono::DateTime<Utc>,
    date: String,
}

struct CachedRecord {
    record: QuotaRecord,
    fetched_at: Instant,
}

/// Concurrent reservation/commit quota accounting over a slow source of
/// truth.
///
/// In-process counters answer immediately; a ledger-backed accountant also
/// reads through on cache expiry and schedules best-effort authoritative
/// writes on commit.
pub struct QuotaAccountant {
    section: QuotaSection,
    cache_ttl: Duration,
    entries: Mutex<HashMap<String, CachedRecord>>,
    /// `None` in single-process mode: the in-process counters are the truth.
    pool: Option<Arc<LedgerPool>>,
}

impl QuotaAccountant {
    pub fn new(section: QuotaSection, pool: Option<Arc<LedgerPool>>) -> Self {
        let cache_ttl = Duration::from_secs(section.cache_ttl_secs);
        Self {
            section,
            cache_ttl,
            entries: Mutex::new(HashMap::new()),
            pool,
        }
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedRecord>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether the presented bypass key matches the configured one.
    pub fn bypass_allowed(&self, presented: Option<&str>) -> bool {
        match (&self.section.unlimited_bypass_key, presented) {
            (Some(expected), Some(given)) => !expected.is_empty() && expected == given,
            _ => false,
        }
    }

    /// Local view of the user's record, rolled over to today. Returns `None`
    /// when absent or stale in ledger mode.
    fn fresh_local(&self, user_id: &str, today: &str) -> Option<QuotaRecord> {
        let mut entries = self.lock();
        let cached = entries.get_mut(user_id)?;
        if cached.record.date != today {
            cached.record = QuotaRecord::empty(user_id, today);
            cached.fetched_at = Instant::now();
        }
        // Ledger mode expires cached reads; memory mode is its own truth.
        if self.pool.is_some() && cached.fetched_at.elapsed() >= self.cache_ttl {
            return None;
        }
        Some(cached.record.clone())
    }

    async fn fetch_authoritative(&self, user_id: &str, today: &str) -> QuotaRecord {
        let Some(pool) = &self.pool else {
            return QuotaRecord::empty(user_id, today);
        };

        let filter = QueryFilter::for_type(annotation::TYPE_QUOTA)
            .and_string(annotation::USER_ADDRESS, user_id)
            .and_string(annotation::DATE, today)
            .with_limit(1);

        let page = pool
            .with_read("quota_read", |client| {
                let filter = filter.clone();
                async move { client.query(&filter, None).await }
            })
            .await;

        match page {
            Ok(page) => page
                .entities
                .first()
                .and_then(|e| serde_json::from_slice::<QuotaPayload>(&e.payload).ok())
                .map(|p| QuotaRecord {
                    user_id: user_id.to_string(),
                    used_bytes: p.used_bytes,
                    uploads_today: p.uploads_today,
                    date: p.date,
                })
                .unwrap_or_else(|| QuotaRecord::empty(user_id, today)),
            Err(e) => {
                // A dark ledger must not block admission; the cache and
                // in-process counters still bound usage.
                warn!(user = user_id, "quota read-through failed: {e}");
                QuotaRecord::empty(user_id, today)
            }
        }
    }

    /// Read-through record for `user_id`, consulting the authoritative store
    /// on a cold or stale cache entry.
    async fn record_for(&self, user_id: &str) -> QuotaRecord {
        let today = Self::today();
        if let Some(record) = self.fresh_local(user_id, &today) {
            return record;
        }

        let fetched = self.fetch_authoritative(user_id, &today).await;

        let mut entries = self.lock();
        let entry = entries
            .entry(user_id.to_string())
            .or_insert_with(|| CachedRecord {
                record: QuotaRecord::empty(user_id, &today),
                fetched_at: Instant::now(),
            });
        // Keep counters monotone: local commits may be ahead of the ledger.
        if entry.record.date == fetched.date {
            entry.record.used_bytes = entry.record.used_bytes.max(fetched.used_bytes);
            entry.record.uploads_today = entry.record.uploads_today.max(fetched.uploads_today);
        } else if entry.record.date != today {
            entry.record = fetched;
        }
        entry.fetched_at = Instant::now();
        entry.record.clone()
    }

    /// Admission check: deny unless `used + bytes` fits the byte ceiling and
    /// the daily upload count has room.
    pub async fn check(&self, user_id: &str, bytes: u64) -> Result<()> {
        let record = self.record_for(user_id).await;

        if record.used_bytes.saturating_add(bytes) > self.section.free_tier_max_bytes {
            return Err(StowageError::QuotaExceeded(format!(
                "storing {bytes} more bytes would exceed the {}-byte limit ({} used today)",
                self.section.free_tier_max_bytes, record.used_bytes
            )));
        }
        if record.uploads_today >= self.section.free_tier_max_uploads_per_day {
            return Err(StowageError::QuotaExceeded(format!(
                "daily upload limit of {} reached",
                self.section.free_tier_max_uploads_per_day
            )));
        }
        Ok(())
    }

    /// Record accepted usage. The in-process counter and cache update
    /// immediately; the authoritative write is scheduled and never fails the
    /// caller.
    pub async fn commit(self: &Arc<Self>, user_id: &str, bytes: u64) {
        let today = Self::today();
        let record = {
            let mut entries = self.lock();
            let entry = entries
                .entry(user_id.to_string())
                .or_insert_with(|| CachedRecord {
                    record: QuotaRecord::empty(user_id, &today),
                    fetched_at: Instant::now(),
                });
            if entry.record.date != today {
                entry.record = QuotaRecord::empty(user_id, &today);
            }
            entry.record.used_bytes += bytes;
            entry.record.uploads_today += 1;
            entry.fetched_at = Instant::now();
            entry.record.clone()
        };

        if self.pool.is_some() {
            let accountant = self.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::time::timeout(
                    COMMIT_DEADLINE,
                    accountant.write_authoritative(&record),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(StowageError::Timeout("quota commit deadline".into()))
                }) {
                    warn!(user = %record.user_id, "authoritative quota write failed: {e}");
                }
            });
        }
    }

    async fn write_authoritative(&self, record: &QuotaRecord) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let payload = serde_json::to_vec(&QuotaPayload {
            user_address: record.user_id.clone(),
            used_bytes: record.used_bytes,
            uploads_today: record.uploads_today,
            last_updated: Utc::now(),
            date: record.date.clone(),
        })?;

        let expiration_block = pool.expiration_block(1).await?;
        let draft = EntityDraft::new(payload, expiration_block)
            .with_string(annotation::TYPE, annotation::TYPE_QUOTA)
            .with_string(annotation::USER_ADDRESS, &record.user_id)
            .with_string(annotation::DATE, &record.date)
            .with_numeric(annotation::USED_BYTES, record.used_bytes)
            .with_numeric(annotation::UPLOADS_TODAY, u64::from(record.uploads_today));

        let keys = pool
            .with_write("quota_commit", RetryPolicy::single(), |client| {
                let draft = draft.clone();
                async move { client.create_entities(&[draft]).await }
            })
            .await?;
        debug!(user = %record.user_id, key = %keys[0], "quota record persisted");
        Ok(())
    }

    /// Current usage for the quota endpoint.
    pub async fn usage(&self, user_id: &str) -> QuotaStatus {
        let record = self.record_for(user_id).await;
        let max_bytes = self.section.free_tier_max_bytes;
        let usage_percentage = if max_bytes == 0 {
            0.0
        } else {
            record.used_bytes as f64 * 100.0 / max_bytes as f64
        };
        QuotaStatus {
            used_bytes: record.used_bytes,
            max_bytes,
            uploads_today: record.uploads_today,
            max_uploads_per_day: self.section.free_tier_max_uploads_per_day,
            usage_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant(max_bytes: u64, max_uploads: u32) -> Arc<QuotaAccountant> {
        Arc::new(QuotaAccountant::new(
            QuotaSection {
                free_tier_max_bytes: max_bytes,
                free_tier_max_uploads_per_day: max_uploads,
                unlimited_bypass_key: Some("secret".into()),
                cache_ttl_secs: 600,
            },
            None,
        ))
    }

    #[tokio::test]
    async fn allows_within_limits() {
        let q = accountant(1000, 10);
        q.check("u1", 500).await.unwrap();
        q.commit("u1", 500).await;
        q.check("u1", 500).await.unwrap();
    }

    #[tokio::test]
    async fn denies_byte_overrun() {
        let q = accountant(1000, 10);
        q.commit("u1", 999).await;
        let err = q.check("u1", 2).await.unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");

        // Denied check leaves counters untouched.
        let status = q.usage("u1").await;
        assert_eq!(status.used_bytes, 999);
        assert_eq!(status.uploads_today, 1);
    }

    #[tokio::test]
    async fn denies_upload_count_overrun() {
        let q = accountant(u64::MAX, 2);
        q.commit("u1", 1).await;
        q.commit("u1", 1).await;
        let err = q.check("u1", 1).await.unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn counters_are_monotone_within_a_day() {
        let q = accountant(u64::MAX, 1000);
        let mut last = 0;
        for _ in 0..5 {
            q.commit("u1", 10).await;
            let status = q.usage("u1").await;
            assert!(status.used_bytes > last);
            last = status.used_bytes;
        }
        assert_eq!(last, 50);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let q = accountant(1000, 10);
        q.commit("u1", 900).await;
        q.check("u2", 1000).await.unwrap();
    }

    #[tokio::test]
    async fn stale_date_rolls_over() {
        let q = accountant(1000, 10);
        q.commit("u1", 900).await;
        {
            // Backdate the cached record to simulate a day boundary.
            let mut entries = q.lock();
            entries.get_mut("u1").unwrap().record.date = "2000-01-01".into();
        }
        let status = q.usage("u1").await;
        assert_eq!(status.uploads_today, 0);
        assert_eq!(status.used_bytes, 0);
        q.check("u1", 1000).await.unwrap();
    }

    #[test]
    fn bypass_requires_exact_match() {
        let q = accountant(1, 1);
        assert!(q.bypass_allowed(Some("secret")));
        assert!(!q.bypass_allowed(Some("wrong")));
        assert!(!q.bypass_allowed(None));
    }

    #[tokio::test]
    async fn usage_percentage_is_computed() {
        let q = accountant(1000, 10);
        q.commit("u1", 250).await;
        let status = q.usage("u1").await;
        assert!((status.usage_percentage - 25.0).abs() < f64::EPSILON);
    }
}
