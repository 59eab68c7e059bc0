//! In-memory implementation of [`QuotaStore`].
//!
//! Holds profile rows in a concurrent map and records every write it accepts. Fetch and
//! per-profile write failures can be injected, and writes can be slowed down, so that
//! reconciliation and scheduling behaviour can be exercised without a database.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{QuotaStore, StoreError};
use crate::types::{QuotaIncrement, UserId, UserQuotaRecord};

/// A profile row: the projected quota columns plus the feature flag.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProfile {
    pub record: UserQuotaRecord,
    pub auto_scraper_enabled: bool,
}

/// A write accepted by the store, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Disable(UserId),
    Increment(UserId, QuotaIncrement),
}

impl StoreWrite {
    pub fn user_id(&self) -> &UserId {
        match self {
            StoreWrite::Disable(id) | StoreWrite::Increment(id, _) => id,
        }
    }
}

#[derive(Default)]
struct Inner {
    profiles: DashMap<UserId, StoredProfile>,
    failing_writes: DashMap<UserId, String>,
    fetch_failure: Mutex<Option<String>>,
    write_delay: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
    writes: Mutex<Vec<StoreWrite>>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile row.
    pub fn insert(&self, record: UserQuotaRecord, auto_scraper_enabled: bool) {
        self.inner.profiles.insert(
            record.id.clone(),
            StoredProfile {
                record,
                auto_scraper_enabled,
            },
        );
    }

    pub fn profile(&self, id: &UserId) -> Option<StoredProfile> {
        self.inner.profiles.get(id).map(|p| p.value().clone())
    }

    /// Make every write to `id` fail with `message` until cleared.
    pub fn fail_writes_for(&self, id: &UserId, message: impl Into<String>) {
        self.inner.failing_writes.insert(id.clone(), message.into());
    }

    pub fn clear_write_failures(&self) {
        self.inner.failing_writes.clear();
    }

    /// Make candidate fetches fail with `message`, or succeed again with `None`.
    pub fn set_fetch_failure(&self, message: Option<String>) {
        *self.inner.fetch_failure.lock() = message;
    }

    /// Delay every write by `delay` before applying it.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.inner.write_delay.lock() = delay;
    }

    /// Number of candidate fetches served, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Writes accepted so far, in application order.
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.inner.writes.lock().clone()
    }

    /// Ids of profiles that received at least one accepted write.
    pub fn written_ids(&self) -> HashSet<UserId> {
        self.inner.writes.lock().iter().map(|w| w.user_id().clone()).collect()
    }

    async fn before_write(&self, id: &UserId) -> Result<(), StoreError> {
        let delay = *self.inner.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.inner.failing_writes.get(id) {
            return Err(StoreError::Unavailable {
                message: message.value().clone(),
            });
        }
        if !self.inner.profiles.contains_key(id) {
            return Err(StoreError::NotFound { id: id.clone() });
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for InMemoryStore {
    async fn fetch_candidates(&self) -> Result<Vec<UserQuotaRecord>, StoreError> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.inner.fetch_failure.lock().clone() {
            return Err(StoreError::Unavailable { message });
        }

        let mut records: Vec<UserQuotaRecord> = self
            .inner
            .profiles
            .iter()
            .filter(|p| p.auto_scraper_enabled)
            .map(|p| p.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn disable_auto_scraper(&self, id: &UserId) -> Result<(), StoreError> {
        self.before_write(id).await?;

        match self.inner.profiles.get_mut(id) {
            Some(mut profile) => profile.auto_scraper_enabled = false,
            None => return Err(StoreError::NotFound { id: id.clone() }),
        }
        self.inner.writes.lock().push(StoreWrite::Disable(id.clone()));
        Ok(())
    }

    async fn record_increment(&self, id: &UserId, increment: &QuotaIncrement) -> Result<(), StoreError> {
        self.before_write(id).await?;

        match self.inner.profiles.get_mut(id) {
            Some(mut profile) => {
                profile.record.today_applications_count = increment.today_applications_count;
                profile.record.application_count = increment.application_count;
                profile.record.last_application_date = Some(increment.last_application_date);
            }
            None => return Err(StoreError::NotFound { id: id.clone() }),
        }
        self.inner
            .writes
            .lock()
            .push(StoreWrite::Increment(id.clone(), increment.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionTier;
    use chrono::Utc;

    fn record(id: &str) -> UserQuotaRecord {
        UserQuotaRecord {
            id: UserId::from(id),
            email: Some(format!("{id}@example.com")),
            subscription_tier: SubscriptionTier::Free,
            today_applications_count: 0,
            last_application_date: None,
            application_count: 0,
        }
    }

    #[tokio::test]
    async fn test_fetch_only_returns_enabled_profiles() {
        let store = InMemoryStore::new();
        store.insert(record("b"), true);
        store.insert(record("a"), true);
        store.insert(record("c"), false);

        let ids: Vec<String> = store
            .fetch_candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_disable_removes_profile_from_candidates() {
        let store = InMemoryStore::new();
        store.insert(record("a"), true);

        store.disable_auto_scraper(&UserId::from("a")).await.unwrap();

        assert!(store.fetch_candidates().await.unwrap().is_empty());
        assert_eq!(store.writes(), vec![StoreWrite::Disable(UserId::from("a"))]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryStore::new();
        store.insert(record("a"), true);
        store.fail_writes_for(&UserId::from("a"), "row locked");
        store.set_fetch_failure(Some("connection refused".to_string()));

        assert!(matches!(
            store.fetch_candidates().await,
            Err(StoreError::Unavailable { .. })
        ));
        let increment = QuotaIncrement {
            today_applications_count: 1,
            application_count: 1,
            last_application_date: Utc::now(),
        };
        assert!(store.record_increment(&UserId::from("a"), &increment).await.is_err());
        assert!(matches!(
            store.disable_auto_scraper(&UserId::from("missing")).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.writes().is_empty());
        assert_eq!(store.profile(&UserId::from("a")).unwrap().record.application_count, 0);
    }
}
