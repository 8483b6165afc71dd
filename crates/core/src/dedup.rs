use std::{collections::HashMap, error::Error as StdError, sync::Mutex, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DedupKey;

/// Default retention for dedup entries; covers the retry windows of every
/// supported gateway.
pub const DEFAULT_DEDUP_RETENTION: Duration = Duration::from_secs(72 * 60 * 60);

/// Upper bound accepted for a dedup retention window.
pub const MAX_DEDUP_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// How long a pending claim blocks redeliveries. A claim whose holder never
/// accepted or released it (crash, cancelled request) becomes reclaimable
/// once the lease elapses, while accepted keys keep the full retention.
pub const PENDING_LEASE: Duration = Duration::from_secs(5 * 60);

/// `now + window`, or `None` when the sum leaves chrono's range.
pub fn expires_after(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    let window = ChronoDuration::from_std(window).ok()?;
    now.checked_add_signed(window)
}

/// Persisted state of a dedup key. Absence of an entry means "unseen".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupState {
    Pending,
    Accepted,
}

impl DedupState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }
}

/// Result of the atomic check-and-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The key was unseen (or expired) and is now held as pending by the caller.
    Claimed,
    /// Another delivery already holds or completed the key.
    Existing(DedupState),
}

/// Failure reported by a dedup store backend.
#[derive(Debug, Error)]
#[error("dedup store failure: {0}")]
pub struct StoreError(#[source] pub Box<dyn StdError + Send + Sync>);

impl StoreError {
    pub fn new(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

/// Port over the key-value store that remembers which deliveries were seen.
///
/// `try_claim` must be a single atomic compare-and-set: when several callers
/// race on the same key exactly one observes [`ClaimOutcome::Claimed`].
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Inserts `key` as pending unless a live entry exists. Entries whose
    /// retention elapsed, and pending entries whose [`PENDING_LEASE`]
    /// elapsed, are treated as unseen and replaced.
    async fn try_claim(
        &self,
        key: &DedupKey,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Moves a pending entry to accepted. Terminal until the entry expires.
    async fn mark_accepted(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Drops a pending entry so the key becomes unseen again.
    /// Accepted entries are left untouched.
    async fn release(&self, key: &DedupKey) -> Result<(), StoreError>;

    /// Removes entries whose retention elapsed. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: DedupState,
    expires_at: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
            && (self.state == DedupState::Accepted || self.lease_expires_at > now)
    }
}

/// Process-local [`DedupStore`] backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    entries: Mutex<HashMap<DedupKey, Entry>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a key, ignoring expiry.
    pub fn state(&self, key: &DedupKey) -> Option<DedupState> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).map(|entry| entry.state))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<DedupKey, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::new("dedup map lock poisoned"))
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn try_claim(
        &self,
        key: &DedupKey,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let (Some(expires_at), Some(lease_expires_at)) = (
            expires_after(now, retention),
            expires_after(now, PENDING_LEASE),
        ) else {
            return Err(StoreError::new("retention window is out of range"));
        };
        let mut entries = self.lock()?;
        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                return Ok(ClaimOutcome::Existing(entry.state));
            }
        }
        entries.insert(
            key.clone(),
            Entry {
                state: DedupState::Pending,
                expires_at,
                lease_expires_at,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn mark_accepted(&self, key: &DedupKey, _now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        if let Some(entry) = entries.get_mut(key) {
            entry.state = DedupState::Accepted;
        }
        Ok(())
    }

    async fn release(&self, key: &DedupKey) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        if matches!(
            entries.get(key),
            Some(Entry {
                state: DedupState::Pending,
                ..
            })
        ) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}
