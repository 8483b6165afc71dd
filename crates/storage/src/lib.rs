use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use payhook_core::{
    expires_after, ClaimOutcome, Decision, DedupKey, DedupState, DedupStore, Gateway, StoreError,
    PENDING_LEASE,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Claim retries when a conflicting row disappears between insert and read.
const CLAIM_ATTEMPTS: usize = 3;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens a pool for the provided connection string. Every pooled
    /// connection gets foreign keys, WAL, NORMAL sync and a busy timeout.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::InvalidUrl)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the dedup marker table.
    pub fn dedup(&self) -> DedupRepository {
        DedupRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the per-delivery audit log.
    pub fn delivery_log(&self) -> DeliveryLogRepository {
        DeliveryLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports its counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;

        let busy: i64 = row.try_get(0)?;
        let log_frames: i64 = row.try_get(1)?;
        let checkpointed_frames: i64 = row.try_get(2)?;
        Ok(CheckpointStats {
            busy: busy != 0,
            log_frames,
            checkpointed_frames,
        })
    }
}

/// Result row of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid sqlite connection string: {0}")]
    InvalidUrl(sqlx::Error),
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository backing [`DedupStore`] with the `dedup_entries` table.
#[derive(Clone)]
pub struct DedupRepository {
    pool: SqlitePool,
}

impl DedupRepository {
    /// Atomically inserts a pending marker unless a live one exists.
    ///
    /// A single upsert decides the race: the conflict branch only rewrites
    /// rows whose retention elapsed or pending rows whose lease elapsed, and
    /// `RETURNING` yields a row only when this caller won.
    pub async fn claim(
        &self,
        key: &DedupKey,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<ClaimOutcome, DedupError> {
        let expires_at = expires_after(now, retention).ok_or(DedupError::InvalidRetention)?;
        let lease_expires_at =
            expires_after(now, PENDING_LEASE).ok_or(DedupError::InvalidRetention)?;
        let seen_at = to_rfc3339(now);
        let expires_at = to_rfc3339(expires_at);
        let lease_expires_at = to_rfc3339(lease_expires_at);

        for _ in 0..CLAIM_ATTEMPTS {
            let claimed = sqlx::query(
                "INSERT INTO dedup_entries \
                 (dedup_key, state, first_seen_at, updated_at, expires_at, lease_expires_at) \
                 VALUES (?, 'pending', ?, ?, ?, ?) \
                 ON CONFLICT(dedup_key) DO UPDATE \
                 SET state = 'pending', \
                     first_seen_at = excluded.first_seen_at, \
                     updated_at = excluded.updated_at, \
                     expires_at = excluded.expires_at, \
                     lease_expires_at = excluded.lease_expires_at \
                 WHERE dedup_entries.expires_at <= excluded.first_seen_at \
                    OR (dedup_entries.state = 'pending' \
                        AND dedup_entries.lease_expires_at <= excluded.first_seen_at) \
                 RETURNING state",
            )
            .bind(key.as_str())
            .bind(&seen_at)
            .bind(&seen_at)
            .bind(&expires_at)
            .bind(&lease_expires_at)
            .fetch_optional(&self.pool)
            .await?;

            if claimed.is_some() {
                return Ok(ClaimOutcome::Claimed);
            }

            if let Some(state) = self.fetch_state(key).await? {
                return Ok(ClaimOutcome::Existing(state));
            }
        }

        // The holder keeps releasing and re-claiming; treat it as in flight.
        Ok(ClaimOutcome::Existing(DedupState::Pending))
    }

    /// Current state of a key, ignoring expiry.
    pub async fn fetch_state(&self, key: &DedupKey) -> Result<Option<DedupState>, DedupError> {
        let row = sqlx::query("SELECT state FROM dedup_entries WHERE dedup_key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| parse_state(row.get("state"))).transpose()
    }

    pub async fn accept(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<(), DedupError> {
        sqlx::query(
            "UPDATE dedup_entries SET state = 'accepted', updated_at = ? \
             WHERE dedup_key = ? AND state = 'pending'",
        )
        .bind(to_rfc3339(now))
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes the key only while it is still pending.
    pub async fn release_pending(&self, key: &DedupKey) -> Result<(), DedupError> {
        sqlx::query("DELETE FROM dedup_entries WHERE dedup_key = ? AND state = 'pending'")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes up to `limit` expired markers.
    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM dedup_entries WHERE rowid IN \
             (SELECT rowid FROM dedup_entries WHERE expires_at <= ? LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DedupStore for DedupRepository {
    async fn try_claim(
        &self,
        key: &DedupKey,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        self.claim(key, now, retention).await.map_err(StoreError::new)
    }

    async fn mark_accepted(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.accept(key, now).await.map_err(StoreError::new)
    }

    async fn release(&self, key: &DedupKey) -> Result<(), StoreError> {
        self.release_pending(key).await.map_err(StoreError::new)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM dedup_entries WHERE expires_at <= ?")
            .bind(to_rfc3339(now))
            .execute(&self.pool)
            .await
            .map_err(StoreError::new)?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("retention window is out of range")]
    InvalidRetention,
    #[error("unknown dedup state in database: {0}")]
    UnknownState(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn parse_state(value: String) -> Result<DedupState, DedupError> {
    match value.as_str() {
        "pending" => Ok(DedupState::Pending),
        "accepted" => Ok(DedupState::Accepted),
        _ => Err(DedupError::UnknownState(value)),
    }
}

/// Outcome recorded for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    Duplicate,
    Rejected,
    Unhandled,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::Rejected => "rejected",
            Self::Unhandled => "unhandled",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "duplicate" => Some(Self::Duplicate),
            "rejected" => Some(Self::Rejected),
            "unhandled" => Some(Self::Unhandled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl From<&Decision> for DeliveryOutcome {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::Accepted(_) => Self::Accepted,
            Decision::Duplicate(_) => Self::Duplicate,
            Decision::Unhandled(_) => Self::Unhandled,
            Decision::Rejected(_) => Self::Rejected,
            Decision::Failed { .. } => Self::Failed,
        }
    }
}

/// Data required to append a delivery log row.
#[derive(Debug, Clone)]
pub struct NewDeliveryRecord<'a> {
    pub dedup_key: Option<&'a DedupKey>,
    pub gateway: Gateway,
    pub event_type: Option<&'a str>,
    pub outcome: DeliveryOutcome,
    pub detail: Option<&'a str>,
    pub received_at: DateTime<Utc>,
}

impl<'a> NewDeliveryRecord<'a> {
    /// Builds the row describing `decision` for a delivery to `gateway`.
    pub fn from_decision(
        gateway: Gateway,
        decision: &'a Decision,
        detail: Option<&'a str>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let event = decision.event();
        Self {
            dedup_key: event.map(|event| event.dedup_key()),
            gateway,
            event_type: event.map(|event| event.event_type().as_str()),
            outcome: DeliveryOutcome::from(decision),
            detail,
            received_at,
        }
    }
}

/// Stored delivery log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub id: String,
    pub dedup_key: Option<String>,
    pub gateway: Gateway,
    pub event_type: Option<String>,
    pub outcome: DeliveryOutcome,
    pub detail: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Repository for the `delivery_log` table.
#[derive(Clone)]
pub struct DeliveryLogRepository {
    pool: SqlitePool,
}

impl DeliveryLogRepository {
    /// Appends one row and returns its generated id.
    pub async fn append(&self, record: &NewDeliveryRecord<'_>) -> Result<String, DeliveryLogError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO delivery_log \
             (id, dedup_key, gateway, event_type, outcome, detail, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record.dedup_key.map(DedupKey::as_str))
        .bind(record.gateway.as_str())
        .bind(record.event_type)
        .bind(record.outcome.as_str())
        .bind(record.detail)
        .bind(to_rfc3339(record.received_at))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Lists every delivery recorded for a dedup key, oldest first.
    pub async fn list_for_key(&self, key: &DedupKey) -> Result<Vec<DispatchRecord>, DeliveryLogError> {
        let rows = sqlx::query(
            "SELECT id, dedup_key, gateway, event_type, outcome, detail, received_at \
             FROM delivery_log WHERE dedup_key = ? ORDER BY received_at ASC, rowid ASC",
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let gateway: String = row.get("gateway");
                let outcome: String = row.get("outcome");
                Ok(DispatchRecord {
                    id: row.get("id"),
                    dedup_key: row.get("dedup_key"),
                    gateway: gateway
                        .parse()
                        .map_err(|_| DeliveryLogError::Decode(format!("gateway {gateway}")))?,
                    event_type: row.get("event_type"),
                    outcome: DeliveryOutcome::parse(&outcome)
                        .ok_or_else(|| DeliveryLogError::Decode(format!("outcome {outcome}")))?,
                    detail: row.get("detail"),
                    received_at: row.try_get("received_at")?,
                })
            })
            .collect()
    }

    /// Deletes up to `limit` rows received before `threshold`.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM delivery_log WHERE rowid IN \
             (SELECT rowid FROM delivery_log WHERE received_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Error)]
pub enum DeliveryLogError {
    #[error("failed to decode delivery log row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
