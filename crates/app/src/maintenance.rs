use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use payhook_core::MAX_DEDUP_RETENTION;
use payhook_storage::Database;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

const BATCH_LIMIT: i64 = 1000;

/// Background worker purging expired dedup markers and old delivery log
/// rows, followed by a WAL checkpoint.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
    log_retention: ChronoDuration,
}

impl MaintenanceWorker {
    /// `log_retention` is capped at [`MAX_DEDUP_RETENTION`].
    pub fn new(database: Database, interval: Duration, log_retention: Duration) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
            interval,
            log_retention: log_window(log_retention),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// One cycle: dedup purge, delivery log TTL, checkpoint.
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let now = (self.clock)();

        let (dedup_deleted, dedup_busy) = self
            .delete_in_batches("dedup_entries", || async move {
                self.database
                    .dedup()
                    .delete_expired_batch(now, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "storage",
            table = "dedup_entries",
            deleted = dedup_deleted,
            busy = dedup_busy,
            "expired dedup markers purged"
        );

        let threshold = now - self.log_retention;
        let (log_deleted, log_busy) = self
            .delete_in_batches("delivery_log", || async move {
                self.database
                    .delivery_log()
                    .delete_older_than_batch(threshold, BATCH_LIMIT)
                    .await
            })
            .await?;
        info!(
            stage = "storage",
            table = "delivery_log",
            deleted = log_deleted,
            busy = log_busy,
            threshold = %threshold.to_rfc3339(),
            "delivery log TTL sweep completed"
        );

        self.run_checkpoint().await?;

        Ok(MaintenanceReport {
            dedup_deleted,
            log_deleted,
        })
    }

    async fn delete_in_batches<Fut>(
        &self,
        table: &'static str,
        mut delete_fn: impl FnMut() -> Fut,
    ) -> Result<(u64, bool), MaintenanceError>
    where
        Fut: std::future::Future<Output = Result<u64, SqlxError>>,
    {
        let mut total_deleted = 0u64;
        let mut busy = false;

        loop {
            match delete_fn().await {
                Ok(0) => break,
                Ok(batch_deleted) => {
                    total_deleted += batch_deleted;
                    counter!("dedup_purged_total", "table" => table).increment(batch_deleted);
                }
                Err(err) => {
                    if is_sqlite_busy(&err) {
                        busy = true;
                        counter!("db_busy_total", "op" => "ttl").increment(1);
                        warn!(stage = "storage", %table, error = %err, "ttl delete hit busy timeout");
                        break;
                    }

                    return Err(MaintenanceError::TtlDelete { table, source: err });
                }
            }
        }

        Ok((total_deleted, busy))
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();

        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                if stats.busy {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint could not complete"
                    );
                } else {
                    info!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
                Ok(())
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }
}

/// Rows removed by one maintenance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub dedup_deleted: u64,
    pub log_deleted: u64,
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired rows from {table}")]
    TtlDelete {
        table: &'static str,
        #[source]
        source: SqlxError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn log_window(retention: Duration) -> ChronoDuration {
    let secs = retention.min(MAX_DEDUP_RETENTION).as_secs();
    ChronoDuration::seconds(secs as i64)
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
