use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use landing_storage::Database;

const RETENTION_DAYS: i64 = 30;
const BATCH_LIMIT: i64 = 500;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Daily retention sweep over the analytics event log.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
}

/// Totals reported by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: u64,
    pub batches: u32,
    pub busy: bool,
}

impl MaintenanceWorker {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background. The first sweep runs at startup.
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
                error!(stage = "storage", error = %err, "analytics sweep failed");
            }
        }
    }

    /// Deletes events older than the retention window, at most
    /// `BATCH_LIMIT` rows per statement, until nothing expired remains.
    pub async fn run_once(&self) -> Result<SweepReport, MaintenanceError> {
        let threshold = (self.clock)() - ChronoDuration::days(RETENTION_DAYS);
        let analytics = self.database.analytics();
        let mut report = SweepReport::default();

        loop {
            match analytics
                .delete_older_than_batch(threshold, BATCH_LIMIT)
                .await
            {
                Ok(0) => break,
                Ok(deleted) => {
                    report.deleted += deleted;
                    report.batches += 1;
                    counter!("analytics_ttl_deleted_total").increment(deleted);
                }
                Err(err) if is_sqlite_busy(&err) => {
                    report.busy = true;
                    counter!("db_busy_total", "op" => "ttl").increment(1);
                    warn!(stage = "storage", error = %err, "analytics sweep hit busy timeout");
                    break;
                }
                Err(err) => return Err(MaintenanceError::TtlDelete { source: err }),
            }
        }

        info!(
            stage = "storage",
            table = "analytics_events",
            deleted = report.deleted,
            batches = report.batches,
            busy = report.busy,
            threshold = %threshold.to_rfc3339(),
            "analytics sweep completed"
        );
        Ok(report)
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired analytics events")]
    TtlDelete {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
