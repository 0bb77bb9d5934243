use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use landing_core::lead::{LeadStatus, ValidCapture};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

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

    /// Returns a handle for reading and upserting leads.
    pub fn leads(&self) -> LeadRepository {
        LeadRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the analytics event log.
    pub fn analytics(&self) -> AnalyticsRepository {
        AnalyticsRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Request provenance captured alongside a lead.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

/// Repository for the `leads` table.
#[derive(Clone)]
pub struct LeadRepository {
    pool: SqlitePool,
}

impl LeadRepository {
    /// Inserts a lead or bumps the existing record sharing its normalized email.
    ///
    /// The insert and the update are one statement, so concurrent first-time
    /// submissions of the same address converge on a single row. Incoming
    /// metadata is merged key by key; `null` values are dropped first because
    /// `json_patch` would treat them as deletions.
    pub async fn upsert(
        &self,
        capture: &ValidCapture,
        client: &ClientContext,
        seen_at: DateTime<Utc>,
    ) -> Result<LeadUpsert, LeadError> {
        let metadata_json = serde_json::to_string(&without_nulls(&capture.metadata))?;
        let seen_at = to_rfc3339(seen_at);

        let row = sqlx::query(
            "INSERT INTO leads \
             (id, email, original_email, source, campaign, metadata_json, ip, user_agent, referrer, first_seen_at, last_seen_at, subscription_count, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 'active') \
             ON CONFLICT(email) DO UPDATE \
             SET subscription_count = leads.subscription_count + 1, \
                 last_seen_at = excluded.last_seen_at, \
                 metadata_json = json_patch(leads.metadata_json, excluded.metadata_json), \
                 status = 'active' \
             RETURNING id, subscription_count",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&capture.email)
        .bind(&capture.original_email)
        .bind(&capture.source)
        .bind(&capture.campaign)
        .bind(&metadata_json)
        .bind(&client.ip)
        .bind(&client.user_agent)
        .bind(&client.referrer)
        .bind(&seen_at)
        .bind(&seen_at)
        .fetch_one(&self.pool)
        .await?;

        let subscription_count: i64 = row.get("subscription_count");
        Ok(LeadUpsert {
            id: row.get("id"),
            subscription_count: subscription_count as u32,
            is_new: subscription_count == 1,
        })
    }

    /// Loads a lead by its normalized email.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<LeadRecord>, LeadError> {
        let row = sqlx::query_as::<_, LeadRow>(
            "SELECT id, email, original_email, source, campaign, metadata_json, ip, user_agent, referrer, \
                    first_seen_at, last_seen_at, subscription_count, status \
               FROM leads WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LeadRow::into_record).transpose()
    }

    /// Marks a lead as unsubscribed. Returns `false` when no lead matched.
    pub async fn unsubscribe(&self, email: &str, at: DateTime<Utc>) -> Result<bool, LeadError> {
        let result = sqlx::query(
            "UPDATE leads SET status = 'unsubscribed', last_seen_at = ? WHERE email = ?",
        )
        .bind(to_rfc3339(at))
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Total and active lead counts.
    pub async fn stats(&self) -> Result<LeadStats, LeadError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0) AS active \
               FROM leads",
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let active: i64 = row.get("active");
        Ok(LeadStats {
            total_leads: total as u64,
            active_leads: active as u64,
        })
    }
}

/// Outcome of [`LeadRepository::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadUpsert {
    pub id: String,
    pub subscription_count: u32,
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadStats {
    pub total_leads: u64,
    pub active_leads: u64,
}

/// Persisted lead as read back from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadRecord {
    pub id: String,
    pub email: String,
    pub original_email: String,
    pub source: String,
    pub campaign: Option<String>,
    pub metadata: Map<String, Value>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub subscription_count: u32,
    pub status: LeadStatus,
}

#[derive(Debug, sqlx::FromRow)]
struct LeadRow {
    id: String,
    email: String,
    original_email: String,
    source: String,
    campaign: Option<String>,
    metadata_json: String,
    ip: Option<String>,
    user_agent: Option<String>,
    referrer: Option<String>,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    subscription_count: i64,
    status: String,
}

impl LeadRow {
    fn into_record(self) -> Result<LeadRecord, LeadError> {
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata_json)?;
        Ok(LeadRecord {
            id: self.id,
            email: self.email,
            original_email: self.original_email,
            source: self.source,
            campaign: self.campaign,
            metadata,
            ip: self.ip,
            user_agent: self.user_agent,
            referrer: self.referrer,
            first_seen_at: self.first_seen_at,
            last_seen_at: self.last_seen_at,
            subscription_count: self.subscription_count as u32,
            status: LeadStatus::parse(&self.status),
        })
    }
}

/// Errors that can occur while reading or writing leads.
#[derive(Debug, Error)]
pub enum LeadError {
    #[error("failed to encode or decode lead metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `analytics_events` table.
#[derive(Clone)]
pub struct AnalyticsRepository {
    pool: SqlitePool,
}

impl AnalyticsRepository {
    /// Appends one analytics event.
    pub async fn insert(&self, event: &NewAnalyticsEvent<'_>) -> Result<(), AnalyticsError> {
        let data_json = serde_json::to_string(event.data)?;
        sqlx::query(
            "INSERT INTO analytics_events (id, event_type, email_domain, data_json, ip, user_agent, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event.event_type)
        .bind(event.email_domain)
        .bind(data_json)
        .bind(event.ip)
        .bind(event.user_agent)
        .bind(to_rfc3339(event.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes up to `limit` events created before `threshold`.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM analytics_events WHERE id IN \
             (SELECT id FROM analytics_events WHERE created_at < ? ORDER BY created_at LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Counts stored events, optionally filtered by type.
    pub async fn count(&self, event_type: Option<&str>) -> Result<u64, AnalyticsError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM analytics_events WHERE (? IS NULL OR event_type = ?)",
        )
        .bind(event_type)
        .bind(event_type)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        Ok(total as u64)
    }
}

/// Analytics event to be persisted.
pub struct NewAnalyticsEvent<'a> {
    pub event_type: &'a str,
    pub email_domain: Option<&'a str>,
    pub data: &'a Value,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while writing analytics events.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("failed to encode analytics payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn without_nulls(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let value = match value {
                Value::Object(inner) => Value::Object(without_nulls(inner)),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}
