// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session and feedback persistence.
//!
//! All operations route through a retry wrapper that absorbs transient
//! SQLite contention ("database is locked"/"busy") with a fixed 1s backoff,
//! up to a configurable budget. Everything else, including "no matching
//! row", surfaces immediately. Each query maps to its own typed row struct;
//! the only dynamically composed SQL fragments come from the fixed
//! [`StatsPeriod`] allow-list, never from request input.

use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Session status: instance is live and reclaimable.
pub const STATUS_ACTIVE: i64 = 0;
/// Session status: instance has been reclaimed.
pub const STATUS_EXPIRED: i64 = 1;

/// Backoff between attempts on a contended store.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// One session row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    /// Internal numeric record id.
    pub id: i64,
    /// Server-issued opaque session token.
    pub uuid: String,
    /// Lifecycle status (0 active, 1 expired).
    pub status: i64,
    /// Name of the provisioned instance.
    pub instance_name: String,
    /// Network address of the instance (or the console-only sentinel).
    pub instance_ip: String,
    /// Generated login username.
    pub instance_username: String,
    /// Generated login password.
    pub instance_password: String,
    /// Absolute expiry timestamp, Unix seconds. Fixed at creation.
    pub instance_expiry: i64,
    /// Creation timestamp, Unix seconds.
    pub request_date: i64,
    /// Requester address.
    pub request_ip: String,
    /// Terms fingerprint the requester accepted.
    pub request_terms: String,
}

/// Fields for a new session row (always inserted as active).
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Server-issued opaque session token.
    pub uuid: String,
    /// Name of the provisioned instance.
    pub instance_name: String,
    /// Network address of the instance.
    pub instance_ip: String,
    /// Generated login username.
    pub instance_username: String,
    /// Generated login password.
    pub instance_password: String,
    /// Absolute expiry timestamp, Unix seconds.
    pub instance_expiry: i64,
    /// Creation timestamp, Unix seconds.
    pub request_date: i64,
    /// Requester address.
    pub request_ip: String,
    /// Terms fingerprint the requester accepted.
    pub request_terms: String,
}

/// Active-session row used for startup timer reconstruction.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActiveSession {
    /// Internal numeric record id.
    pub id: i64,
    /// Name of the provisioned instance.
    pub instance_name: String,
    /// Absolute expiry timestamp, Unix seconds.
    pub instance_expiry: i64,
}

/// Stored feedback for a session.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeedbackRecord {
    /// Internal record id.
    #[serde(skip_serializing)]
    pub id: i64,
    /// Rating left by the visitor.
    pub rating: Option<i64>,
    /// Contact email, if volunteered.
    pub email: Option<String>,
    /// Whether the email may be used for follow-up.
    pub email_use: Option<i64>,
    /// Free-form feedback text.
    pub feedback: Option<String>,
}

/// Feedback submission body.
#[derive(Debug, Clone, Deserialize)]
pub struct NewFeedback {
    /// Rating left by the visitor.
    pub rating: Option<i64>,
    /// Contact email, if volunteered.
    pub email: Option<String>,
    /// Whether the email may be used for follow-up.
    pub email_use: Option<i64>,
    /// Free-form feedback text.
    pub message: Option<String>,
}

/// Period filter for the statistics endpoint.
///
/// This is the complete allow-list of WHERE fragments that may be composed
/// into the statistics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsPeriod {
    /// All sessions ever recorded.
    Total,
    /// Currently active sessions.
    Current,
    /// Sessions created within the last hour.
    Hour,
    /// Sessions created within the last day.
    Day,
    /// Sessions created within the last week.
    Week,
    /// Sessions created within the last month.
    Month,
    /// Sessions created within the last year.
    Year,
}

impl StatsPeriod {
    /// Creation-time cutoff for this period, if it is time based.
    fn cutoff(&self, now: i64) -> Option<i64> {
        let hour = 3600;
        match self {
            StatsPeriod::Total | StatsPeriod::Current => None,
            StatsPeriod::Hour => Some(now - hour),
            StatsPeriod::Day => Some(now - 24 * hour),
            StatsPeriod::Week => Some(now - 7 * 24 * hour),
            StatsPeriod::Month => Some(now - (305 * 24 * hour) / 10),
            StatsPeriod::Year => Some(now - (36525 * 24 * hour) / 100),
        }
    }

    /// WHERE fragment for this period. Fixed strings only.
    fn where_clause(&self) -> &'static str {
        match self {
            StatsPeriod::Total => "",
            StatsPeriod::Current => "WHERE status = 0",
            _ => "WHERE request_date > ?",
        }
    }
}

impl FromStr for StatsPeriod {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "total" => Ok(StatsPeriod::Total),
            "current" => Ok(StatsPeriod::Current),
            "hour" => Ok(StatsPeriod::Hour),
            "day" => Ok(StatsPeriod::Day),
            "week" => Ok(StatsPeriod::Week),
            "month" => Ok(StatsPeriod::Month),
            "year" => Ok(StatsPeriod::Year),
            _ => Err(()),
        }
    }
}

/// Classify an sqlx error as transient SQLite contention.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6.
            matches!(db.code().as_deref(), Some("5") | Some("6"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Session registry over the durable store.
#[derive(Clone)]
pub struct SessionDb {
    pool: SqlitePool,
    retry_budget: u32,
}

impl SessionDb {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool, retry_budget: u32) -> Self {
        Self {
            pool,
            retry_budget: retry_budget.max(1),
        }
    }

    /// Open (creating if missing) the database file at `path` and apply the
    /// schema.
    pub async fn connect(path: &str, retry_budget: u32) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        crate::migrations::run(&pool).await?;

        Ok(Self::new(pool, retry_budget))
    }

    /// Underlying pool, for tests and maintenance queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Execute `op`, retrying on transient contention with a 1s backoff.
    ///
    /// Past the budget a typed [`Error::StorageUnavailable`] surfaces so
    /// callers can fail closed instead of blocking forever.
    async fn retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempts = 0u32;
        loop {
            match op(self.pool.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    attempts += 1;
                    if attempts >= self.retry_budget {
                        warn!(attempts, "Store still contended, giving up");
                        return Err(Error::StorageUnavailable { attempts });
                    }
                    debug!(attempts, "Store contended, backing off");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(Error::Database(e)),
            }
        }
    }

    /// Insert a new active session, returning its record id.
    pub async fn create(&self, session: &NewSession) -> Result<i64> {
        self.retry(|pool| {
            let s = session.clone();
            async move {
                let result = sqlx::query(
                    r#"
                    INSERT INTO sessions (
                        status, uuid, instance_name, instance_ip,
                        instance_username, instance_password, instance_expiry,
                        request_date, request_ip, request_terms
                    ) VALUES (0, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&s.uuid)
                .bind(&s.instance_name)
                .bind(&s.instance_ip)
                .bind(&s.instance_username)
                .bind(&s.instance_password)
                .bind(s.instance_expiry)
                .bind(s.request_date)
                .bind(&s.request_ip)
                .bind(&s.request_terms)
                .execute(&pool)
                .await?;

                Ok(result.last_insert_rowid())
            }
        })
        .await
    }

    /// Look up a session by its token.
    ///
    /// With `active_only` set, expired sessions are treated as absent.
    pub async fn get_by_token(
        &self,
        token: &str,
        active_only: bool,
    ) -> Result<Option<SessionRecord>> {
        self.retry(|pool| {
            let token = token.to_string();
            async move {
                let query = if active_only {
                    "SELECT * FROM sessions WHERE status = 0 AND uuid = ?"
                } else {
                    "SELECT * FROM sessions WHERE uuid = ?"
                };

                sqlx::query_as::<_, SessionRecord>(query)
                    .bind(&token)
                    .fetch_optional(&pool)
                    .await
            }
        })
        .await
    }

    /// Flip a session to expired. Idempotent; expiring twice is a no-op.
    pub async fn expire(&self, id: i64) -> Result<()> {
        self.retry(|pool| async move {
            sqlx::query("UPDATE sessions SET status = 1 WHERE id = ?")
                .bind(id)
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// All active sessions, oldest first. Used for startup replay.
    pub async fn list_active(&self) -> Result<Vec<ActiveSession>> {
        self.retry(|pool| async move {
            sqlx::query_as::<_, ActiveSession>(
                r#"
                SELECT id, instance_name, instance_expiry
                FROM sessions
                WHERE status = 0
                ORDER BY id
                "#,
            )
            .fetch_all(&pool)
            .await
        })
        .await
    }

    /// Number of active sessions server-wide.
    pub async fn count_active(&self) -> Result<i64> {
        self.retry(|pool| async move {
            sqlx::query_scalar::<_, i64>("SELECT count(*) FROM sessions WHERE status = 0")
                .fetch_one(&pool)
                .await
        })
        .await
    }

    /// Number of active sessions for one requester address.
    pub async fn count_active_for_ip(&self, ip: &str) -> Result<i64> {
        self.retry(|pool| {
            let ip = ip.to_string();
            async move {
                sqlx::query_scalar::<_, i64>(
                    "SELECT count(*) FROM sessions WHERE status = 0 AND request_ip = ?",
                )
                .bind(&ip)
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }

    /// Earliest expiry among active sessions, if any.
    pub async fn next_expiry(&self) -> Result<Option<i64>> {
        self.retry(|pool| async move {
            sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MIN(instance_expiry) FROM sessions WHERE status = 0",
            )
            .fetch_one(&pool)
            .await
        })
        .await
    }

    /// Stored feedback for a session, if any.
    pub async fn get_feedback(&self, session_id: i64) -> Result<Option<FeedbackRecord>> {
        self.retry(|pool| async move {
            sqlx::query_as::<_, FeedbackRecord>(
                "SELECT id, rating, email, email_use, feedback FROM feedback WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&pool)
            .await
        })
        .await
    }

    /// Create or update the feedback for a session (at most one row each).
    pub async fn record_feedback(&self, session_id: i64, feedback: &NewFeedback) -> Result<()> {
        let existing = self.get_feedback(session_id).await?;

        self.retry(|pool| {
            let f = feedback.clone();
            let existing_id = existing.as_ref().map(|e| e.id);
            async move {
                match existing_id {
                    None => {
                        sqlx::query(
                            r#"
                            INSERT INTO feedback (session_id, rating, email, email_use, feedback)
                            VALUES (?, ?, ?, ?, ?)
                            "#,
                        )
                        .bind(session_id)
                        .bind(f.rating)
                        .bind(&f.email)
                        .bind(f.email_use)
                        .bind(&f.message)
                        .execute(&pool)
                        .await?;
                    }
                    Some(_) => {
                        sqlx::query(
                            r#"
                            UPDATE feedback
                            SET rating = ?, email = ?, email_use = ?, feedback = ?
                            WHERE session_id = ?
                            "#,
                        )
                        .bind(f.rating)
                        .bind(&f.email)
                        .bind(f.email_use)
                        .bind(&f.message)
                        .bind(session_id)
                        .execute(&pool)
                        .await?;
                    }
                }
                Ok(())
            }
        })
        .await
    }

    /// Count sessions for the statistics endpoint.
    ///
    /// `unique` deduplicates by requester address; `network` restricts to
    /// addresses inside the given CIDR block (filtered in process, since the
    /// store knows nothing about networks).
    pub async fn count_sessions(
        &self,
        period: StatsPeriod,
        unique: bool,
        network: Option<IpNetwork>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let cutoff = period.cutoff(now);
        let where_clause = period.where_clause();
        let selector = if unique {
            "DISTINCT request_ip"
        } else {
            "request_ip"
        };

        match network {
            None => {
                self.retry(|pool| async move {
                    let query = format!("SELECT count({selector}) FROM sessions {where_clause}");
                    let mut q = sqlx::query_scalar::<_, i64>(&query);
                    if let Some(cutoff) = cutoff {
                        q = q.bind(cutoff);
                    }
                    q.fetch_one(&pool).await
                })
                .await
            }
            Some(network) => {
                let rows: Vec<(String,)> = self
                    .retry(|pool| async move {
                        let query = format!("SELECT {selector} FROM sessions {where_clause}");
                        let mut q = sqlx::query_as::<_, (String,)>(&query);
                        if let Some(cutoff) = cutoff {
                            q = q.bind(cutoff);
                        }
                        q.fetch_all(&pool).await
                    })
                    .await?;

                let mut seen = HashSet::new();
                let mut count = 0i64;
                for (ip,) in rows {
                    let Ok(addr) = ip.parse::<IpAddr>() else {
                        continue;
                    };
                    if !network.contains(addr) {
                        continue;
                    }
                    if unique && !seen.insert(addr) {
                        continue;
                    }
                    count += 1;
                }
                Ok(count)
            }
        }
    }
}
