use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::errors::JobError;
use crate::models::{ExportFormat, Job, JobSpec, JobStatus, StatusCounts, UserSettings};

/// Capacity limits consulted by [`JobDb::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimLimits {
    /// Maximum jobs in `{running, transferring}` across all users.
    pub global_cap: i64,
    /// Per-user cap applied when the owner has no settings row.
    pub default_user_cap: i64,
    /// Boot identifier of the claiming dispatcher.
    pub generation: String,
}

/// Field changes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub error_message: Option<String>,
    /// Object merged key-by-key into the job's `result_metadata`.
    pub metadata: Option<Value>,
}

/// The job store. Owns the persistent lifecycle record for every query;
/// all status writes go through single-row updates keyed by id, and
/// `claim_next` is the one operation that reasons across rows.
#[derive(Clone)]
pub struct JobDb {
    pool: SqlitePool,
}

impl JobDb {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating database directory {parent:?}"))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(opts)
            .await
            .context("failed to connect to sqlite")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                hashed_password TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_settings (
                user_id INTEGER PRIMARY KEY,
                export_location TEXT,
                export_type TEXT,
                max_parallel_queries INTEGER,
                ssh_hostname TEXT,
                ssh_port INTEGER,
                ssh_username TEXT,
                ssh_password TEXT,
                ssh_key TEXT,
                ssh_key_passphrase TEXT,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating user_settings table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                db_username TEXT NOT NULL,
                db_password TEXT NOT NULL,
                db_dsn TEXT NOT NULL,
                query_text TEXT NOT NULL,
                export_type TEXT,
                export_location TEXT,
                export_filename TEXT,
                ssh_hostname TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                result_metadata TEXT NOT NULL DEFAULT '{}',
                generation TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed creating queries table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queries_status ON queries(status)")
            .execute(&self.pool)
            .await
            .context("failed creating idx_queries_status")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queries_user_status ON queries(user_id, status)",
        )
        .execute(&self.pool)
        .await
        .context("failed creating idx_queries_user_status")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queries_created ON queries(created_at ASC, id ASC)",
        )
        .execute(&self.pool)
        .await
        .context("failed creating idx_queries_created")?;

        Ok(())
    }

    /// Inserts a job in `pending` and returns its assigned id.
    pub async fn enqueue(&self, spec: &JobSpec) -> Result<i64> {
        if spec.query_text.trim().is_empty() {
            return Err(JobError::validation("query_text must not be empty").into());
        }
        if spec.db_dsn.trim().is_empty() {
            return Err(JobError::validation("db_dsn must not be empty").into());
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO queries (
                user_id, db_username, db_password, db_dsn, query_text,
                export_type, export_location, export_filename, ssh_hostname,
                status, result_metadata, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', '{}', ?, ?)
            "#,
        )
        .bind(spec.user_id)
        .bind(&spec.db_username)
        .bind(&spec.db_password)
        .bind(&spec.db_dsn)
        .bind(&spec.query_text)
        .bind(spec.export_format.map(|f| f.as_str()))
        .bind(spec.export_location.clone())
        .bind(spec.export_filename.clone())
        .bind(spec.ssh_hostname.clone())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed inserting job")?;

        Ok(result.last_insert_rowid())
    }

    /// Atomically claims the next admissible job: the oldest `pending`
    /// row whose owner has a free per-user slot while the global cap
    /// is unsaturated, promoted to `queued` and stamped with this
    /// dispatcher's generation. A `queued` row already stamped with
    /// the same generation is re-claimable, so a claim interrupted
    /// before `running` is retried instead of stranded.
    ///
    /// The whole claim is one UPDATE, serialized by SQLite's writer
    /// lock, so two dispatch tasks can never count the same slot twice.
    pub async fn claim_next(&self, limits: &ClaimLimits) -> Result<Option<Job>> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            r#"
            UPDATE queries
            SET status = 'queued', generation = ?1, updated_at = ?2
            WHERE id = (
                SELECT q.id
                FROM queries q
                WHERE (q.status = 'pending'
                       OR (q.status = 'queued' AND q.generation = ?1))
                  AND (SELECT COUNT(*) FROM queries r
                       WHERE r.status IN ('running', 'transferring')) < ?3
                  AND (SELECT COUNT(*) FROM queries u
                       WHERE u.user_id = q.user_id
                         AND u.id != q.id
                         AND u.status IN ('queued', 'running', 'transferring'))
                      < COALESCE((SELECT s.max_parallel_queries
                                  FROM user_settings s
                                  WHERE s.user_id = q.user_id), ?4)
                ORDER BY q.created_at ASC, q.id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&limits.generation)
        .bind(&now)
        .bind(limits.global_cap)
        .bind(limits.default_user_cap)
        .fetch_optional(&self.pool)
        .await
        .context("failed claiming next job")?;

        row.map(row_to_job).transpose()
    }

    /// Applies a status change, validating DAG legality, bumping
    /// `updated_at`, and stamping `started_at`/`completed_at` on the
    /// first transition into `running` / a terminal state.
    pub async fn transition(
        &self,
        id: i64,
        next: JobStatus,
        update: TransitionUpdate,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await.context("failed starting transaction")?;

        let row = sqlx::query("SELECT * FROM queries WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed loading job for transition")?;
        let Some(row) = row else {
            return Err(JobError::validation(format!("job {id} not found")).into());
        };
        let job = row_to_job(row)?;

        if !job.status.can_transition_to(next) {
            return Err(JobError::validation(format!(
                "illegal transition {} -> {} for job {id}",
                job.status.as_str(),
                next.as_str()
            ))
            .into());
        }

        let now = Utc::now();
        let started_at = match (next, &job.started_at) {
            (JobStatus::Running, None) => Some(now),
            _ => job.started_at,
        };
        let completed_at = match (job.completed_at, next.is_terminal()) {
            (None, true) => Some(now),
            (existing, _) => existing,
        };
        let error_message = if next == JobStatus::Failed {
            update.error_message.clone()
        } else {
            job.error_message.clone()
        };
        let metadata = match update.metadata {
            Some(patch) => merge_metadata(job.result_metadata.clone(), patch),
            None => job.result_metadata.clone(),
        };

        sqlx::query(
            r#"
            UPDATE queries
            SET status = ?, error_message = ?, result_metadata = ?,
                updated_at = ?, started_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(next.as_str())
        .bind(&error_message)
        .bind(metadata.to_string())
        .bind(now.to_rfc3339())
        .bind(started_at.map(|t| t.to_rfc3339()))
        .bind(completed_at.map(|t| t.to_rfc3339()))
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed applying transition")?;

        tx.commit().await.context("failed committing transition")?;

        Ok(Job {
            status: next,
            error_message,
            result_metadata: metadata,
            updated_at: now,
            started_at,
            completed_at,
            ..job
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM queries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading job")?;

        row.map(row_to_job).transpose()
    }

    pub async fn list(
        &self,
        user_id: Option<i64>,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let mut query = String::from("SELECT * FROM queries WHERE 1=1");
        if user_id.is_some() {
            query.push_str(" AND user_id = ?");
        }
        if status.is_some() {
            query.push_str(" AND status = ?");
        }
        query.push_str(" ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&query);
        if let Some(user_id) = user_id {
            q = q.bind(user_id);
        }
        if let Some(status) = status {
            q = q.bind(status.as_str());
        }
        let rows = q
            .bind(limit.max(1))
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await
            .context("failed listing jobs")?;

        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed deleting job")?;
        Ok(result.rows_affected() > 0)
    }

    /// Restores a terminal job to `pending` for re-execution, clearing
    /// timestamps, error and prior result metadata. Rerunning a job
    /// that is not terminal is a validation error; the store is the
    /// enforcer here, not the UI.
    pub async fn mark_rerun(&self, id: i64) -> Result<Job> {
        let mut tx = self.pool.begin().await.context("failed starting transaction")?;

        let row = sqlx::query("SELECT * FROM queries WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed loading job for rerun")?;
        let Some(row) = row else {
            return Err(JobError::validation(format!("job {id} not found")).into());
        };
        let job = row_to_job(row)?;

        if !job.status.is_terminal() {
            return Err(JobError::validation(format!(
                "cannot rerun job {id} in non-terminal status {}",
                job.status.as_str()
            ))
            .into());
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE queries
            SET status = 'pending', error_message = NULL, result_metadata = '{}',
                generation = NULL, started_at = NULL, completed_at = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed marking rerun")?;

        tx.commit().await.context("failed committing rerun")?;

        Ok(Job {
            status: JobStatus::Pending,
            error_message: None,
            result_metadata: json!({}),
            generation: None,
            updated_at: now,
            started_at: None,
            completed_at: None,
            ..job
        })
    }

    /// Returns every orphaned non-terminal job to `pending`: rows
    /// claimed by a different (dead) dispatcher generation, and rows of
    /// the current generation whose `updated_at` went stale. Partial
    /// result metadata is replaced with a requeue reason. Idempotent.
    pub async fn reclaim_stale(
        &self,
        generation: &str,
        stale_threshold: chrono::Duration,
    ) -> Result<Vec<i64>> {
        let now = Utc::now();
        let cutoff = (now - stale_threshold).to_rfc3339();
        let reason = json!({ "requeue_reason": "requeued by recovery after restart" });

        let rows = sqlx::query(
            r#"
            UPDATE queries
            SET status = 'pending', generation = NULL, error_message = NULL,
                result_metadata = ?, started_at = NULL, completed_at = NULL,
                updated_at = ?
            WHERE status IN ('queued', 'running', 'transferring')
              AND (generation IS NULL OR generation != ? OR updated_at < ?)
            RETURNING id
            "#,
        )
        .bind(reason.to_string())
        .bind(now.to_rfc3339())
        .bind(generation)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed reclaiming stale jobs")?;

        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("id").context("missing job id"))
            .collect()
    }

    pub async fn current_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM queries GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("failed counting jobs")?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status = row.try_get::<String, _>("status")?;
            let count = row.try_get::<i64, _>("count")?;
            match JobStatus::from_str(&status) {
                Ok(JobStatus::Pending) => counts.pending = count,
                Ok(JobStatus::Queued) => counts.queued = count,
                Ok(JobStatus::Running) => counts.running = count,
                Ok(JobStatus::Transferring) => counts.transferring = count,
                Ok(JobStatus::Completed) => counts.completed = count,
                Ok(JobStatus::Failed) => counts.failed = count,
                Err(()) => {}
            }
        }
        Ok(counts)
    }

    pub async fn create_user(&self, email: &str, hashed_password: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO users (email, hashed_password) VALUES (?, ?)")
            .bind(email)
            .bind(hashed_password)
            .execute(&self.pool)
            .await
            .context("failed inserting user")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_user_settings(&self, user_id: i64) -> Result<Option<UserSettings>> {
        let row = sqlx::query("SELECT * FROM user_settings WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed loading user settings")?;

        row.map(row_to_settings).transpose()
    }

    pub async fn upsert_user_settings(&self, settings: &UserSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (
                user_id, export_location, export_type, max_parallel_queries,
                ssh_hostname, ssh_port, ssh_username, ssh_password,
                ssh_key, ssh_key_passphrase
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                export_location = excluded.export_location,
                export_type = excluded.export_type,
                max_parallel_queries = excluded.max_parallel_queries,
                ssh_hostname = excluded.ssh_hostname,
                ssh_port = excluded.ssh_port,
                ssh_username = excluded.ssh_username,
                ssh_password = excluded.ssh_password,
                ssh_key = excluded.ssh_key,
                ssh_key_passphrase = excluded.ssh_key_passphrase
            "#,
        )
        .bind(settings.user_id)
        .bind(settings.export_location.clone())
        .bind(settings.export_type.map(|f| f.as_str()))
        .bind(settings.max_parallel_queries)
        .bind(settings.ssh_hostname.clone())
        .bind(settings.ssh_port.map(i64::from))
        .bind(settings.ssh_username.clone())
        .bind(settings.ssh_password.clone())
        .bind(settings.ssh_key.clone())
        .bind(settings.ssh_key_passphrase.clone())
        .execute(&self.pool)
        .await
        .context("failed upserting user settings")?;
        Ok(())
    }

    /// Effective per-user parallelism cap, falling back to the
    /// configured default when the owner has no settings row.
    pub async fn user_parallel_limit(&self, user_id: i64, default_cap: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT max_parallel_queries FROM user_settings WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed loading user parallel limit")?;

        Ok(row
            .and_then(|r| r.try_get::<Option<i64>, _>("max_parallel_queries").ok())
            .flatten()
            .unwrap_or(default_cap))
    }
}

fn merge_metadata(mut base: Value, patch: Value) -> Value {
    match (&mut base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                base_map.insert(key, value);
            }
            base
        }
        (_, patch) => patch,
    }
}

fn row_to_job(row: SqliteRow) -> Result<Job> {
    let status =
        JobStatus::from_str(&row.try_get::<String, _>("status")?).unwrap_or(JobStatus::Pending);
    let export_format = row
        .try_get::<Option<String>, _>("export_type")?
        .and_then(|raw| ExportFormat::from_str(&raw).ok());
    let metadata = row
        .try_get::<String, _>("result_metadata")
        .map(|raw| serde_json::from_str(&raw).unwrap_or_else(|_| json!({})))
        .unwrap_or_else(|_| json!({}));

    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        db_username: row.try_get("db_username")?,
        db_password: row.try_get("db_password")?,
        db_dsn: row.try_get("db_dsn")?,
        query_text: row.try_get("query_text")?,
        export_format,
        export_location: row.try_get::<Option<String>, _>("export_location")?,
        export_filename: row.try_get::<Option<String>, _>("export_filename")?,
        ssh_hostname: row.try_get::<Option<String>, _>("ssh_hostname")?,
        status,
        error_message: row.try_get::<Option<String>, _>("error_message")?,
        result_metadata: metadata,
        generation: row.try_get::<Option<String>, _>("generation")?,
        created_at: parse_timestamp(row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(row.try_get::<String, _>("updated_at")?)?,
        started_at: parse_opt_timestamp(row.try_get::<Option<String>, _>("started_at")?)?,
        completed_at: parse_opt_timestamp(row.try_get::<Option<String>, _>("completed_at")?)?,
    })
}

fn row_to_settings(row: SqliteRow) -> Result<UserSettings> {
    let export_type = row
        .try_get::<Option<String>, _>("export_type")?
        .and_then(|raw| ExportFormat::from_str(&raw).ok());

    Ok(UserSettings {
        user_id: row.try_get("user_id")?,
        export_location: row.try_get::<Option<String>, _>("export_location")?,
        export_type,
        max_parallel_queries: row.try_get::<Option<i64>, _>("max_parallel_queries")?,
        ssh_hostname: row.try_get::<Option<String>, _>("ssh_hostname")?,
        ssh_port: row
            .try_get::<Option<i64>, _>("ssh_port")?
            .and_then(|port| u16::try_from(port).ok()),
        ssh_username: row.try_get::<Option<String>, _>("ssh_username")?,
        ssh_password: row.try_get::<Option<String>, _>("ssh_password")?,
        ssh_key: row.try_get::<Option<String>, _>("ssh_key")?,
        ssh_key_passphrase: row.try_get::<Option<String>, _>("ssh_key_passphrase")?,
    })
}

fn parse_timestamp(s: String) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(&s)
        .with_context(|| format!("invalid timestamp {s}"))?
        .with_timezone(&Utc);
    Ok(dt)
}

fn parse_opt_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_timestamp).transpose()
}
