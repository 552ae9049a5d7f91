//! SQLite ledger of deposit attempts and the drafts they created.
//!
//! A crash between draft creation and rollback would otherwise leave orphaned
//! drafts nobody knows about. `cleanup` reads unfinished attempts back from
//! here and deletes what is left.

use chrono::{DateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{fmt, io, path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_journal.sql");

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptStatus {
    Running,
    Published,
    /// Some drafts could not be published and are still pending.
    PublishIncomplete,
    /// Drafts were verified but publishing was switched off.
    Drafted,
    RolledBack,
    RollbackIncomplete,
    Cleaned,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Published => "published",
            Self::PublishIncomplete => "publish_incomplete",
            Self::Drafted => "drafted",
            Self::RolledBack => "rolled_back",
            Self::RollbackIncomplete => "rollback_incomplete",
            Self::Cleaned => "cleaned",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attempt that never reached a clean end state.
#[derive(Clone, Debug)]
pub struct UnfinishedAttempt {
    pub id: String,
    pub package_path: String,
    pub status: String,
    pub owner_pid: i64,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl UnfinishedAttempt {
    /// Whether a `running` attempt has beaten within `stale_after`.
    ///
    /// Attempts in any other state have no owner left.
    pub fn is_live(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.status != AttemptStatus::Running.as_str() {
            return false;
        }
        match (now - self.heartbeat_at).to_std() {
            Ok(age) => age < stale_after,
            // heartbeat in the future
            Err(_) => true,
        }
    }
}

#[derive(Clone)]
pub struct Journal {
    db: SqlitePool,
}

impl Journal {
    /// Open (creating if needed) the journal database and apply migrations.
    pub async fn open(url: &str) -> JournalResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let filename = options.get_filename();
        if filename != Path::new(":memory:") {
            if let Some(parent) = filename.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                    info!("Created journal directory {:?}", parent);
                }
            }
        }

        // One long-lived connection keeps `sqlite::memory:` databases alive.
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let journal = Self { db };
        journal.run_migrations().await?;
        Ok(journal)
    }

    pub async fn in_memory() -> JournalResult<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> JournalResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        debug!("Running {} journal migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&self.db).await?;
        }
        Ok(())
    }

    /// Record a new `running` attempt owned by this process.
    pub async fn begin_attempt(&self, attempt: Uuid, package: &Path) -> JournalResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO attempts (id, package_path, status, owner_pid, started_at, heartbeat_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.to_string())
        .bind(package.display().to_string())
        .bind(AttemptStatus::Running.as_str())
        .bind(i64::from(std::process::id()))
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, attempt: Uuid) -> JournalResult<()> {
        sqlx::query("UPDATE attempts SET heartbeat_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(attempt.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn record_draft(&self, attempt: Uuid, record_id: &str) -> JournalResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO drafts (attempt_id, record_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(attempt.to_string())
        .bind(record_id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn mark_deleted(&self, attempt: &str, record_id: &str) -> JournalResult<()> {
        self.settle_draft(attempt, record_id, "deleted").await
    }

    pub async fn mark_published(&self, attempt: &str, record_id: &str) -> JournalResult<()> {
        self.settle_draft(attempt, record_id, "published").await
    }

    async fn settle_draft(&self, attempt: &str, record_id: &str, state: &str) -> JournalResult<()> {
        sqlx::query("UPDATE drafts SET state = ? WHERE attempt_id = ? AND record_id = ?")
            .bind(state)
            .bind(attempt)
            .bind(record_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn finish_attempt(&self, attempt: &str, status: AttemptStatus) -> JournalResult<()> {
        sqlx::query("UPDATE attempts SET status = ?, finished_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(attempt)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Attempts still `running`, or left `rollback_incomplete` or
    /// `publish_incomplete`, oldest first.
    pub async fn unfinished_attempts(&self) -> JournalResult<Vec<UnfinishedAttempt>> {
        let rows: Vec<(String, String, String, i64, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT id, package_path, status, owner_pid, started_at, heartbeat_at \
                 FROM attempts WHERE status IN (?, ?, ?) ORDER BY started_at",
            )
            .bind(AttemptStatus::Running.as_str())
            .bind(AttemptStatus::RollbackIncomplete.as_str())
            .bind(AttemptStatus::PublishIncomplete.as_str())
            .fetch_all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, package_path, status, owner_pid, started_at, heartbeat_at)| {
                    UnfinishedAttempt {
                        id,
                        package_path,
                        status,
                        owner_pid,
                        started_at,
                        heartbeat_at,
                    }
                },
            )
            .collect())
    }

    /// Drafts of an attempt neither deleted nor published, newest first.
    pub async fn pending_drafts(&self, attempt: &str) -> JournalResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT record_id FROM drafts WHERE attempt_id = ? AND state = 'pending' \
             ORDER BY rowid DESC",
        )
        .bind(attempt)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    #[cfg(test)]
    pub async fn attempt_status(&self, attempt: &str) -> JournalResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM attempts WHERE id = ?")
            .bind(attempt)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|(status,)| status))
    }
}
