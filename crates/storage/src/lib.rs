use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Utc;
use snapshot::SnapshotSet;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

mod paths;

pub use paths::SqliteLocation;

pub const INIT_SQL: &str = include_str!("../../../scripts/init_db.sql");

pub const REQUIRED_TABLES: &[&str] = &["runs", "baselines", "cycles", "change_events", "incidents"];

/// One journaled cycle outcome.
#[derive(Debug, Clone, Default)]
pub struct CycleRecord<'a> {
    pub target_id: &'a str,
    pub outcome: &'a str,
    pub attempts: u32,
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub detail: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct StoredCycle {
    pub target_id: String,
    pub outcome: String,
    pub attempts: i64,
    pub added: i64,
    pub removed: i64,
    pub changed: i64,
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let location = SqliteLocation::parse(url)?;
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if location.is_memory() {
            // Every in-memory connection is its own database.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        run_init_sql(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_run(&self, run_id: &str, git_sha: Option<&str>) -> Result<()> {
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT OR REPLACE INTO runs (run_id, started_at_ms, git_sha, host) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(git_sha)
        .bind(host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Names of required tables that are missing from the database.
    pub async fn validate_required_tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&self.pool)
            .await?;
        let present: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;
        Ok(REQUIRED_TABLES
            .iter()
            .filter(|table| !present.iter().any(|name| name == *table))
            .map(|table| table.to_string())
            .collect())
    }

    /// The last committed baseline for `target_id`, or `None` before the first commit.
    pub async fn load_baseline(&self, target_id: &str) -> Result<Option<SnapshotSet>> {
        let row = sqlx::query("SELECT snapshot_json FROM baselines WHERE target_id = ?1")
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let raw: String = row.try_get("snapshot_json")?;
            SnapshotSet::from_json(&raw)
                .with_context(|| format!("corrupt baseline for target `{target_id}`"))
        })
        .transpose()
    }

    /// Replaces the baseline for `target_id` in a single statement, so readers
    /// observe either the previous snapshot or this one.
    pub async fn commit_baseline(&self, target_id: &str, snapshot: &SnapshotSet) -> Result<()> {
        let raw = snapshot.to_json()?;
        sqlx::query(
            "INSERT INTO baselines (target_id, snapshot_json, item_count, committed_at_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(target_id) DO UPDATE SET
                snapshot_json = excluded.snapshot_json,
                item_count = excluded.item_count,
                committed_at_ms = excluded.committed_at_ms",
        )
        .bind(target_id)
        .bind(raw)
        .bind(snapshot.len() as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_cycle(&self, run_id: &str, record: &CycleRecord<'_>) -> Result<()> {
        sqlx::query(
            "INSERT INTO cycles (run_id, target_id, ts_ms, outcome, attempts, added, removed, changed, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(run_id)
        .bind(record.target_id)
        .bind(Utc::now().timestamp_millis())
        .bind(record.outcome)
        .bind(i64::from(record.attempts))
        .bind(record.added as i64)
        .bind(record.removed as i64)
        .bind(record.changed as i64)
        .bind(record.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_cycles(&self, target_id: &str, limit: u32) -> Result<Vec<StoredCycle>> {
        let rows = sqlx::query(
            "SELECT target_id, outcome, attempts, added, removed, changed, detail
             FROM cycles WHERE target_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(target_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(StoredCycle {
                    target_id: row.try_get("target_id")?,
                    outcome: row.try_get("outcome")?,
                    attempts: row.try_get("attempts")?,
                    added: row.try_get("added")?,
                    removed: row.try_get("removed")?,
                    changed: row.try_get("changed")?,
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }

    pub async fn log_change_event(
        &self,
        run_id: &str,
        target_id: &str,
        kind: &str,
        item_id: &str,
        payload_json: &str,
    ) -> Result<()> {
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO change_events (run_id, target_id, ts_ms, kind, item_id, payload_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(run_id)
        .bind(target_id)
        .bind(ts_ms)
        .bind(kind)
        .bind(item_id)
        .bind(payload_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_incident(
        &self,
        run_id: &str,
        severity: &str,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO incidents (run_id, ts_ms, severity, kind, message) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(severity)
        .bind(kind)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub async fn init_sqlite(url: &str) -> Result<Store> {
    SqliteLocation::parse(url)?.ensure_parent_dir()?;
    let store = Store::connect(url).await?;
    info!(path = url, "sqlite initialized");
    Ok(store)
}

async fn run_init_sql(pool: &SqlitePool) -> Result<()> {
    for statement in INIT_SQL.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed).execute(pool).await?;
    }
    Ok(())
}
