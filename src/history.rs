//! Run history - SQLite log of past backup runs
//!
//! Two tables:
//! - `runs`: one row per run (trigger, timing, counts, final phase)
//! - `repo_events`: one row per repository outcome within a run
//!
//! The database lives at `<data_dir>/repovault/history.db` by default.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::backup::RepoOutcome;
use crate::status::{RunPhase, TriggerSource};

/// A finished or in-flight run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: String,
    pub processed: u32,
    pub failed: u32,
    pub swept: Option<u32>,
    pub error: Option<String>,
}

/// One repository's result within a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoEvent {
    pub run_id: i64,
    pub repository: String,
    pub succeeded: bool,
    pub strategy: Option<String>,
    pub remote_id: Option<String>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Final numbers written when a run ends
#[derive(Debug, Clone)]
pub struct RunFinish<'a> {
    pub phase: RunPhase,
    pub processed: usize,
    pub failed: usize,
    pub swept: Option<usize>,
    pub error: Option<&'a str>,
}

pub struct RunHistory {
    conn: Mutex<Connection>,
}

const RUN_COLUMNS: &str =
    "id, trigger, started_at, finished_at, phase, processed, failed, swept, error";

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        trigger: row.get(1)?,
        started_at: parse_time(row.get(2)?)?,
        finished_at: row
            .get::<_, Option<String>>(3)?
            .map(parse_time)
            .transpose()?,
        phase: row.get(4)?,
        processed: row.get(5)?,
        failed: row.get(6)?,
        swept: row.get(7)?,
        error: row.get(8)?,
    })
}

fn parse_time(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

impl RunHistory {
    /// Open or create the history database at a specific path
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;

        info!("History database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection itself usable
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn initialize(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    trigger TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    phase TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0,
                    failed INTEGER NOT NULL DEFAULT 0,
                    swept INTEGER,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS repo_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id),
                    repository TEXT NOT NULL,
                    succeeded INTEGER NOT NULL,
                    strategy TEXT,
                    remote_id TEXT,
                    error TEXT,
                    recorded_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
                CREATE INDEX IF NOT EXISTS idx_events_run ON repo_events(run_id);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("History schema initialized");
        Ok(())
    }

    pub fn record_run_start(&self, trigger: TriggerSource, started_at: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (trigger, started_at, phase) VALUES (?1, ?2, ?3)",
            params![
                trigger.to_string(),
                started_at.to_rfc3339(),
                RunPhase::Running.to_string()
            ],
        )
        .context("Failed to record run start")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_run_finish(&self, run_id: i64, finish: &RunFinish<'_>) -> Result<()> {
        self.conn()
            .execute(
                r#"
                UPDATE runs
                SET finished_at = ?1, phase = ?2, processed = ?3, failed = ?4, swept = ?5, error = ?6
                WHERE id = ?7
                "#,
                params![
                    Utc::now().to_rfc3339(),
                    finish.phase.to_string(),
                    finish.processed as i64,
                    finish.failed as i64,
                    finish.swept.map(|s| s as i64),
                    finish.error,
                    run_id,
                ],
            )
            .context("Failed to record run finish")?;
        Ok(())
    }

    pub fn record_outcome(&self, run_id: i64, outcome: &RepoOutcome) -> Result<()> {
        self.conn()
            .execute(
                r#"
                INSERT INTO repo_events (run_id, repository, succeeded, strategy, remote_id, error, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    run_id,
                    outcome.repository,
                    outcome.succeeded(),
                    outcome.strategy,
                    outcome.remote_id,
                    outcome.error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to record repository outcome")?;
        Ok(())
    }

    /// Most recent runs first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;

        let runs = stmt
            .query_map(params![limit as i64], map_run)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read run history")?;

        Ok(runs)
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                map_run,
            )
            .optional()
            .context("Failed to read run")
    }

    pub fn outcomes_for_run(&self, run_id: i64) -> Result<Vec<RepoEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, repository, succeeded, strategy, remote_id, error, recorded_at
            FROM repo_events
            WHERE run_id = ?1
            ORDER BY id
            "#,
        )?;

        let events = stmt
            .query_map(params![run_id], |row| {
                Ok(RepoEvent {
                    run_id: row.get(0)?,
                    repository: row.get(1)?,
                    succeeded: row.get(2)?,
                    strategy: row.get(3)?,
                    remote_id: row.get(4)?,
                    error: row.get(5)?,
                    recorded_at: parse_time(row.get(6)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read repository events")?;

        Ok(events)
    }

    /// Most recent run still marked as running, if any
    pub fn last_unfinished_run(&self) -> Result<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT id FROM runs WHERE finished_at IS NULL ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query unfinished runs")
    }
}
