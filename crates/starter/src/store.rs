//! Durable storage of task results.
//!
//! Results go into a SQLite database. When the database cannot be written the runner
//! falls back to a `result.json` file in the task's log folder.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use nodeguard::exitcode::{Category, ExitCodeInfo, ExitCodeTable, HistoryEntry, TaskState};

use crate::task::result::{SubtaskResult, TaskRunResult};

pub const FALLBACK_FILE: &str = "result.json";

pub struct ResultStore {
    conn: Connection,
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|error| crate::Error::DatabaseError(format!("Invalid timestamp `{value}`: {error}")))
}

fn category_name(category: Category) -> crate::Result<String> {
    match serde_json::to_value(category)? {
        serde_json::Value::String(name) => Ok(name),
        value => Err(crate::Error::SerializationError(format!(
            "Unexpected category value {value}"
        ))),
    }
}

impl ResultStore {
    /// Opens (or creates) the result database at the given path.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> crate::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> crate::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS task_results (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name    TEXT NOT NULL,
                code         INTEGER NOT NULL,
                code_name    TEXT NOT NULL,
                description  TEXT NOT NULL,
                state        TEXT NOT NULL,
                warning      TEXT,
                copied_files INTEGER NOT NULL,
                started      TEXT NOT NULL,
                finished     TEXT NOT NULL,
                subtasks     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_history (
                result_id  INTEGER NOT NULL REFERENCES task_results(id),
                seq        INTEGER NOT NULL,
                name       TEXT NOT NULL,
                code       INTEGER NOT NULL,
                timestamp  TEXT NOT NULL,
                detail     TEXT,
                source     TEXT,
                suppressed INTEGER NOT NULL,
                PRIMARY KEY (result_id, seq)
            );

            CREATE TABLE IF NOT EXISTS exit_codes (
                name        TEXT PRIMARY KEY,
                code        INTEGER NOT NULL,
                priority    INTEGER NOT NULL,
                description TEXT NOT NULL,
                category    TEXT NOT NULL,
                unfailing   INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_task_results_name ON task_results(task_name);",
        )?;
        Ok(Self { conn })
    }

    /// Stores the result with its full history. Returns the id of the new row.
    pub fn save(&mut self, result: &TaskRunResult) -> crate::Result<i64> {
        let subtasks = serde_json::to_string(&result.subtasks)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO task_results
                (task_name, code, code_name, description, state, warning, copied_files,
                 started, finished, subtasks)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                result.task_name,
                result.code,
                result.code_name,
                result.description,
                result.state.to_string(),
                result.warning,
                result.copied_files as i64,
                format_time(&result.started),
                format_time(&result.finished),
                subtasks,
            ],
        )?;
        let id = tx.last_insert_rowid();
        {
            let mut statement = tx.prepare(
                "INSERT INTO task_history
                    (result_id, seq, name, code, timestamp, detail, source, suppressed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (seq, entry) in result.history.iter().enumerate() {
                statement.execute(params![
                    id,
                    seq as i64,
                    entry.name,
                    entry.code,
                    format_time(&entry.timestamp),
                    entry.detail,
                    entry.source,
                    entry.suppressed,
                ])?;
            }
        }
        tx.commit()?;
        log::debug!("Result of task {} stored with id {id}", result.task_name);
        Ok(id)
    }

    /// Loads the most recent result of `task_name`.
    pub fn load(&self, task_name: &str) -> crate::Result<Option<TaskRunResult>> {
        type Row = (i64, i32, String, String, String, Option<String>, i64, String, String, String);
        let row: Option<Row> = self
            .conn
            .query_row(
                "SELECT id, code, code_name, description, state, warning, copied_files,
                        started, finished, subtasks
                 FROM task_results WHERE task_name = ?1 ORDER BY id DESC LIMIT 1",
                params![task_name],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, code, code_name, description, state, warning, copied, started, finished, subtasks)) =
            row
        else {
            return Ok(None);
        };

        let mut statement = self.conn.prepare(
            "SELECT name, code, timestamp, detail, source, suppressed
             FROM task_history WHERE result_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = statement.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;
        let mut history = Vec::new();
        for row in rows {
            let (name, code, timestamp, detail, source, suppressed) = row?;
            history.push(HistoryEntry {
                name,
                code,
                timestamp: parse_time(&timestamp)?,
                detail,
                source,
                suppressed,
            });
        }

        let subtasks: Vec<SubtaskResult> = serde_json::from_str(&subtasks)?;
        Ok(Some(TaskRunResult {
            task_name: task_name.to_string(),
            code,
            code_name,
            description,
            state: state.parse::<TaskState>()?,
            warning,
            history,
            subtasks,
            copied_files: copied.max(0) as u64,
            started: parse_time(&started)?,
            finished: parse_time(&finished)?,
        }))
    }

    /// Returns the exit code table stored in the database, `None` when it is empty.
    pub fn load_exit_codes(&self) -> crate::Result<Option<ExitCodeTable>> {
        let mut statement = self.conn.prepare(
            "SELECT name, code, priority, description, category, unfailing FROM exit_codes",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (name, code, priority, description, category, unfailing) = row?;
            let category: Category =
                serde_json::from_value(serde_json::Value::String(category))?;
            entries.push(ExitCodeInfo {
                name,
                code,
                priority,
                description,
                category,
                unfailing,
            });
        }
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExitCodeTable::from_entries(entries)?))
    }

    /// Replaces the stored exit code table.
    pub fn save_exit_codes(&mut self, table: &ExitCodeTable) -> crate::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM exit_codes", [])?;
        for info in table.entries_by_priority() {
            tx.execute(
                "INSERT INTO exit_codes (name, code, priority, description, category, unfailing)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    info.name,
                    info.code,
                    info.priority,
                    info.description,
                    category_name(info.category)?,
                    info.unfailing,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Writes the result as JSON into `log_dir`.
pub fn write_fallback(result: &TaskRunResult, log_dir: &Path) -> crate::Result<PathBuf> {
    let path = log_dir.join(FALLBACK_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(result)?)?;
    Ok(path)
}

pub fn read_fallback(path: &Path) -> crate::Result<TaskRunResult> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
