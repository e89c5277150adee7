use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::tools::Tool;

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

/// Database handle wrapper.
///
/// `rusqlite::Connection` is `Send` but not `Sync`; share it behind a mutex.
pub struct Db {
    conn: Connection,
    path: PathBuf,
}

/// Handle shared between the updater and concurrently running jobs.
pub type SharedDb = Arc<Mutex<Db>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Skipped,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "done" => JobStatus::Done,
            "skipped" => JobStatus::Skipped,
            "failed" => JobStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
    pub item_id: Option<String>,
    pub title: Option<String>,
    pub output_dir: Option<String>,
    pub status: JobStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Version record written after a tool is replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRecord {
    pub tool: String,
    pub version: String,
    pub sha256: String,
    pub size_bytes: i64,
    pub path: String,
    pub updated_at: DateTime<Utc>,
}

impl Db {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir: {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&mut conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Insert a new job record in `queued` state.
    pub fn insert_job(&mut self, url: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            r#"
            INSERT INTO jobs (
              id, created_at, updated_at, url,
              item_id, title, output_dir,
              status, error_code, error_message
            ) VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, ?5, NULL, NULL)
            "#,
            params![id.to_string(), now, now, url, JobStatus::Queued.as_str()],
        )?;

        Ok(id)
    }

    pub fn set_job_status(&mut self, id: Uuid, status: JobStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), now],
        )?;
        Ok(())
    }

    /// Record what the extractor reported about the item.
    pub fn set_job_item(
        &mut self,
        id: Uuid,
        item_id: Option<&str>,
        title: Option<&str>,
        output_dir: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
            UPDATE jobs
            SET item_id = COALESCE(?2, item_id),
                title = COALESCE(?3, title),
                output_dir = COALESCE(?4, output_dir),
                updated_at = ?5
            WHERE id = ?1
            "#,
            params![id.to_string(), item_id, title, output_dir, now],
        )?;
        Ok(())
    }

    /// Mark a job failed with a classified error.
    pub fn set_job_error(&mut self, id: Uuid, code: &str, message: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
            UPDATE jobs
            SET error_code = ?2, error_message = ?3, status = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                id.to_string(),
                code,
                message,
                JobStatus::Failed.as_str(),
                now
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<JobRow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                Self::row_to_job,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent jobs first.
    pub fn recent_jobs(&self, limit: u32) -> Result<Vec<JobRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], Self::row_to_job)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Count jobs by status.
    pub fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn row_to_job(row: &Row) -> rusqlite::Result<JobRow> {
        let id: String = row.get(0)?;
        let created_at: String = row.get(1)?;
        let updated_at: String = row.get(2)?;
        let status: String = row.get(7)?;

        Ok(JobRow {
            id: Uuid::parse_str(&id).map_err(|_| rusqlite::Error::InvalidQuery)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            url: row.get(3)?,
            item_id: row.get(4)?,
            title: row.get(5)?,
            output_dir: row.get(6)?,
            status: JobStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?,
            error_code: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    /// Upsert the version record for a freshly installed tool.
    pub fn record_tool(
        &mut self,
        tool: Tool,
        version: &str,
        sha256: &str,
        size_bytes: u64,
        path: &Path,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
            INSERT INTO tools (tool, version, sha256, size_bytes, path, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(tool) DO UPDATE SET
              version = excluded.version,
              sha256 = excluded.sha256,
              size_bytes = excluded.size_bytes,
              path = excluded.path,
              updated_at = excluded.updated_at
            "#,
            params![
                tool.as_str(),
                version,
                sha256,
                size_bytes as i64,
                path.to_string_lossy(),
                now
            ],
        )?;
        Ok(())
    }

    pub fn tool_record(&self, tool: Tool) -> Result<Option<ToolRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT tool, version, sha256, size_bytes, path, updated_at
                FROM tools WHERE tool = ?1
                "#,
                params![tool.as_str()],
                |r| {
                    let updated_at: String = r.get(5)?;
                    Ok(ToolRecord {
                        tool: r.get(0)?,
                        version: r.get(1)?,
                        sha256: r.get(2)?,
                        size_bytes: r.get(3)?,
                        path: r.get(4)?,
                        updated_at: parse_ts(&updated_at)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

const JOB_COLUMNS: &str = "id, created_at, updated_at, url, item_id, title, output_dir, \
                           status, error_code, error_message";

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|_| rusqlite::Error::InvalidQuery)?
        .with_timezone(&Utc))
}

/// Apply migrations to bring database to current schema.
fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(anyhow!(
            "db schema version {} is newer than app supports {}",
            current_version,
            SCHEMA_VERSION
        ));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL,
          url TEXT NOT NULL,

          item_id TEXT NULL,
          title TEXT NULL,
          output_dir TEXT NULL,

          status TEXT NOT NULL,
          error_code TEXT NULL,
          error_message TEXT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tools (
          tool TEXT PRIMARY KEY,
          version TEXT NOT NULL,
          sha256 TEXT NOT NULL,
          size_bytes INTEGER NOT NULL,
          path TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}
