use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::{NotifyStatus, Posting, ScoredPosting, SeenRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database path error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database at {0} is locked by another run")]
    Busy(String),
}

/// Durable record of postings already processed.
///
/// `record` must be idempotent: recording an id twice is a no-op.
pub trait SeenStore {
    fn is_new(&self, posting: &Posting) -> Result<bool, StoreError>;

    /// Returns true if a new row was written.
    fn record(&self, scored: &ScoredPosting, status: NotifyStatus) -> Result<bool, StoreError>;

    fn mark_status(&self, ids: &[&str], status: NotifyStatus) -> Result<(), StoreError>;

    fn save_cover_letter(&self, id: &str, text: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub total: i64,
    pub notified: i64,
    pub failed: i64,
    pub pending: i64,
    pub skipped: i64,
    pub avg_score: f64,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path).map_err(|e| busy_or(&path, e.into()))?;
        let db = Self { conn, path };
        // Any of these can hit a file locked by another run.
        db.configure().map_err(|e| busy_or(&db.path, e))?;
        Ok(db)
    }

    fn configure(&self) -> Result<(), StoreError> {
        self.conn.busy_timeout(Duration::ZERO)?;
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        self.init()
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Self {
            conn: Connection::open_in_memory()?,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "scout") {
            proj_dirs.data_dir().join("jobs.db")
        } else {
            PathBuf::from("data/jobs.db")
        }
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS seen_postings (
                id TEXT PRIMARY KEY,
                first_seen_at TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                score INTEGER NOT NULL DEFAULT 0,
                notify_status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (notify_status IN ('pending', 'notified', 'failed', 'skipped')),
                cover_letter TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_seen_status ON seen_postings(notify_status);
            "#,
        )?;
        Ok(())
    }

    /// Holds an exclusive lock on the database file until this connection is
    /// dropped, so a second concurrent run fails instead of interleaving writes.
    pub fn lock_for_run(&self) -> Result<(), StoreError> {
        self.conn
            .pragma_update(None, "locking_mode", "EXCLUSIVE")
            .map_err(|e| busy_or(&self.path, e.into()))?;
        self.conn
            .execute_batch("BEGIN EXCLUSIVE; COMMIT;")
            .map_err(|e| busy_or(&self.path, e.into()))
    }

    pub fn get(&self, id: &str) -> Result<Option<SeenRecord>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, first_seen_at FROM seen_postings WHERE id = ?1",
                [id],
                |row| {
                    let ts: String = row.get(1)?;
                    let first_seen_at = DateTime::parse_from_rfc3339(&ts)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                        })?
                        .with_timezone(&Utc);
                    Ok(SeenRecord {
                        id: row.get(0)?,
                        first_seen_at,
                    })
                },
            )
            .optional()?)
    }

    pub fn status_of(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT notify_status FROM seen_postings WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn cover_letter_of(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT cover_letter FROM seen_postings WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM seen_postings", [], |row| row.get(0))?)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats {
            total: self.count()?,
            avg_score: self.conn.query_row(
                "SELECT COALESCE(AVG(score), 0.0) FROM seen_postings",
                [],
                |row| row.get(0),
            )?,
            ..Default::default()
        };

        let mut stmt = self
            .conn
            .prepare("SELECT notify_status, COUNT(*) FROM seen_postings GROUP BY notify_status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "notified" => stats.notified = n,
                "failed" => stats.failed = n,
                "pending" => stats.pending = n,
                "skipped" => stats.skipped = n,
                _ => {}
            }
        }
        Ok(stats)
    }
}

fn busy_or(path: &Path, err: StoreError) -> StoreError {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Busy(path.display().to_string())
        }
        other => other,
    }
}

impl SeenStore for Database {
    fn is_new(&self, posting: &Posting) -> Result<bool, StoreError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM seen_postings WHERE id = ?1",
                [&posting.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_none())
    }

    fn record(&self, scored: &ScoredPosting, status: NotifyStatus) -> Result<bool, StoreError> {
        let p = &scored.posting;
        let inserted = self.conn.execute(
            "INSERT INTO seen_postings
                (id, first_seen_at, title, company, location, url, score, notify_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO NOTHING",
            params![
                p.id,
                p.first_seen_at.to_rfc3339(),
                p.title,
                p.company,
                p.location,
                p.url,
                scored.score,
                status.as_str(),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn mark_status(&self, ids: &[&str], status: NotifyStatus) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare("UPDATE seen_postings SET notify_status = ?1 WHERE id = ?2")?;
        for id in ids {
            stmt.execute(params![status.as_str(), id])?;
        }
        Ok(())
    }

    fn save_cover_letter(&self, id: &str, text: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE seen_postings SET cover_letter = ?1 WHERE id = ?2",
            params![text, id],
        )?;
        Ok(())
    }
}
