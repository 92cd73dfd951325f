//! SQLite bootstrap: open, configure and migrate the attendance database.
//!
//! Every returned connection has `foreign_keys=ON` (capture deletion relies
//! on cascades) and all migrations applied. Schema version is tracked in
//! `PRAGMA user_version`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("0001_init.sql"),
}];

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion { db_version: u32, latest_supported: u32 },
}

/// Latest schema version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Open (creating if needed) the database file and apply pending migrations.
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection, StoreError> {
    let path = path.as_ref();
    let started_at = Instant::now();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let mut conn = Connection::open(path)?;
    bootstrap(&mut conn)?;

    tracing::info!(
        path = %path.display(),
        schema = latest_version(),
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "database opened"
    );
    Ok(conn)
}

/// Open a private in-memory database with the full schema.
pub fn open_db_in_memory() -> Result<Connection, StoreError> {
    let mut conn = Connection::open_in_memory()?;
    bootstrap(&mut conn)?;
    Ok(conn)
}

/// Current time as stored in `TEXT` timestamp columns.
pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp column, reporting failures against `idx`.
pub(crate) fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bootstrap(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    apply_migrations(conn)
}

fn apply_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let current: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let latest = latest_version();

    if current > latest {
        return Err(StoreError::UnsupportedSchemaVersion {
            db_version: current,
            latest_supported: latest,
        });
    }
    if current == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tx.execute_batch(migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
        tracing::info!(version = migration.version, "applied schema migration");
    }
    tx.commit()?;
    Ok(())
}
