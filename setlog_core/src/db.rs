//! SQLite connection setup and schema.
//!
//! One database file holds both the exercise catalog (with its search
//! indexes) and the persisted workouts, so a parse can commit both in a
//! single transaction.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS exercises (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        needs_review INTEGER NOT NULL DEFAULT 0,
        trigram_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_exercises_review
        ON exercises(needs_review, created_at)
    ",
    r"
    CREATE VIRTUAL TABLE IF NOT EXISTS exercises_fts
        USING fts5(exercise_id UNINDEXED, tokens)
    ",
    r"
    CREATE TABLE IF NOT EXISTS exercise_trigrams (
        trigram TEXT NOT NULL,
        exercise_id TEXT NOT NULL REFERENCES exercises(id) ON DELETE CASCADE,
        PRIMARY KEY (trigram, exercise_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS exercise_embeddings (
        exercise_id TEXT PRIMARY KEY REFERENCES exercises(id) ON DELETE CASCADE,
        model_id TEXT NOT NULL,
        dims INTEGER NOT NULL,
        vector BLOB NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS exercise_aliases (
        slug TEXT PRIMARY KEY,
        exercise_id TEXT NOT NULL REFERENCES exercises(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS workouts (
        id TEXT PRIMARY KEY,
        name TEXT,
        date TEXT NOT NULL,
        notes TEXT,
        created_at TEXT NOT NULL,
        last_modified_time TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS workout_blocks (
        id TEXT PRIMARY KEY,
        workout_id TEXT NOT NULL REFERENCES workouts(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        label TEXT,
        notes TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS exercise_instances (
        id TEXT PRIMARY KEY,
        block_id TEXT NOT NULL REFERENCES workout_blocks(id) ON DELETE CASCADE,
        exercise_id TEXT NOT NULL REFERENCES exercises(id),
        order_in_block INTEGER NOT NULL,
        notes TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS workout_sets (
        id TEXT PRIMARY KEY,
        exercise_instance_id TEXT NOT NULL REFERENCES exercise_instances(id) ON DELETE CASCADE,
        set_number INTEGER NOT NULL,
        reps INTEGER,
        weight REAL,
        weight_unit TEXT NOT NULL,
        duration_seconds INTEGER,
        rpe REAL
    )
    ",
];

/// Open (creating if needed) the database at `path`
pub async fn connect(
    path: &Path,
    busy_timeout: Duration,
    max_connections: u32,
) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    tracing::debug!(path = %path.display(), "Opened database");
    Ok(pool)
}

/// Create all tables and indexes; safe to call on every start
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Convenience for tests and the CLI: connect and ensure the schema exists
pub async fn open(path: &Path, busy_timeout: Duration, max_connections: u32) -> Result<SqlitePool> {
    let pool = connect(path, busy_timeout, max_connections).await?;
    init_schema(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pool = open(&temp_dir.path().join("t.db"), Duration::from_secs(1), 1)
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert!(names.contains(&"exercises".to_string()));
        assert!(names.contains(&"exercises_fts".to_string()));
        assert!(names.contains(&"exercise_aliases".to_string()));
        assert!(names.contains(&"workout_sets".to_string()));
    }
}
