//! Workout persistence.
//!
//! A parsed workout and everything the resolver staged for it are written
//! in one SQLite transaction. Staged exercises go through the same
//! insert-or-fetch as every other catalog write, and LLM choices are
//! recorded as aliases the same way. Each staged item carries a
//! provisional id; the committed id (another request's, when it got there
//! first) replaces it before any instance row references it.

use crate::catalog::{record_alias, upsert_exercise};
use crate::embedding::Embedder;
use crate::error::is_busy;
use crate::types::{
    Exercise, FormattedBlock, FormattedExercise, FormattedSet, FormattedWorkout, PendingAlias,
    PendingExercise, WeightUnit,
};
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 10;

/// Result of a committed persistence transaction
#[derive(Clone, Debug)]
pub struct PersistedWorkout {
    /// The workout as stored, with provisional exercise ids replaced
    pub workout: FormattedWorkout,
    /// Catalog rows inserted by this transaction
    pub created_exercises: Vec<Exercise>,
    /// Provisional id -> committed id, for every alias and for staged
    /// exercises another writer won
    pub id_remap: HashMap<String, String>,
}

#[derive(Clone)]
pub struct WorkoutStore {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    max_attempts: u32,
}

impl WorkoutStore {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            pool,
            embedder,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write `workout`, `pending` and `aliases` atomically.
    ///
    /// Lock contention is retried with exponential backoff; any other
    /// failure, or running out of attempts, is
    /// [`Error::PipelinePersistence`] and leaves nothing behind.
    pub async fn persist(
        &self,
        workout: &FormattedWorkout,
        pending: &[PendingExercise],
        aliases: &[PendingAlias],
    ) -> Result<PersistedWorkout> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.persist_once(workout, pending, aliases).await {
                Ok(persisted) => {
                    tracing::info!(
                        workout_id = %persisted.workout.id,
                        sets = persisted.workout.set_count(),
                        created = persisted.created_exercises.len(),
                        attempt,
                        "Persisted workout"
                    );
                    return Ok(persisted);
                }
                Err(Error::Database(e)) if is_busy(&e) && attempt < self.max_attempts => {
                    let backoff_ms = BACKOFF_BASE_MS << (attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms,
                        error = %e,
                        "Database busy, retrying transaction after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Workout transaction failed");
                    return Err(Error::PipelinePersistence(e.to_string()));
                }
            }
        }
    }

    async fn persist_once(
        &self,
        workout: &FormattedWorkout,
        pending: &[PendingExercise],
        aliases: &[PendingAlias],
    ) -> Result<PersistedWorkout> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before reading
        insert_workout_row(&mut tx, workout).await?;

        let mut created_exercises = Vec::new();
        let mut id_remap = HashMap::new();
        for staged in pending {
            let (exercise, inserted) = upsert_exercise(
                &mut tx,
                self.embedder.as_ref(),
                &staged.provisional_id,
                &staged.name,
                &staged.tags,
                true,
            )
            .await?;
            if exercise.id != staged.provisional_id {
                tracing::debug!(slug = %exercise.slug, "Staged exercise already committed elsewhere, remapping");
                id_remap.insert(staged.provisional_id.clone(), exercise.id.clone());
            }
            if inserted {
                created_exercises.push(exercise);
            }
        }

        for alias in aliases {
            let (bound, inserted) = record_alias(&mut tx, &alias.slug, &alias.exercise_id).await?;
            if !inserted && bound != alias.exercise_id {
                tracing::debug!(slug = %alias.slug, "Alias already bound elsewhere, using earlier binding");
            }
            id_remap.insert(alias.provisional_id.clone(), bound);
        }

        let mut stored = workout.clone();
        for exercise in stored.blocks.iter_mut().flat_map(|b| b.exercises.iter_mut()) {
            if let Some(committed) = id_remap.get(&exercise.exercise_id) {
                exercise.exercise_id = committed.clone();
            }
        }

        for block in &stored.blocks {
            insert_block(&mut tx, block).await?;
        }

        tx.commit().await?;
        Ok(PersistedWorkout {
            workout: stored,
            created_exercises,
            id_remap,
        })
    }

    /// Read a persisted workout back in positional order
    pub async fn load_workout(&self, id: Uuid) -> Result<Option<FormattedWorkout>> {
        let Some(row) = sqlx::query(
            "SELECT id, name, date, notes, created_at, last_modified_time FROM workouts WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let workout_id = parse_uuid(row.try_get("id")?)?;
        let block_rows = sqlx::query(
            "SELECT id, position, label, notes FROM workout_blocks WHERE workout_id = ?1 ORDER BY position",
        )
        .bind(workout_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut blocks = Vec::with_capacity(block_rows.len());
        for block_row in &block_rows {
            let block_id = parse_uuid(block_row.try_get("id")?)?;
            let position: i64 = block_row.try_get("position")?;
            blocks.push(FormattedBlock {
                id: block_id,
                workout_id,
                position: position as u32,
                label: block_row.try_get("label")?,
                notes: block_row.try_get("notes")?,
                exercises: self.load_exercises(block_id).await?,
            });
        }

        let date: String = row.try_get("date")?;
        Ok(Some(FormattedWorkout {
            id: workout_id,
            name: row.try_get("name")?,
            date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map_err(|e| Error::Other(format!("bad stored date '{date}': {e}")))?,
            notes: row.try_get("notes")?,
            created_at: parse_timestamp(row.try_get("created_at")?)?,
            last_modified_time: parse_timestamp(row.try_get("last_modified_time")?)?,
            blocks,
        }))
    }

    async fn load_exercises(&self, block_id: Uuid) -> Result<Vec<FormattedExercise>> {
        let rows = sqlx::query(
            r"
            SELECT id, exercise_id, order_in_block, notes FROM exercise_instances
            WHERE block_id = ?1 ORDER BY order_in_block
            ",
        )
        .bind(block_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut exercises = Vec::with_capacity(rows.len());
        for row in &rows {
            let instance_id = parse_uuid(row.try_get("id")?)?;
            let order: i64 = row.try_get("order_in_block")?;
            exercises.push(FormattedExercise {
                id: instance_id,
                block_id,
                exercise_id: row.try_get("exercise_id")?,
                order_in_block: order as u32,
                notes: row.try_get("notes")?,
                sets: self.load_sets(instance_id).await?,
            });
        }
        Ok(exercises)
    }

    async fn load_sets(&self, instance_id: Uuid) -> Result<Vec<FormattedSet>> {
        let rows = sqlx::query(
            r"
            SELECT id, set_number, reps, weight, weight_unit, duration_seconds, rpe
            FROM workout_sets WHERE exercise_instance_id = ?1 ORDER BY set_number
            ",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut sets = Vec::with_capacity(rows.len());
        for row in &rows {
            let set_number: i64 = row.try_get("set_number")?;
            let reps: Option<i64> = row.try_get("reps")?;
            let duration: Option<i64> = row.try_get("duration_seconds")?;
            let unit: String = row.try_get("weight_unit")?;
            sets.push(FormattedSet {
                id: parse_uuid(row.try_get("id")?)?,
                exercise_instance_id: instance_id,
                set_number: set_number as u32,
                reps: reps.map(|r| r as u32),
                weight: row.try_get("weight")?,
                weight_unit: WeightUnit::parse(&unit)
                    .ok_or_else(|| Error::Other(format!("bad stored weight unit '{unit}'")))?,
                duration_seconds: duration.map(|d| d as u32),
                rpe: row.try_get("rpe")?,
            });
        }
        Ok(sets)
    }

    pub async fn workout_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workouts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

async fn insert_workout_row(conn: &mut SqliteConnection, workout: &FormattedWorkout) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO workouts (id, name, date, notes, created_at, last_modified_time)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
    )
    .bind(workout.id.to_string())
    .bind(&workout.name)
    .bind(workout.date.format("%Y-%m-%d").to_string())
    .bind(&workout.notes)
    .bind(workout.created_at.to_rfc3339())
    .bind(workout.last_modified_time.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_block(conn: &mut SqliteConnection, block: &FormattedBlock) -> Result<()> {
    sqlx::query(
        "INSERT INTO workout_blocks (id, workout_id, position, label, notes) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(block.id.to_string())
    .bind(block.workout_id.to_string())
    .bind(i64::from(block.position))
    .bind(&block.label)
    .bind(&block.notes)
    .execute(&mut *conn)
    .await?;

    for exercise in &block.exercises {
        sqlx::query(
            r"
            INSERT INTO exercise_instances (id, block_id, exercise_id, order_in_block, notes)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(exercise.id.to_string())
        .bind(exercise.block_id.to_string())
        .bind(&exercise.exercise_id)
        .bind(i64::from(exercise.order_in_block))
        .bind(&exercise.notes)
        .execute(&mut *conn)
        .await?;

        for set in &exercise.sets {
            sqlx::query(
                r"
                INSERT INTO workout_sets
                    (id, exercise_instance_id, set_number, reps, weight, weight_unit, duration_seconds, rpe)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )
            .bind(set.id.to_string())
            .bind(set.exercise_instance_id.to_string())
            .bind(i64::from(set.set_number))
            .bind(set.reps.map(i64::from))
            .bind(set.weight)
            .bind(set.weight_unit.as_str())
            .bind(set.duration_seconds.map(i64::from))
            .bind(set.rpe)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value).map_err(|e| Error::Other(format!("bad stored id '{value}': {e}")))
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("bad stored timestamp '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::seeded_catalog;
    use crate::catalog::{ExerciseCatalog, SqliteCatalog, AUTO_CREATED_TAG};
    use crate::db;
    use crate::formatter::{format_workout, SequentialIds};
    use crate::types::{PlaceholderSet, ResolutionOutcome, ResolvedBlock, ResolvedExercise, ResolvedWorkout};
    use chrono::TimeZone;

    fn resolved(exercise_ids: &[&str], pending: Vec<PendingExercise>) -> ResolvedWorkout {
        let exercises = exercise_ids
            .iter()
            .enumerate()
            .map(|(i, id)| ResolvedExercise {
                source_name: id.to_string(),
                order_in_block: i as u32,
                notes: None,
                outcome: ResolutionOutcome {
                    exercise_id: id.to_string(),
                    strategy: None,
                    score: 0.0,
                    created: false,
                },
                sets: (1..=3)
                    .map(|n| PlaceholderSet {
                        set_number: n,
                        reps: Some(8),
                        weight: Some(60.0),
                        weight_unit: WeightUnit::Kg,
                        duration_seconds: None,
                        rpe: Some(8.5),
                    })
                    .collect(),
            })
            .collect();
        ResolvedWorkout {
            name: Some("Pull day".into()),
            date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            notes: None,
            last_modified_time: None,
            blocks: vec![ResolvedBlock {
                label: Some("Main".into()),
                notes: None,
                exercises,
            }],
            pending_exercises: pending,
            pending_aliases: Vec::new(),
        }
    }

    fn formatted(resolved: &ResolvedWorkout, seed: u128) -> FormattedWorkout {
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 18, 0, 0).unwrap();
        format_workout(resolved, &mut SequentialIds::new(seed), now).unwrap()
    }

    fn store_for(catalog: &SqliteCatalog) -> WorkoutStore {
        WorkoutStore::new(catalog.pool().clone(), catalog.embedder())
    }

    fn staged(provisional_id: &str, name: &str) -> PendingExercise {
        PendingExercise {
            provisional_id: provisional_id.into(),
            slug: crate::normalize_name(name),
            name: name.into(),
            tags: vec![AUTO_CREATED_TAG.into()],
        }
    }

    #[tokio::test]
    async fn test_persist_and_load_roundtrip() {
        let (_dir, catalog) = seeded_catalog().await;
        let chin = catalog.lookup_exact("chin-up").await.unwrap().unwrap();
        let store = store_for(&catalog);

        let workout = formatted(&resolved(&[chin.id.as_str()], vec![]), 1);
        let persisted = store.persist(&workout, &[], &[]).await.unwrap();
        assert!(persisted.created_exercises.is_empty());

        let loaded = store.load_workout(workout.id).await.unwrap().unwrap();
        assert_eq!(loaded, workout);
        assert_eq!(loaded.set_count(), 3);
        assert!(store.load_workout(Uuid::nil()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_staged_exercise_committed_with_workout() {
        let (_dir, catalog) = seeded_catalog().await;
        let store = store_for(&catalog);
        let provisional = Uuid::new_v4().to_string();

        let resolved = resolved(&[provisional.as_str()], vec![staged(&provisional, "Zercher Carry")]);
        let workout = formatted(&resolved, 1);
        let persisted = store.persist(&workout, &resolved.pending_exercises, &[]).await.unwrap();

        assert_eq!(persisted.created_exercises.len(), 1);
        let created = &persisted.created_exercises[0];
        assert_eq!(created.id, provisional);
        assert!(created.needs_review);
        assert!(persisted.id_remap.is_empty());
        assert_eq!(
            catalog.lookup_exact("zercher-carry").await.unwrap().map(|e| e.id),
            Some(provisional)
        );
    }

    #[tokio::test]
    async fn test_losing_writer_is_remapped() {
        let (_dir, catalog) = seeded_catalog().await;
        let store = store_for(&catalog);
        let winner = catalog
            .upsert_by_normalized_slug("Sandbag Shouldering", &[])
            .await
            .unwrap();

        let provisional = Uuid::new_v4().to_string();
        let resolved = resolved(
            &[provisional.as_str(), provisional.as_str()],
            vec![staged(&provisional, "sandbag shouldering")],
        );
        let persisted = store
            .persist(&formatted(&resolved, 1), &resolved.pending_exercises, &[])
            .await
            .unwrap();

        assert!(persisted.created_exercises.is_empty());
        assert_eq!(persisted.id_remap.get(&provisional), Some(&winner.id));
        let block = &persisted.workout.blocks[0];
        assert!(block.exercises.iter().all(|e| e.exercise_id == winner.id));

        let loaded = store.load_workout(persisted.workout.id).await.unwrap().unwrap();
        assert_eq!(loaded.blocks[0].exercises[0].exercise_id, winner.id);
    }

    #[tokio::test]
    async fn test_alias_binding_is_first_writer_wins() {
        let (_dir, catalog) = seeded_catalog().await;
        let store = store_for(&catalog);
        let hammer = catalog.lookup_exact("hammer-curl").await.unwrap().unwrap();
        let barbell = catalog.lookup_exact("barbell-curl").await.unwrap().unwrap();

        let bind = |provisional: &str, exercise_id: &str| PendingAlias {
            provisional_id: provisional.into(),
            slug: "curl".into(),
            exercise_id: exercise_id.into(),
        };

        let first_id = Uuid::new_v4().to_string();
        let first = resolved(&[first_id.as_str()], vec![]);
        let persisted = store
            .persist(&formatted(&first, 1), &[], &[bind(&first_id, &hammer.id)])
            .await
            .unwrap();
        assert_eq!(persisted.id_remap.get(&first_id), Some(&hammer.id));
        assert_eq!(persisted.workout.blocks[0].exercises[0].exercise_id, hammer.id);

        // A later request that picked a different exercise is bound to the first choice
        let second_id = Uuid::new_v4().to_string();
        let second = resolved(&[second_id.as_str()], vec![]);
        let persisted = store
            .persist(&formatted(&second, 100), &[], &[bind(&second_id, &barbell.id)])
            .await
            .unwrap();
        assert_eq!(persisted.id_remap.get(&second_id), Some(&hammer.id));

        let loaded = store.load_workout(persisted.workout.id).await.unwrap().unwrap();
        assert_eq!(loaded.blocks[0].exercises[0].exercise_id, hammer.id);
        assert_eq!(catalog.lookup_alias("curl").await.unwrap().map(|e| e.id), Some(hammer.id));
    }

    #[tokio::test]
    async fn test_failed_transaction_writes_nothing() {
        let (_dir, catalog) = seeded_catalog().await;
        let store = store_for(&catalog);
        let before = catalog.count().await.unwrap();

        // The second instance references an exercise that does not exist
        let provisional = Uuid::new_v4().to_string();
        let resolved = resolved(
            &[provisional.as_str(), "missing-exercise"],
            vec![staged(&provisional, "Jefferson Curl")],
        );
        let hammer = catalog.lookup_exact("hammer-curl").await.unwrap().unwrap();
        let alias = PendingAlias {
            provisional_id: Uuid::new_v4().to_string(),
            slug: "curl".into(),
            exercise_id: hammer.id,
        };
        let err = store
            .persist(&formatted(&resolved, 1), &resolved.pending_exercises, &[alias])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PipelinePersistence(_)));
        assert_eq!(store.workout_count().await.unwrap(), 0);
        assert_eq!(catalog.count().await.unwrap(), before);
        assert!(catalog.lookup_alias("curl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_contention_exhausts_retries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("busy.db");
        let pool = db::open(&path, Duration::from_millis(50), 2).await.unwrap();
        let catalog = SqliteCatalog::new(pool, Arc::new(crate::LocalHashEmbedder::default()));
        catalog.seed_defaults().await.unwrap();
        let bench = catalog.lookup_exact("bench-press").await.unwrap().unwrap();
        let store = store_for(&catalog);

        let blocker = db::connect(&path, Duration::from_millis(50), 1).await.unwrap();
        let mut lock = blocker.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *lock).await.unwrap();

        let workout = formatted(&resolved(&[bench.id.as_str()], vec![]), 1);
        let err = store.persist(&workout, &[], &[]).await.unwrap_err();
        assert!(matches!(err, Error::PipelinePersistence(_)));

        sqlx::query("ROLLBACK").execute(&mut *lock).await.unwrap();
        store.persist(&workout, &[], &[]).await.unwrap();
        assert_eq!(store.workout_count().await.unwrap(), 1);
    }
}
