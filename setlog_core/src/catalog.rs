//! Exercise catalog: canonical exercises and their search indexes.
//!
//! Each exercise row is indexed four ways when it is inserted:
//! - `exercises.slug` (unique) for exact/normalized lookup
//! - `exercises_fts` (FTS5) over normalized word tokens
//! - `exercise_trigrams` with per-exercise trigram counts
//! - `exercise_embeddings` holding one vector per embedding model
//!
//! Rows are only ever created through [`upsert_exercise`], an
//! insert-or-fetch keyed on the slug, so concurrent writers racing on the
//! same name converge on a single row. Aliases recorded by
//! [`record_alias`] follow the same first-writer-wins rule.

use crate::embedding::{cosine_similarity, decode_embedding_blob, encode_embedding_blob, Embedder};
use crate::normalize::{normalize_name, token_overlap_score, tokenize, trigram_similarity, trigrams};
use crate::types::{rank_candidates, Exercise, ExerciseCandidate, MatchStrategy};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Tag attached to exercises minted by the resolver's fallback path
pub const AUTO_CREATED_TAG: &str = "auto_created";

/// Read side of the catalog consumed by the resolver, plus the one
/// idempotent write.
#[async_trait]
pub trait ExerciseCatalog: Send + Sync {
    /// Look up by already-normalized slug
    async fn lookup_exact(&self, normalized_name: &str) -> Result<Option<Exercise>>;

    /// Exercise an earlier request bound `normalized_name` to
    async fn lookup_alias(&self, normalized_name: &str) -> Result<Option<Exercise>>;

    /// Word-token search, ranked by token overlap
    async fn search_full_text(&self, name: &str) -> Result<Vec<ExerciseCandidate>>;

    /// Character-trigram search; only hits at or above `threshold`
    async fn search_trigram(&self, name: &str, threshold: f64) -> Result<Vec<ExerciseCandidate>>;

    /// Nearest neighbours by cosine similarity, best `k`
    async fn search_semantic(&self, embedding: &[f32], k: usize) -> Result<Vec<ExerciseCandidate>>;

    /// Insert-or-fetch keyed on the normalized slug; new rows are flagged
    /// for review.
    async fn upsert_by_normalized_slug(&self, name: &str, tags: &[String]) -> Result<Exercise>;

    /// Embedder whose vectors populate the semantic index
    fn embedder(&self) -> Arc<dyn Embedder>;
}

// ============================================================================
// Built-in vocabulary
// ============================================================================

/// An exercise shipped with the default catalog
#[derive(Clone, Debug)]
pub struct SeedExercise {
    pub name: &'static str,
    pub tags: &'static [&'static str],
}

static DEFAULT_VOCABULARY: Lazy<Vec<SeedExercise>> = Lazy::new(build_default_vocabulary);

/// Get a reference to the cached default vocabulary
pub fn default_vocabulary() -> &'static [SeedExercise] {
    &DEFAULT_VOCABULARY
}

fn build_default_vocabulary() -> Vec<SeedExercise> {
    const fn seed(name: &'static str, tags: &'static [&'static str]) -> SeedExercise {
        SeedExercise { name, tags }
    }

    vec![
        // Presses
        seed("Bench Press", &["barbell", "push", "chest"]),
        seed("Incline Bench Press", &["barbell", "push", "chest"]),
        seed("Dumbbell Bench Press", &["dumbbell", "push", "chest"]),
        seed("Overhead Press", &["barbell", "push", "shoulders"]),
        seed("Handstand Push-Up", &["bodyweight", "push", "shoulders"]),
        seed("Push-Up", &["bodyweight", "push", "chest"]),
        seed("Dip", &["bodyweight", "push", "triceps"]),
        // Squats and legs
        seed("Back Squat", &["barbell", "legs", "squat"]),
        seed("Front Squat", &["barbell", "legs", "squat"]),
        seed("Bulgarian Split Squat", &["dumbbell", "legs", "unilateral"]),
        seed("Lunge", &["legs", "unilateral"]),
        seed("Leg Press", &["machine", "legs"]),
        seed("Leg Extension", &["machine", "legs"]),
        seed("Leg Curl", &["machine", "legs", "hamstrings"]),
        seed("Calf Raise", &["legs", "calves"]),
        seed("Box Jump", &["plyometric", "legs"]),
        // Hinges
        seed("Deadlift", &["barbell", "hinge", "posterior_chain"]),
        seed("Romanian Deadlift", &["barbell", "hinge", "hamstrings"]),
        seed("Sumo Deadlift", &["barbell", "hinge", "posterior_chain"]),
        seed("Hip Thrust", &["barbell", "hinge", "glutes"]),
        seed("Glute Ham Raise", &["bodyweight", "hamstrings"]),
        seed("Kettlebell Swing", &["kettlebell", "hinge", "conditioning"]),
        // Pulls
        seed("Pull-Up", &["bodyweight", "pull", "back"]),
        seed("Chin-Up", &["bodyweight", "pull", "back"]),
        seed("Lat Pulldown", &["machine", "pull", "back"]),
        seed("Barbell Row", &["barbell", "pull", "back"]),
        seed("Dumbbell Row", &["dumbbell", "pull", "back"]),
        seed("Seated Cable Row", &["cable", "pull", "back"]),
        seed("Face Pull", &["cable", "pull", "shoulders"]),
        // Arms and shoulders
        seed("Barbell Curl", &["barbell", "biceps"]),
        seed("Hammer Curl", &["dumbbell", "biceps"]),
        seed("Triceps Pushdown", &["cable", "triceps"]),
        seed("Lying Triceps Extension", &["barbell", "triceps"]),
        seed("Lateral Raise", &["dumbbell", "shoulders"]),
        // Core
        seed("Plank", &["bodyweight", "core"]),
        seed("Ab Crunch Machine", &["machine", "core"]),
        seed("Hanging Leg Raise", &["bodyweight", "core"]),
        seed("Toes to Bar", &["bodyweight", "core"]),
        // Conditioning
        seed("Burpee", &["bodyweight", "conditioning"]),
        seed("Double Under", &["jump_rope", "conditioning"]),
        seed("Farmer's Walk", &["carry", "grip"]),
        seed("Rowing Machine", &["machine", "conditioning"]),
        seed("Running", &["conditioning"]),
    ]
}

/// Validate a vocabulary for consistency
///
/// Returns a list of validation errors, or empty Vec if valid.
pub fn validate_vocabulary(vocabulary: &[SeedExercise]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for entry in vocabulary {
        if entry.name.trim().is_empty() {
            errors.push("Exercise has empty name".to_string());
            continue;
        }
        let slug = normalize_name(entry.name);
        if slug.is_empty() {
            errors.push(format!("Exercise '{}' normalizes to an empty slug", entry.name));
        } else if !seen.insert(slug.clone()) {
            errors.push(format!(
                "Exercise '{}' duplicates slug '{}'",
                entry.name, slug
            ));
        }
    }

    errors
}

// ============================================================================
// Insert-or-fetch
// ============================================================================

/// Insert an exercise unless its slug already exists, then return the
/// stored row and whether this call inserted it.
///
/// Runs on whatever connection it is given, so it can take part in a
/// larger transaction.
pub async fn upsert_exercise(
    conn: &mut SqliteConnection,
    embedder: &dyn Embedder,
    id: &str,
    name: &str,
    tags: &[String],
    needs_review: bool,
) -> Result<(Exercise, bool)> {
    let name = name.trim();
    let slug = normalize_name(name);
    if slug.is_empty() {
        return Err(Error::CatalogValidation(format!(
            "exercise name '{name}' normalizes to an empty slug"
        )));
    }

    let grams = trigrams(name);
    let tags_json = serde_json::to_string(tags)?;

    let inserted = sqlx::query(
        r"
        INSERT INTO exercises (id, slug, name, tags, needs_review, trigram_count, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(slug) DO NOTHING
        ",
    )
    .bind(id)
    .bind(&slug)
    .bind(name)
    .bind(&tags_json)
    .bind(needs_review)
    .bind(grams.len() as i64)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        sqlx::query("INSERT INTO exercises_fts (exercise_id, tokens) VALUES (?1, ?2)")
            .bind(id)
            .bind(tokenize(name).join(" "))
            .execute(&mut *conn)
            .await?;

        for gram in &grams {
            sqlx::query(
                "INSERT OR IGNORE INTO exercise_trigrams (trigram, exercise_id) VALUES (?1, ?2)",
            )
            .bind(gram)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        }

        store_embedding(conn, embedder, id, name).await?;
        tracing::debug!(slug = %slug, needs_review, "Inserted catalog exercise");
    }

    let row = sqlx::query(
        "SELECT id, slug, name, tags, needs_review FROM exercises WHERE slug = ?1",
    )
    .bind(&slug)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::Other(format!("exercise '{slug}' vanished after upsert")))?;

    Ok((exercise_from_row(&row)?, inserted))
}

async fn store_embedding(
    conn: &mut SqliteConnection,
    embedder: &dyn Embedder,
    id: &str,
    name: &str,
) -> Result<()> {
    let vector = embedder.embed(name);
    sqlx::query(
        r"
        INSERT INTO exercise_embeddings (exercise_id, model_id, dims, vector)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(exercise_id) DO UPDATE SET
            model_id = excluded.model_id,
            dims = excluded.dims,
            vector = excluded.vector
        ",
    )
    .bind(id)
    .bind(embedder.model_id())
    .bind(vector.len() as i64)
    .bind(encode_embedding_blob(&vector))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Bind `slug` to `exercise_id` unless it is already bound.
///
/// Returns the exercise id the slug is bound to after the call, which is
/// the earlier binding when another writer got there first.
pub async fn record_alias(
    conn: &mut SqliteConnection,
    slug: &str,
    exercise_id: &str,
) -> Result<(String, bool)> {
    let inserted = sqlx::query(
        r"
        INSERT INTO exercise_aliases (slug, exercise_id, created_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(slug) DO NOTHING
        ",
    )
    .bind(slug)
    .bind(exercise_id)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;

    let (bound,): (String,) =
        sqlx::query_as("SELECT exercise_id FROM exercise_aliases WHERE slug = ?1")
            .bind(slug)
            .fetch_one(&mut *conn)
            .await?;

    if inserted {
        tracing::debug!(%slug, exercise_id = %bound, "Recorded exercise alias");
    }
    Ok((bound, inserted))
}

fn exercise_from_row(row: &SqliteRow) -> Result<Exercise> {
    let tags_json: String = row.try_get("tags")?;
    Ok(Exercise {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        tags: serde_json::from_str(&tags_json)?,
        needs_review: row.try_get("needs_review")?,
    })
}

// ============================================================================
// SQLite-backed catalog
// ============================================================================

/// Catalog stored in the shared SQLite database
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert the built-in vocabulary; existing slugs are left untouched.
    ///
    /// Returns the number of exercises inserted.
    pub async fn seed_defaults(&self) -> Result<usize> {
        let errors = validate_vocabulary(default_vocabulary());
        if !errors.is_empty() {
            return Err(Error::CatalogValidation(errors.join("; ")));
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for entry in default_vocabulary() {
            let tags: Vec<String> = entry.tags.iter().map(|t| t.to_string()).collect();
            let id = Uuid::new_v4().to_string();
            let (_, created) =
                upsert_exercise(&mut tx, self.embedder.as_ref(), &id, entry.name, &tags, false)
                    .await?;
            if created {
                inserted += 1;
            }
        }
        tx.commit().await?;

        let reindexed = self.reindex_embeddings().await?;
        tracing::info!(inserted, reindexed, "Seeded default exercise vocabulary");
        Ok(inserted)
    }

    /// Embed every exercise that has no vector for the current model
    pub async fn reindex_embeddings(&self) -> Result<usize> {
        let rows = sqlx::query(
            r"
            SELECT e.id, e.name FROM exercises e
            LEFT JOIN exercise_embeddings v ON v.exercise_id = e.id
            WHERE v.exercise_id IS NULL OR v.model_id != ?1 OR v.dims != ?2
            ",
        )
        .bind(self.embedder.model_id())
        .bind(self.embedder.dimensions() as i64)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.acquire().await?;
        for row in &rows {
            let id: String = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            store_embedding(&mut conn, self.embedder.as_ref(), &id, &name).await?;
        }
        Ok(rows.len())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Exercise>> {
        let row = sqlx::query("SELECT id, slug, name, tags, needs_review FROM exercises WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(exercise_from_row).transpose()
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM exercises")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Exercises awaiting human curation, oldest first
    pub async fn list_needs_review(&self) -> Result<Vec<Exercise>> {
        let rows = sqlx::query(
            r"
            SELECT id, slug, name, tags, needs_review FROM exercises
            WHERE needs_review = 1
            ORDER BY created_at ASC, slug ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(exercise_from_row).collect()
    }

    /// Clear the review flag; false if the slug is unknown
    pub async fn mark_reviewed(&self, slug: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE exercises SET needs_review = 0 WHERE slug = ?1")
            .bind(normalize_name(slug))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ExerciseCatalog for SqliteCatalog {
    async fn lookup_exact(&self, normalized_name: &str) -> Result<Option<Exercise>> {
        let row = sqlx::query(
            "SELECT id, slug, name, tags, needs_review FROM exercises WHERE slug = ?1",
        )
        .bind(normalized_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(exercise_from_row).transpose()
    }

    async fn lookup_alias(&self, normalized_name: &str) -> Result<Option<Exercise>> {
        let row = sqlx::query(
            r"
            SELECT e.id, e.slug, e.name, e.tags, e.needs_review
            FROM exercise_aliases a
            JOIN exercises e ON e.id = a.exercise_id
            WHERE a.slug = ?1
            ",
        )
        .bind(normalized_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(exercise_from_row).transpose()
    }

    async fn search_full_text(&self, name: &str) -> Result<Vec<ExerciseCandidate>> {
        let tokens = tokenize(name);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let rows = sqlx::query(
            r"
            SELECT e.id, e.slug, e.name, e.tags, e.needs_review
            FROM exercises_fts
            JOIN exercises e ON e.id = exercises_fts.exercise_id
            WHERE exercises_fts MATCH ?1
            ",
        )
        .bind(&match_expr)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let exercise = exercise_from_row(row)?;
            let score = token_overlap_score(&tokens, &tokenize(&exercise.name));
            if score > 0.0 {
                candidates.push(ExerciseCandidate::from_exercise(
                    exercise,
                    score,
                    MatchStrategy::Fulltext,
                ));
            }
        }

        rank_candidates(&mut candidates);
        Ok(candidates)
    }

    async fn search_trigram(&self, name: &str, threshold: f64) -> Result<Vec<ExerciseCandidate>> {
        let grams = trigrams(name);
        if grams.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            r"
            SELECT e.id, e.slug, e.name, e.tags, e.needs_review, e.trigram_count,
                   COUNT(*) AS shared
            FROM exercise_trigrams t
            JOIN exercises e ON e.id = t.exercise_id
            WHERE t.trigram IN (",
        );
        {
            let mut separated = builder.separated(", ");
            for gram in &grams {
                separated.push_bind(gram.clone());
            }
        }
        builder.push(") GROUP BY e.id");

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut candidates = Vec::new();
        for row in &rows {
            let target_count: i64 = row.try_get("trigram_count")?;
            let shared: i64 = row.try_get("shared")?;
            let score = trigram_similarity(grams.len(), target_count as usize, shared as usize);
            if score >= threshold {
                candidates.push(ExerciseCandidate::from_exercise(
                    exercise_from_row(row)?,
                    score,
                    MatchStrategy::Trigram,
                ));
            }
        }

        rank_candidates(&mut candidates);
        Ok(candidates)
    }

    async fn search_semantic(&self, embedding: &[f32], k: usize) -> Result<Vec<ExerciseCandidate>> {
        if k == 0 || embedding.iter().all(|v| *v == 0.0) {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r"
            SELECT e.id, e.slug, e.name, e.tags, e.needs_review, v.dims, v.vector
            FROM exercise_embeddings v
            JOIN exercises e ON e.id = v.exercise_id
            WHERE v.model_id = ?1 AND v.dims = ?2
            ",
        )
        .bind(self.embedder.model_id())
        .bind(embedding.len() as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let dims: i64 = row.try_get("dims")?;
            let blob: Vec<u8> = row.try_get("vector")?;
            let Some(vector) = decode_embedding_blob(&blob, dims as usize) else {
                tracing::warn!("Skipping malformed embedding blob");
                continue;
            };
            let score = cosine_similarity(embedding, &vector).clamp(0.0, 1.0);
            if score <= 0.0 {
                continue;
            }
            candidates.push(ExerciseCandidate::from_exercise(
                exercise_from_row(row)?,
                score,
                MatchStrategy::Semantic,
            ));
        }

        rank_candidates(&mut candidates);
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn upsert_by_normalized_slug(&self, name: &str, tags: &[String]) -> Result<Exercise> {
        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4().to_string();
        let (exercise, _) =
            upsert_exercise(&mut tx, self.embedder.as_ref(), &id, name, tags, true).await?;
        tx.commit().await?;
        Ok(exercise)
    }

    fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }
}
