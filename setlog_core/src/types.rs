//! Core domain types for the setlog parsing pipeline.
//!
//! This module defines the fundamental types used throughout the system:
//! - Request input and validation verdicts
//! - Placeholder workouts (exercise identified by raw name)
//! - Resolved workouts (exercise identified by catalog id)
//! - Formatted workouts (every node carries a unique id)
//! - Catalog exercises and search candidates

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Request Types
// ============================================================================

/// Unit a set's weight is recorded in
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WeightUnit {
    #[default]
    Lbs,
    Kg,
}

impl WeightUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightUnit::Lbs => "lbs",
            WeightUnit::Kg => "kg",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "lbs" | "lb" => Some(WeightUnit::Lbs),
            "kg" | "kgs" => Some(WeightUnit::Kg),
            _ => None,
        }
    }
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free text submitted for parsing, plus optional hints
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawInput {
    pub text: String,
    pub date: Option<NaiveDate>,
    pub weight_unit: Option<WeightUnit>,
}

impl RawInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            date: None,
            weight_unit: None,
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_weight_unit(mut self, unit: WeightUnit) -> Self {
        self.weight_unit = Some(unit);
        self
    }
}

/// Verdict of the validation stage
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub is_workout: bool,
    pub confidence: f64,
    pub reason: Option<String>,
}

// ============================================================================
// Placeholder Workout (post-extraction)
// ============================================================================

/// One set as described in the source text
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlaceholderSet {
    /// 1-indexed, contiguous within the exercise
    pub set_number: u32,
    pub reps: Option<u32>,
    pub weight: Option<f64>,
    pub weight_unit: WeightUnit,
    pub duration_seconds: Option<u32>,
    pub rpe: Option<f64>,
}

/// An exercise still identified by the name the user wrote
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlaceholderExercise {
    pub name: String,
    /// 0-indexed, contiguous within the block
    pub order_in_block: u32,
    pub notes: Option<String>,
    pub sets: Vec<PlaceholderSet>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlaceholderBlock {
    pub label: Option<String>,
    pub notes: Option<String>,
    pub exercises: Vec<PlaceholderExercise>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlaceholderWorkout {
    pub name: Option<String>,
    pub date: NaiveDate,
    pub notes: Option<String>,
    pub blocks: Vec<PlaceholderBlock>,
}

impl PlaceholderWorkout {
    /// Raw exercise names in positional order (block-major)
    pub fn exercise_names(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .flat_map(|b| b.exercises.iter().map(|e| e.name.as_str()))
            .collect()
    }

    pub fn set_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| &b.exercises)
            .map(|e| e.sets.len())
            .sum()
    }
}

// ============================================================================
// Catalog Types
// ============================================================================

/// A canonical exercise in the catalog
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Exercise {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub tags: Vec<String>,
    pub needs_review: bool,
}

/// Which resolution strategy produced a candidate
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    /// A name an earlier request bound to an exercise through the LLM
    Alias,
    Fulltext,
    Trigram,
    Semantic,
    Llm,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::Alias => "alias",
            MatchStrategy::Fulltext => "fulltext",
            MatchStrategy::Trigram => "trigram",
            MatchStrategy::Semantic => "semantic",
            MatchStrategy::Llm => "llm",
        }
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scored search hit produced during resolution
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExerciseCandidate {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub tags: Vec<String>,
    /// 0.0-1.0, higher is better
    pub score: f64,
    pub strategy: MatchStrategy,
}

impl ExerciseCandidate {
    pub fn from_exercise(exercise: Exercise, score: f64, strategy: MatchStrategy) -> Self {
        Self {
            id: exercise.id,
            slug: exercise.slug,
            name: exercise.name,
            tags: exercise.tags,
            score,
            strategy,
        }
    }
}

/// Sort candidates best-first: higher score, then smaller slug.
pub fn rank_candidates(candidates: &mut [ExerciseCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.slug.cmp(&b.slug))
    });
}

/// A fallback-created exercise awaiting the persistence transaction
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingExercise {
    pub provisional_id: String,
    pub slug: String,
    pub name: String,
    pub tags: Vec<String>,
}

/// An LLM-chosen binding of a slug to an existing exercise, recorded
/// with the workout so later requests reuse it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingAlias {
    pub provisional_id: String,
    pub slug: String,
    pub exercise_id: String,
}

// ============================================================================
// Resolved Workout
// ============================================================================

/// How a single exercise name was resolved
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResolutionOutcome {
    pub exercise_id: String,
    /// None when the exercise was created by the fallback path
    pub strategy: Option<MatchStrategy>,
    pub score: f64,
    pub created: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResolvedExercise {
    pub source_name: String,
    pub order_in_block: u32,
    pub notes: Option<String>,
    /// Carries the catalog id this instance points at
    pub outcome: ResolutionOutcome,
    pub sets: Vec<PlaceholderSet>,
}

impl ResolvedExercise {
    pub fn exercise_id(&self) -> &str {
        &self.outcome.exercise_id
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResolvedBlock {
    pub label: Option<String>,
    pub notes: Option<String>,
    pub exercises: Vec<ResolvedExercise>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResolvedWorkout {
    pub name: Option<String>,
    pub date: NaiveDate,
    pub notes: Option<String>,
    pub last_modified_time: Option<DateTime<Utc>>,
    pub blocks: Vec<ResolvedBlock>,
    /// Fallback creations to upsert alongside the workout
    pub pending_exercises: Vec<PendingExercise>,
    /// LLM-chosen bindings to record alongside the workout
    #[serde(default)]
    pub pending_aliases: Vec<PendingAlias>,
}

// ============================================================================
// Formatted Workout (persisted)
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FormattedSet {
    pub id: Uuid,
    pub exercise_instance_id: Uuid,
    pub set_number: u32,
    pub reps: Option<u32>,
    pub weight: Option<f64>,
    pub weight_unit: WeightUnit,
    pub duration_seconds: Option<u32>,
    pub rpe: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FormattedExercise {
    pub id: Uuid,
    pub block_id: Uuid,
    pub exercise_id: String,
    pub order_in_block: u32,
    pub notes: Option<String>,
    pub sets: Vec<FormattedSet>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FormattedBlock {
    pub id: Uuid,
    pub workout_id: Uuid,
    pub position: u32,
    pub label: Option<String>,
    pub notes: Option<String>,
    pub exercises: Vec<FormattedExercise>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FormattedWorkout {
    pub id: Uuid,
    pub name: Option<String>,
    pub date: NaiveDate,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub blocks: Vec<FormattedBlock>,
}

impl FormattedWorkout {
    /// Every generated identifier in depth-first order
    pub fn all_ids(&self) -> Vec<Uuid> {
        let mut ids = vec![self.id];
        for block in &self.blocks {
            ids.push(block.id);
            for exercise in &block.exercises {
                ids.push(exercise.id);
                ids.extend(exercise.sets.iter().map(|s| s.id));
            }
        }
        ids
    }

    pub fn exercise_count(&self) -> usize {
        self.blocks.iter().map(|b| b.exercises.len()).sum()
    }

    pub fn set_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| &b.exercises)
            .map(|e| e.sets.len())
            .sum()
    }
}

/// Result of a successful pipeline run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParsedWorkout {
    pub workout: FormattedWorkout,
    /// Catalog entries created with needs_review = true
    pub created_exercises: Vec<Exercise>,
    /// One outcome per exercise instance, positional order
    pub resolutions: Vec<ResolutionOutcome>,
}
