//! Pipeline orchestrator.
//!
//! Sequences validation, extraction, resolution, formatting and
//! persistence for one request. Stages only move forward; the first
//! failure ends the run with the stage it happened in.

use crate::catalog::{ExerciseCatalog, SqliteCatalog};
use crate::config::Config;
use crate::extractor::Extractor;
use crate::formatter::{format_workout, IdSource, RandomIds};
use crate::llm::LlmClient;
use crate::resolver::Resolver;
use crate::store::WorkoutStore;
use crate::types::{ParsedWorkout, RawInput};
use crate::validator::Validator;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pipeline states, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    Extracting,
    Resolving,
    Formatting,
    Persisting,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::Extracting => "extracting",
            Stage::Resolving => "resolving",
            Stage::Formatting => "formatting",
            Stage::Persisting => "persisting",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a run: the stage it failed in and why
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl StageFailure {
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Records the forward-only progression of one run
#[derive(Debug)]
pub struct StageTracker {
    history: Vec<Stage>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            history: vec![Stage::Validating],
        }
    }

    pub fn current(&self) -> Stage {
        *self.history.last().unwrap_or(&Stage::Validating)
    }

    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    /// Move to `next`; moving backwards or staying put is rejected
    pub fn advance(&mut self, next: Stage) -> std::result::Result<(), StageFailure> {
        let current = self.current();
        if next <= current {
            return Err(self.fail(Error::Other(format!(
                "illegal stage transition {current} -> {next}"
            ))));
        }
        tracing::debug!(from = %current, to = %next, "Stage transition");
        self.history.push(next);
        Ok(())
    }

    pub fn fail(&self, error: Error) -> StageFailure {
        let stage = self.current();
        tracing::warn!(%stage, error = %error, "Pipeline stage failed");
        StageFailure { stage, error }
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Race `work` against caller cancellation
async fn cancellable<T>(cancel: &CancellationToken, work: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = work => result,
    }
}

/// The full parse pipeline, shareable across concurrent requests
pub struct Pipeline {
    validator: Validator,
    extractor: Extractor,
    resolver: Resolver,
    store: WorkoutStore,
}

impl Pipeline {
    pub fn new(llm: Arc<dyn LlmClient>, catalog: SqliteCatalog, config: &Config) -> Self {
        let timeout = config.llm.timeout();
        let store = WorkoutStore::new(catalog.pool().clone(), catalog.embedder());
        Self {
            validator: Validator::new(Arc::clone(&llm), config.validation.clone(), timeout),
            extractor: Extractor::new(Arc::clone(&llm), config.extraction.clone(), timeout),
            resolver: Resolver::new(Arc::new(catalog), llm, config.resolver.clone(), timeout),
            store,
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn store(&self) -> &WorkoutStore {
        &self.store
    }

    /// Parse and persist one workout with random identifiers
    pub async fn parse(
        &self,
        input: RawInput,
        cancel: &CancellationToken,
    ) -> std::result::Result<ParsedWorkout, StageFailure> {
        self.parse_with_ids(input, &mut RandomIds, cancel).await
    }

    /// Parse and persist one workout, drawing node ids from `ids`
    pub async fn parse_with_ids(
        &self,
        input: RawInput,
        ids: &mut dyn IdSource,
        cancel: &CancellationToken,
    ) -> std::result::Result<ParsedWorkout, StageFailure> {
        let mut tracker = StageTracker::new();

        cancellable(cancel, self.validator.validate(&input))
            .await
            .map_err(|e| tracker.fail(e))?;

        tracker.advance(Stage::Extracting)?;
        let today = Utc::now().date_naive();
        let placeholder = cancellable(cancel, self.extractor.extract(&input, today))
            .await
            .map_err(|e| tracker.fail(e))?;

        tracker.advance(Stage::Resolving)?;
        let resolved = cancellable(cancel, self.resolver.resolve_workout(placeholder))
            .await
            .map_err(|e| tracker.fail(e))?;

        tracker.advance(Stage::Formatting)?;
        let formatted = format_workout(&resolved, ids, Utc::now()).map_err(|e| tracker.fail(e))?;

        tracker.advance(Stage::Persisting)?;
        // Last point at which cancellation is honoured; the transaction
        // below always runs to commit or rollback.
        if cancel.is_cancelled() {
            return Err(tracker.fail(Error::Cancelled));
        }
        let persisted = self
            .store
            .persist(&formatted, &resolved.pending_exercises, &resolved.pending_aliases)
            .await
            .map_err(|e| tracker.fail(e))?;

        tracker.advance(Stage::Done)?;

        let resolutions = resolved
            .blocks
            .into_iter()
            .flat_map(|b| b.exercises)
            .map(|exercise| {
                let mut outcome = exercise.outcome;
                if let Some(committed) = persisted.id_remap.get(&outcome.exercise_id) {
                    outcome.exercise_id = committed.clone();
                }
                outcome
            })
            .collect();

        Ok(ParsedWorkout {
            workout: persisted.workout,
            created_exercises: persisted.created_exercises,
            resolutions,
        })
    }
}
