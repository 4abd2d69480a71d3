//! Database formatter: gives every node of a resolved workout its own id.

use crate::types::{
    FormattedBlock, FormattedExercise, FormattedSet, FormattedWorkout, ResolvedWorkout,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

/// Redraws allowed before a colliding id source is declared broken
const MAX_REDRAWS: usize = 16;

/// Supplier of node identifiers
pub trait IdSource: Send {
    fn next_id(&mut self) -> Uuid;
}

/// Random v4 UUIDs
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&mut self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic ids counting up from a start value
#[derive(Clone, Debug)]
pub struct SequentialIds {
    next: u128,
}

impl SequentialIds {
    pub fn new(start: u128) -> Self {
        Self { next: start }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdSource for SequentialIds {
    fn next_id(&mut self) -> Uuid {
        let id = Uuid::from_u128(self.next);
        self.next = self.next.wrapping_add(1);
        id
    }
}

struct IdIssuer<'a> {
    source: &'a mut dyn IdSource,
    issued: HashSet<Uuid>,
}

impl IdIssuer<'_> {
    fn fresh(&mut self) -> Result<Uuid> {
        for _ in 0..=MAX_REDRAWS {
            let id = self.source.next_id();
            if self.issued.insert(id) {
                return Ok(id);
            }
            tracing::warn!(%id, "Identifier collision, redrawing");
        }
        Err(Error::Other(format!(
            "identifier source produced no fresh id after {MAX_REDRAWS} redraws"
        )))
    }
}

/// Walk `resolved` depth-first and assign ids.
///
/// Output differs between runs only in the ids drawn from `ids`; `now`
/// stamps `created_at` and fills a missing `last_modified_time`.
pub fn format_workout(
    resolved: &ResolvedWorkout,
    ids: &mut dyn IdSource,
    now: DateTime<Utc>,
) -> Result<FormattedWorkout> {
    let mut issuer = IdIssuer {
        source: ids,
        issued: HashSet::new(),
    };

    let workout_id = issuer.fresh()?;
    let mut blocks = Vec::with_capacity(resolved.blocks.len());

    for (position, block) in resolved.blocks.iter().enumerate() {
        let block_id = issuer.fresh()?;
        let mut exercises = Vec::with_capacity(block.exercises.len());

        for exercise in &block.exercises {
            let instance_id = issuer.fresh()?;
            let mut sets = Vec::with_capacity(exercise.sets.len());
            for set in &exercise.sets {
                sets.push(FormattedSet {
                    id: issuer.fresh()?,
                    exercise_instance_id: instance_id,
                    set_number: set.set_number,
                    reps: set.reps,
                    weight: set.weight,
                    weight_unit: set.weight_unit,
                    duration_seconds: set.duration_seconds,
                    rpe: set.rpe,
                });
            }

            exercises.push(FormattedExercise {
                id: instance_id,
                block_id,
                exercise_id: exercise.exercise_id().to_string(),
                order_in_block: exercise.order_in_block,
                notes: exercise.notes.clone(),
                sets,
            });
        }

        blocks.push(FormattedBlock {
            id: block_id,
            workout_id,
            position: position as u32,
            label: block.label.clone(),
            notes: block.notes.clone(),
            exercises,
        });
    }

    Ok(FormattedWorkout {
        id: workout_id,
        name: resolved.name.clone(),
        date: resolved.date,
        notes: resolved.notes.clone(),
        created_at: now,
        last_modified_time: resolved.last_modified_time.unwrap_or(now),
        blocks,
    })
}
