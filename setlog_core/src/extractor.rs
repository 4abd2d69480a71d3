//! Extraction stage: validated text to a placeholder workout.
//!
//! The model is prompted with the target JSON shape and normalization
//! rules. Its reply is checked against that shape here; a violation is fed
//! back into the next prompt until the retry budget runs out. Transport
//! failures are never retried at this level.

use crate::config::ExtractionConfig;
use crate::llm::{complete_with_timeout, extract_json, LlmClient};
use crate::normalize::normalize_name;
use crate::types::{
    PlaceholderBlock, PlaceholderExercise, PlaceholderSet, PlaceholderWorkout, RawInput, WeightUnit,
};
use crate::{Error, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
struct WorkoutReply {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    blocks: Vec<BlockReply>,
}

#[derive(Debug, Deserialize)]
struct BlockReply {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    exercises: Vec<ExerciseReply>,
}

#[derive(Debug, Deserialize)]
struct ExerciseReply {
    #[serde(default)]
    name: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    sets: Vec<SetReply>,
}

#[derive(Debug, Deserialize)]
struct SetReply {
    set_number: i64,
    #[serde(default)]
    reps: Option<f64>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    weight_unit: Option<String>,
    #[serde(default)]
    duration_seconds: Option<f64>,
    #[serde(default)]
    rpe: Option<f64>,
}

/// Defaults applied where the model left a field out
#[derive(Clone, Copy, Debug)]
struct Defaults {
    date: NaiveDate,
    weight_unit: WeightUnit,
}

// ============================================================================
// Extractor
// ============================================================================

pub struct Extractor {
    llm: Arc<dyn LlmClient>,
    config: ExtractionConfig,
    timeout: Duration,
}

impl Extractor {
    pub fn new(llm: Arc<dyn LlmClient>, config: ExtractionConfig, timeout: Duration) -> Self {
        Self {
            llm,
            config,
            timeout,
        }
    }

    /// Extract a placeholder workout from already-validated input.
    ///
    /// `today` is the date used when neither the text nor the request
    /// names one.
    pub async fn extract(&self, input: &RawInput, today: NaiveDate) -> Result<PlaceholderWorkout> {
        let defaults = Defaults {
            date: input.date.unwrap_or(today),
            weight_unit: input.weight_unit.unwrap_or_default(),
        };
        let max_attempts = self.config.max_retries + 1;
        let mut violation: Option<String> = None;

        for attempt in 1..=max_attempts {
            let prompt = build_prompt(&input.text, defaults, violation.as_deref());
            let raw = complete_with_timeout(self.llm.as_ref(), &prompt, self.timeout).await?;

            match extract_json::<WorkoutReply>(&raw).and_then(|reply| check_reply(reply, defaults)) {
                Ok(workout) => {
                    tracing::debug!(
                        attempt,
                        blocks = workout.blocks.len(),
                        sets = workout.set_count(),
                        "Extracted workout structure"
                    );
                    return Ok(workout);
                }
                Err(message) => {
                    tracing::warn!(attempt, max_attempts, violation = %message, "Extraction reply violated schema");
                    violation = Some(message);
                }
            }
        }

        Err(Error::LlmExtraction {
            attempts: max_attempts,
            last_violation: violation.unwrap_or_default(),
        })
    }
}

// ============================================================================
// Schema checks
// ============================================================================

fn check_reply(reply: WorkoutReply, defaults: Defaults) -> std::result::Result<PlaceholderWorkout, String> {
    let date = match reply.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(text) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map_err(|_| format!("date '{text}' is not in YYYY-MM-DD format"))?,
        None => defaults.date,
    };

    if reply.blocks.is_empty() {
        return Err("workout has no blocks".into());
    }

    let mut blocks = Vec::with_capacity(reply.blocks.len());
    for (block_index, block) in reply.blocks.into_iter().enumerate() {
        let block_no = block_index + 1;
        if block.exercises.is_empty() {
            return Err(format!("block {block_no} has no exercises"));
        }

        let mut exercises = Vec::with_capacity(block.exercises.len());
        for (position, exercise) in block.exercises.into_iter().enumerate() {
            let name = exercise.name.trim().to_string();
            if name.is_empty() {
                return Err(format!("block {block_no} exercise {} has an empty name", position + 1));
            }
            if normalize_name(&name).is_empty() {
                return Err(format!("exercise name '{name}' contains no letters or digits"));
            }
            if exercise.sets.is_empty() {
                return Err(format!("exercise '{name}' has no sets"));
            }

            let sets = exercise
                .sets
                .into_iter()
                .enumerate()
                .map(|(index, set)| check_set(&name, index, set, defaults.weight_unit))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            exercises.push(PlaceholderExercise {
                name,
                order_in_block: position as u32,
                notes: non_empty(exercise.notes),
                sets,
            });
        }

        blocks.push(PlaceholderBlock {
            label: non_empty(block.label),
            notes: non_empty(block.notes),
            exercises,
        });
    }

    Ok(PlaceholderWorkout {
        name: non_empty(reply.name),
        date,
        notes: non_empty(reply.notes),
        blocks,
    })
}

fn check_set(
    exercise: &str,
    index: usize,
    set: SetReply,
    default_unit: WeightUnit,
) -> std::result::Result<PlaceholderSet, String> {
    let expected = index as i64 + 1;
    if set.set_number != expected {
        return Err(format!(
            "exercise '{exercise}' set {expected} has set_number {}; set numbers must run 1..n in order",
            set.set_number
        ));
    }

    let reps = match set.reps {
        Some(r) if r < 0.0 || r.fract() != 0.0 => {
            return Err(format!("exercise '{exercise}' set {expected} has invalid reps {r}"))
        }
        Some(r) if r > f64::from(u32::MAX) => {
            return Err(format!("exercise '{exercise}' set {expected} has reps {r} out of range"))
        }
        Some(r) => Some(r as u32),
        None => None,
    };

    if let Some(w) = set.weight {
        if w < 0.0 || !w.is_finite() {
            return Err(format!("exercise '{exercise}' set {expected} has invalid weight {w}"));
        }
    }

    let duration_seconds = match set.duration_seconds {
        Some(d) if d < 0.0 => {
            return Err(format!("exercise '{exercise}' set {expected} has negative duration {d}"))
        }
        Some(d) if d.fract() != 0.0 => {
            return Err(format!(
                "exercise '{exercise}' set {expected} duration {d} is not whole seconds"
            ))
        }
        Some(d) if d > f64::from(u32::MAX) => {
            return Err(format!(
                "exercise '{exercise}' set {expected} has duration {d} out of range"
            ))
        }
        Some(d) => Some(d as u32),
        None => None,
    };

    if let Some(rpe) = set.rpe {
        if !(1.0..=10.0).contains(&rpe) {
            return Err(format!("exercise '{exercise}' set {expected} has rpe {rpe} outside 1..10"));
        }
    }

    let weight_unit = match set.weight_unit.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(unit) => WeightUnit::parse(unit).ok_or_else(|| {
            format!("exercise '{exercise}' set {expected} has unknown weight unit '{unit}'")
        })?,
        None => default_unit,
    };

    Ok(PlaceholderSet {
        set_number: expected as u32,
        reps,
        weight: set.weight,
        weight_unit,
        duration_seconds,
        rpe: set.rpe,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn build_prompt(text: &str, defaults: Defaults, violation: Option<&str>) -> String {
    let mut prompt = format!(
        r#"Convert the workout log below into JSON with exactly this shape:
{{
  "name": string or null,
  "date": "YYYY-MM-DD" or null,
  "notes": string or null,
  "blocks": [
    {{
      "label": string or null,
      "notes": string or null,
      "exercises": [
        {{
          "name": string,
          "notes": string or null,
          "sets": [
            {{"set_number": 1, "reps": integer or null, "weight": number or null,
              "weight_unit": "lbs" or "kg", "duration_seconds": integer or null,
              "rpe": number from 1 to 10 or null}}
          ]
        }}
      ]
    }}
  ]
}}

Rules:
- Only include exercises and sets that appear in the text. Never invent any.
- Expand shorthand like "3x8" into one entry per set.
- set_number starts at 1 and increases by one within each exercise.
- Durations are whole seconds. Use null for anything not stated.
- If no weight unit is stated, use "{unit}". If no date is stated, use null.
- Keep each exercise name as the user wrote it.
- Reply with the JSON object only.
"#,
        unit = defaults.weight_unit
    );

    if let Some(violation) = violation {
        prompt.push_str(&format!(
            "\nYour previous reply was rejected: {violation}\nReturn a corrected JSON object.\n"
        ));
    }

    prompt.push_str(&format!("\nWorkout log:\n\"\"\"\n{text}\n\"\"\"\n"));
    prompt
}
