//! Exercise resolution: maps raw exercise names onto catalog ids.
//!
//! Strategies run in a fixed order and the first confident, unambiguous
//! match wins:
//!
//! 1. exact slug lookup, then a slug an earlier request bound by LLM
//! 2. full-text (word tokens)
//! 3. trigram (character similarity)
//! 4. semantic (embedding distance)
//! 5. LLM disambiguation over near-tied or weak candidates
//! 6. fallback creation, staged as a [`PendingExercise`]
//!
//! Nothing here writes to the catalog. Fallback creations and LLM choices
//! ([`PendingAlias`]) are committed by the workout store inside the
//! persistence transaction. A failed or unreadable disambiguation call is
//! an error, never a creation.

use crate::catalog::{ExerciseCatalog, AUTO_CREATED_TAG};
use crate::config::ResolverConfig;
use crate::llm::{complete_with_timeout, extract_json, LlmClient};
use crate::normalize::normalize_name;
use crate::types::{
    rank_candidates, ExerciseCandidate, MatchStrategy, PendingAlias, PendingExercise, PlaceholderWorkout,
    ResolutionOutcome, ResolvedBlock, ResolvedExercise, ResolvedWorkout,
};
use crate::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Searchable strategies, in cascade order
const SEARCH_ORDER: [MatchStrategy; 3] = [
    MatchStrategy::Fulltext,
    MatchStrategy::Trigram,
    MatchStrategy::Semantic,
];

/// What one strategy concluded about its candidates
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// One candidate clears the threshold with a clear lead
    Accepted { candidate: ExerciseCandidate },
    /// Several candidates clear the threshold within the tie margin
    NearTie { candidates: Vec<ExerciseCandidate> },
    /// Nothing clears the threshold; these clear the weak floor
    Weak { candidates: Vec<ExerciseCandidate> },
    NoMatch,
}

/// Outcome of resolving a single name
#[derive(Clone, Debug, PartialEq)]
pub enum NameResolution {
    Matched(ExerciseCandidate),
    Create,
}

/// What the cascade would do with a name, without asking the LLM
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Match { candidate: ExerciseCandidate },
    Disambiguate { candidates: Vec<ExerciseCandidate> },
    Create { slug: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct StrategyReport {
    pub strategy: MatchStrategy,
    pub candidates: Vec<ExerciseCandidate>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

/// Diagnostic trace of the cascade for one name
#[derive(Clone, Debug, Serialize)]
pub struct Explanation {
    pub name: String,
    pub slug: String,
    pub strategies: Vec<StrategyReport>,
    pub decision: Decision,
}

/// `{"choice": "<slug>" | null}`; the key is required
#[derive(Debug, Deserialize)]
struct DisambiguationReply {
    choice: Value,
}

pub struct Resolver {
    catalog: Arc<dyn ExerciseCatalog>,
    llm: Arc<dyn LlmClient>,
    config: ResolverConfig,
    llm_timeout: Duration,
}

impl Resolver {
    pub fn new(
        catalog: Arc<dyn ExerciseCatalog>,
        llm: Arc<dyn LlmClient>,
        config: ResolverConfig,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            llm,
            config,
            llm_timeout,
        }
    }

    /// Resolve every exercise in `workout`.
    ///
    /// Distinct names (by slug) resolve concurrently, at most
    /// `max_concurrency` at a time; results come back in positional order.
    pub async fn resolve_workout(&self, workout: PlaceholderWorkout) -> Result<ResolvedWorkout> {
        let mut distinct: Vec<(String, String)> = Vec::new();
        for name in workout.exercise_names() {
            let slug = normalize_name(name);
            if !distinct.iter().any(|(s, _)| *s == slug) {
                distinct.push((slug, name.trim().to_string()));
            }
        }

        let resolutions: Vec<NameResolution> = stream::iter(distinct.iter())
            .map(|(_, name)| self.resolve_name(name))
            .buffered(self.config.max_concurrency.max(1))
            .try_collect()
            .await?;

        let mut memo: HashMap<String, ResolutionOutcome> = HashMap::new();
        let mut pending = Vec::new();
        let mut aliases = Vec::new();
        for ((slug, name), resolution) in distinct.into_iter().zip(resolutions) {
            let outcome = match resolution {
                NameResolution::Matched(candidate) if candidate.strategy == MatchStrategy::Llm => {
                    // Bound through the store so a concurrent binding of the
                    // same slug wins consistently
                    let provisional_id = Uuid::new_v4().to_string();
                    aliases.push(PendingAlias {
                        provisional_id: provisional_id.clone(),
                        slug: slug.clone(),
                        exercise_id: candidate.id,
                    });
                    ResolutionOutcome {
                        exercise_id: provisional_id,
                        strategy: Some(MatchStrategy::Llm),
                        score: candidate.score,
                        created: false,
                    }
                }
                NameResolution::Matched(candidate) => ResolutionOutcome {
                    exercise_id: candidate.id,
                    strategy: Some(candidate.strategy),
                    score: candidate.score,
                    created: false,
                },
                NameResolution::Create => {
                    let provisional_id = Uuid::new_v4().to_string();
                    tracing::info!(%name, %slug, "Staging new exercise for review");
                    pending.push(PendingExercise {
                        provisional_id: provisional_id.clone(),
                        slug: slug.clone(),
                        name,
                        tags: vec![AUTO_CREATED_TAG.to_string()],
                    });
                    ResolutionOutcome {
                        exercise_id: provisional_id,
                        strategy: None,
                        score: 0.0,
                        created: true,
                    }
                }
            };
            memo.insert(slug, outcome);
        }

        let mut blocks = Vec::with_capacity(workout.blocks.len());
        for block in workout.blocks {
            let mut exercises = Vec::with_capacity(block.exercises.len());
            for exercise in block.exercises {
                let slug = normalize_name(&exercise.name);
                let outcome = memo.get(&slug).cloned().ok_or_else(|| {
                    crate::Error::Other(format!("no resolution recorded for '{}'", exercise.name))
                })?;
                exercises.push(ResolvedExercise {
                    source_name: exercise.name,
                    order_in_block: exercise.order_in_block,
                    notes: exercise.notes,
                    outcome,
                    sets: exercise.sets,
                });
            }
            blocks.push(ResolvedBlock {
                label: block.label,
                notes: block.notes,
                exercises,
            });
        }

        Ok(ResolvedWorkout {
            name: workout.name,
            date: workout.date,
            notes: workout.notes,
            last_modified_time: None,
            blocks,
            pending_exercises: pending,
            pending_aliases: aliases,
        })
    }

    /// Run the cascade for a single raw name
    pub async fn resolve_name(&self, name: &str) -> Result<NameResolution> {
        let slug = normalize_name(name);
        if let Some(exercise) = self.catalog.lookup_exact(&slug).await? {
            tracing::debug!(%name, slug = %exercise.slug, "Resolved by exact match");
            return Ok(NameResolution::Matched(ExerciseCandidate::from_exercise(
                exercise,
                1.0,
                MatchStrategy::Exact,
            )));
        }
        if let Some(exercise) = self.catalog.lookup_alias(&slug).await? {
            tracing::debug!(%name, slug = %exercise.slug, "Resolved by recorded alias");
            return Ok(NameResolution::Matched(ExerciseCandidate::from_exercise(
                exercise,
                1.0,
                MatchStrategy::Alias,
            )));
        }

        let mut weak = Vec::new();
        for strategy in SEARCH_ORDER {
            let hits = self.search(strategy, name).await?;
            match self.judge(strategy, hits) {
                Verdict::Accepted { candidate } => {
                    tracing::debug!(%name, slug = %candidate.slug, %strategy, score = candidate.score, "Resolved");
                    return Ok(NameResolution::Matched(candidate));
                }
                Verdict::NearTie { candidates } => {
                    tracing::debug!(%name, %strategy, tied = candidates.len(), "Near-tie, asking LLM");
                    return self.disambiguate(name, candidates).await;
                }
                Verdict::Weak { candidates } => weak.extend(candidates),
                Verdict::NoMatch => {}
            }
        }

        let weak = merge_weak(weak, self.config.disambiguation_top_k);
        if weak.is_empty() {
            return Ok(NameResolution::Create);
        }
        tracing::debug!(%name, weak = weak.len(), "Only weak candidates, asking LLM");
        self.disambiguate(name, weak).await
    }

    /// Run every lookup and search exhaustively and report what each found.
    ///
    /// Never calls the LLM and never stages a creation.
    pub async fn explain(&self, name: &str) -> Result<Explanation> {
        let slug = normalize_name(name);
        let mut strategies = Vec::new();
        let mut decision = None;

        let lookups = [
            (MatchStrategy::Exact, self.catalog.lookup_exact(&slug).await?),
            (MatchStrategy::Alias, self.catalog.lookup_alias(&slug).await?),
        ];
        for (strategy, hit) in lookups {
            let hits: Vec<ExerciseCandidate> = hit
                .map(|e| ExerciseCandidate::from_exercise(e, 1.0, strategy))
                .into_iter()
                .collect();
            let verdict = match hits.first() {
                Some(candidate) => {
                    if decision.is_none() {
                        decision = Some(Decision::Match {
                            candidate: candidate.clone(),
                        });
                    }
                    Verdict::Accepted {
                        candidate: candidate.clone(),
                    }
                }
                None => Verdict::NoMatch,
            };
            strategies.push(StrategyReport {
                strategy,
                candidates: hits,
                verdict,
            });
        }

        let mut weak = Vec::new();
        for strategy in SEARCH_ORDER {
            let hits = self.search(strategy, name).await?;
            let verdict = self.judge(strategy, hits.clone());
            if decision.is_none() {
                match &verdict {
                    Verdict::Accepted { candidate } => {
                        decision = Some(Decision::Match {
                            candidate: candidate.clone(),
                        })
                    }
                    Verdict::NearTie { candidates } => {
                        decision = Some(Decision::Disambiguate {
                            candidates: candidates.clone(),
                        })
                    }
                    Verdict::Weak { candidates } => weak.extend(candidates.iter().cloned()),
                    Verdict::NoMatch => {}
                }
            }
            strategies.push(StrategyReport {
                strategy,
                candidates: hits,
                verdict,
            });
        }

        let decision = decision.unwrap_or_else(|| {
            let weak = merge_weak(weak, self.config.disambiguation_top_k);
            if weak.is_empty() {
                Decision::Create { slug: slug.clone() }
            } else {
                Decision::Disambiguate { candidates: weak }
            }
        });

        Ok(Explanation {
            name: name.to_string(),
            slug,
            strategies,
            decision,
        })
    }

    async fn search(&self, strategy: MatchStrategy, name: &str) -> Result<Vec<ExerciseCandidate>> {
        match strategy {
            MatchStrategy::Fulltext => self.catalog.search_full_text(name).await,
            MatchStrategy::Trigram => {
                let floor = self
                    .config
                    .trigram_weak_floor
                    .min(self.config.trigram_threshold);
                self.catalog.search_trigram(name, floor).await
            }
            MatchStrategy::Semantic => {
                let embedding = self.catalog.embedder().embed(name);
                let k = self.config.disambiguation_top_k.max(2);
                self.catalog.search_semantic(&embedding, k).await
            }
            MatchStrategy::Exact | MatchStrategy::Alias | MatchStrategy::Llm => Ok(Vec::new()),
        }
    }

    /// Acceptance threshold and weak floor for a strategy, both as scores
    fn bounds(&self, strategy: MatchStrategy) -> (f64, f64) {
        let c = &self.config;
        match strategy {
            MatchStrategy::Fulltext => (c.fulltext_threshold, c.fulltext_weak_floor),
            MatchStrategy::Trigram => (c.trigram_threshold, c.trigram_weak_floor),
            MatchStrategy::Semantic => (
                1.0 - c.semantic_max_distance,
                1.0 - c.semantic_weak_distance,
            ),
            MatchStrategy::Exact | MatchStrategy::Alias | MatchStrategy::Llm => (1.0, 1.0),
        }
    }

    /// Classify ranked hits from one strategy
    pub fn judge(&self, strategy: MatchStrategy, mut hits: Vec<ExerciseCandidate>) -> Verdict {
        let (threshold, weak_floor) = self.bounds(strategy);
        rank_candidates(&mut hits);

        let accepted: Vec<ExerciseCandidate> =
            hits.iter().filter(|c| c.score >= threshold).cloned().collect();
        let Some(top) = accepted.first() else {
            let weak: Vec<ExerciseCandidate> =
                hits.into_iter().filter(|c| c.score >= weak_floor).collect();
            return if weak.is_empty() {
                Verdict::NoMatch
            } else {
                Verdict::Weak { candidates: weak }
            };
        };

        let margin = self.config.near_tie_margin;
        let tied: Vec<ExerciseCandidate> = accepted
            .iter()
            .filter(|c| top.score - c.score <= margin)
            .take(self.config.disambiguation_top_k.max(2))
            .cloned()
            .collect();

        if tied.len() >= 2 {
            Verdict::NearTie { candidates: tied }
        } else {
            Verdict::Accepted {
                candidate: top.clone(),
            }
        }
    }

    /// Ask the LLM to pick among `candidates`.
    ///
    /// A `null` choice, or a slug that was not offered, means "create".
    /// Transport failures, timeouts and unparseable replies are errors.
    async fn disambiguate(
        &self,
        name: &str,
        candidates: Vec<ExerciseCandidate>,
    ) -> Result<NameResolution> {
        let prompt = build_disambiguation_prompt(name, &candidates);
        let raw = complete_with_timeout(self.llm.as_ref(), &prompt, self.llm_timeout).await?;

        let unusable = |detail: String| {
            tracing::warn!(%name, error = %detail, "Unusable disambiguation reply");
            crate::Error::Llm(format!("unusable disambiguation reply for '{name}': {detail}"))
        };
        let reply: DisambiguationReply = extract_json(&raw).map_err(unusable)?;
        let choice = match reply.choice {
            Value::Null => None,
            Value::String(slug) if slug.trim().is_empty() => None,
            Value::String(slug) => Some(slug),
            other => return Err(unusable(format!("choice must be a slug or null, got {other}"))),
        };

        let Some(choice) = choice else {
            tracing::debug!(%name, "LLM declared a new exercise");
            return Ok(NameResolution::Create);
        };

        let choice = normalize_name(&choice);
        match candidates.into_iter().find(|c| c.slug == choice) {
            Some(mut candidate) => {
                candidate.strategy = MatchStrategy::Llm;
                tracing::debug!(%name, slug = %candidate.slug, "Resolved by LLM disambiguation");
                Ok(NameResolution::Matched(candidate))
            }
            None => {
                tracing::warn!(%name, %choice, "LLM chose a slug that was not offered, creating new exercise");
                Ok(NameResolution::Create)
            }
        }
    }
}

/// Keep the best score per exercise, ranked, at most `top_k`
fn merge_weak(candidates: Vec<ExerciseCandidate>, top_k: usize) -> Vec<ExerciseCandidate> {
    let mut best: HashMap<String, ExerciseCandidate> = HashMap::new();
    for candidate in candidates {
        match best.get(&candidate.id) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(candidate.id.clone(), candidate);
            }
        }
    }

    let mut merged: Vec<ExerciseCandidate> = best.into_values().collect();
    rank_candidates(&mut merged);
    merged.truncate(top_k);
    merged
}

fn build_disambiguation_prompt(name: &str, candidates: &[ExerciseCandidate]) -> String {
    let listing = candidates
        .iter()
        .map(|c| format!("- {} ({})", c.slug, c.name))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"A user logged an exercise called "{name}".
Which of these catalog candidates is the same exercise?

{listing}

If one of the candidates is clearly the same movement, reply {{"choice": "<slug>"}} using the slug exactly as listed.
If none of them is the same movement, reply {{"choice": null}}.
Reply with the JSON object only.
"#
    )
}
