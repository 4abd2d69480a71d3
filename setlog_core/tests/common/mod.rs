//! Shared fixtures for setlog_core integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use setlog_core::{db, Config, Error, LlmClient, LocalHashEmbedder, Pipeline, Result, SqliteCatalog};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptKind {
    Validation,
    Extraction,
    Disambiguation,
}

/// LLM double that answers each prompt kind from a script
pub struct ScriptedLlm {
    validation: String,
    extraction: Mutex<VecDeque<String>>,
    choice: String,
    choice_fails: bool,
    extraction_delay: Option<Duration>,
    validation_delay: Option<Duration>,
    calls: Mutex<Vec<PromptKind>>,
}

impl ScriptedLlm {
    /// Accepts the input and extracts `workout` every time
    pub fn workout(workout: Value) -> Self {
        Self {
            validation: json!({"is_workout": true, "confidence": 0.92, "reason": null}).to_string(),
            extraction: Mutex::new(VecDeque::from([workout.to_string()])),
            choice: json!({"choice": null}).to_string(),
            choice_fails: false,
            extraction_delay: None,
            validation_delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_validation(mut self, is_workout: bool, confidence: f64, reason: Option<&str>) -> Self {
        self.validation =
            json!({"is_workout": is_workout, "confidence": confidence, "reason": reason}).to_string();
        self
    }

    /// Replies served in order; the last one repeats
    pub fn with_extraction_replies(self, replies: Vec<String>) -> Self {
        *self.extraction.lock().unwrap() = replies.into();
        self
    }

    pub fn with_choice(mut self, slug: Option<&str>) -> Self {
        self.choice = json!({"choice": slug}).to_string();
        self
    }

    /// Disambiguation prompts fail as if the connection dropped
    pub fn with_choice_failure(mut self) -> Self {
        self.choice_fails = true;
        self
    }

    pub fn with_extraction_delay(mut self, delay: Duration) -> Self {
        self.extraction_delay = Some(delay);
        self
    }

    pub fn with_validation_delay(mut self, delay: Duration) -> Self {
        self.validation_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<PromptKind> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: PromptKind) -> usize {
        self.calls().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let kind = if prompt.contains("\"is_workout\"") {
            PromptKind::Validation
        } else if prompt.contains("\"choice\"") {
            PromptKind::Disambiguation
        } else if prompt.contains("\"blocks\"") {
            PromptKind::Extraction
        } else {
            panic!("unrecognised prompt: {prompt}");
        };
        self.calls.lock().unwrap().push(kind);

        match kind {
            PromptKind::Validation => {
                if let Some(delay) = self.validation_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(self.validation.clone())
            }
            PromptKind::Extraction => {
                if let Some(delay) = self.extraction_delay {
                    tokio::time::sleep(delay).await;
                }
                let mut replies = self.extraction.lock().unwrap();
                let reply = if replies.len() > 1 {
                    replies.pop_front().unwrap_or_default()
                } else {
                    replies.front().cloned().unwrap_or_default()
                };
                Ok(reply)
            }
            PromptKind::Disambiguation if self.choice_fails => {
                Err(Error::Llm("connection reset by peer".into()))
            }
            PromptKind::Disambiguation => Ok(self.choice.clone()),
        }
    }
}

/// Extraction reply for one block of exercises, each `sets` x `reps`
pub fn single_block(exercises: &[(&str, u32, u32)]) -> Value {
    blocks(&[exercises])
}

/// Extraction reply with one block per slice
pub fn blocks(blocks: &[&[(&str, u32, u32)]]) -> Value {
    let blocks: Vec<Value> = blocks
        .iter()
        .map(|exercises| {
            let exercises: Vec<Value> = exercises
                .iter()
                .map(|(name, sets, reps)| {
                    let sets: Vec<Value> = (1..=*sets)
                        .map(|n| json!({"set_number": n, "reps": reps}))
                        .collect();
                    json!({"name": name, "notes": null, "sets": sets})
                })
                .collect();
            json!({"label": null, "notes": null, "exercises": exercises})
        })
        .collect();
    json!({"name": null, "date": "2024-05-01", "notes": null, "blocks": blocks})
}

/// A database seeded with the built-in vocabulary
pub struct Harness {
    pub dir: TempDir,
    pub catalog: SqliteCatalog,
    pub config: Config,
}

impl Harness {
    pub async fn seeded() -> Self {
        setlog_core::logging::init_test();
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data.database_path = dir.path().join("setlog.db");

        let pool = db::open(
            &config.data.database_path,
            config.data.busy_timeout(),
            config.data.max_connections,
        )
        .await
        .unwrap();
        let catalog = SqliteCatalog::new(pool, Arc::new(LocalHashEmbedder::default()));
        catalog.seed_defaults().await.unwrap();
        Self {
            dir,
            catalog,
            config,
        }
    }

    pub fn pipeline(&self, llm: Arc<ScriptedLlm>) -> Pipeline {
        Pipeline::new(llm, self.catalog.clone(), &self.config)
    }

    pub async fn workout_count(&self) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workouts")
            .fetch_one(self.catalog.pool())
            .await
            .unwrap();
        count
    }

    pub async fn row_count(&self, table: &str) -> i64 {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.catalog.pool())
            .await
            .unwrap();
        count
    }
}
