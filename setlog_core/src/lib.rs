#![forbid(unsafe_code)]

//! Core library for setlog: turns free-text workout logs into persisted,
//! catalog-linked workout records.
//!
//! This crate provides:
//! - Domain types (placeholder, resolved and formatted workouts)
//! - The exercise catalog and its search indexes (SQLite)
//! - Pipeline stages: validation, extraction, resolution, formatting
//! - The orchestrator that owns the persistence transaction

pub mod types;
pub mod error;
pub mod normalize;
pub mod embedding;
pub mod db;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod llm;
pub mod validator;
pub mod extractor;
pub mod resolver;
pub mod formatter;
pub mod store;
pub mod pipeline;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use catalog::{ExerciseCatalog, SqliteCatalog};
pub use config::Config;
pub use embedding::{Embedder, LocalHashEmbedder};
pub use llm::{LlmClient, OpenAiCompatibleClient};
pub use normalize::normalize_name;
pub use pipeline::{Pipeline, Stage, StageFailure};
pub use resolver::Resolver;
pub use store::WorkoutStore;
