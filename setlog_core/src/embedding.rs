//! Name embeddings for semantic exercise search.
//!
//! The catalog stores one vector per exercise and the resolver compares
//! query vectors against them by cosine distance. The built-in
//! [`LocalHashEmbedder`] is deterministic and offline: it expands common
//! gym abbreviations and alternate spellings, stems plurals, then hashes
//! word and word-pair features into a fixed-width, L2-normalized vector.

use crate::normalize::tokenize;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const DEFAULT_EMBEDDING_DIM: usize = 256;
pub const LOCAL_MODEL_ID: &str = "local-hash-v1";

/// Turns exercise names into vectors
pub trait Embedder: Send + Sync {
    /// Identifier stored next to each vector; vectors from different
    /// models are never compared.
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Abbreviations and alternate naming conventions, expanded before hashing
static EXPANSIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("db", "dumbbell"),
        ("dbs", "dumbbell"),
        ("bb", "barbell"),
        ("kb", "kettlebell"),
        ("kbs", "kettlebell swing"),
        ("rdl", "romanian deadlift"),
        ("rdls", "romanian deadlift"),
        ("sldl", "stiff leg deadlift"),
        ("ohp", "overhead press"),
        ("military", "overhead"),
        ("shoulder", "overhead"),
        ("bss", "bulgarian split squat"),
        ("ghr", "glute ham raise"),
        ("hspu", "handstand push up"),
        ("t2b", "toes to bar"),
        ("ttb", "toes to bar"),
        ("du", "double under"),
        ("dus", "double under"),
        ("chinup", "chin up"),
        ("pullup", "pull up"),
        ("pushup", "push up"),
        ("pressup", "push up"),
        ("situp", "sit up"),
        ("pulldown", "pull down"),
        ("skullcrusher", "lying triceps extension"),
        ("skullcrushers", "lying triceps extension"),
        ("tricep", "triceps"),
        ("bicep", "biceps"),
        ("curls", "curl"),
        ("hammies", "hamstring"),
        ("lats", "lat"),
        ("dl", "deadlift"),
    ])
});

/// Offline hashing embedder
#[derive(Clone, Debug)]
pub struct LocalHashEmbedder {
    dimensions: usize,
}

impl LocalHashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }
}

impl Default for LocalHashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl Embedder for LocalHashEmbedder {
    fn model_id(&self) -> &str {
        LOCAL_MODEL_ID
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0_f32; self.dimensions];
        let words = expand_words(text);

        for feature in features(&words) {
            let hash = stable_hash(&feature);
            let index = (hash as usize) % self.dimensions;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
            vector[index] += sign * weight;
        }

        normalize_vector(&mut vector);
        vector
    }
}

fn expand_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    for token in tokenize(text) {
        let stemmed = stem(&token);
        let expansion = EXPANSIONS
            .get(token.as_str())
            .or_else(|| EXPANSIONS.get(stemmed.as_str()));
        match expansion {
            Some(expansion) => words.extend(expansion.split(' ').map(stem)),
            None => words.push(stemmed),
        }
    }
    words
}

/// Strip a plural `s` from longer words ("squats" -> "squat", not "press")
fn stem(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

fn features(words: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(words.len() * 2);
    for (index, word) in words.iter().enumerate() {
        out.push(format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            out.push(format!("b:{word}_{next}"));
        }
    }
    out
}

fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    for value in values {
        *value /= norm;
    }
}

/// Cosine similarity of two vectors; 0.0 when shapes differ or either is zero
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut left_norm = 0.0_f64;
    let mut right_norm = 0.0_f64;
    for (l, r) in left.iter().zip(right) {
        dot += f64::from(*l) * f64::from(*r);
        left_norm += f64::from(*l) * f64::from(*l);
        right_norm += f64::from(*r) * f64::from(*r);
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Cosine distance in 0.0..=2.0
pub fn cosine_distance(left: &[f32], right: &[f32]) -> f64 {
    1.0 - cosine_similarity(left, right)
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8], expected_dim: usize) -> Option<Vec<f32>> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return None;
    }

    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
