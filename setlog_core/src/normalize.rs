//! Exercise name normalization.
//!
//! Everything that keys or indexes the catalog goes through these
//! functions, so the exact index, the full-text tokens and the trigram
//! index always agree on what a name looks like.

use std::collections::BTreeSet;

/// Separator used inside slugs
pub const SLUG_SEPARATOR: char = '-';

/// Normalize an exercise name into its slug.
///
/// Case-folds, then collapses every run of non-alphanumeric characters
/// (`-`, `/`, `'`, whitespace, punctuation) into a single separator and
/// trims separators from both ends. `"Chin-Up"`, `"chin up"` and
/// `"CHIN-UP"` all become `"chin-up"`.
pub fn normalize_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;

    for ch in name.chars() {
        if ch.is_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push(SLUG_SEPARATOR);
            }
            pending_separator = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_separator = true;
        }
    }

    slug
}

/// Word tokens of a name, in order, after normalization
pub fn tokenize(name: &str) -> Vec<String> {
    normalize_name(name)
        .split(SLUG_SEPARATOR)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Character trigrams of a name.
///
/// Each word is padded with two leading spaces and one trailing space
/// before slicing, so word starts weigh more than word interiors.
pub fn trigrams(name: &str) -> BTreeSet<String> {
    let mut grams = BTreeSet::new();
    for word in tokenize(name) {
        let padded: Vec<char> = format!("  {word} ").chars().collect();
        for window in padded.windows(3) {
            grams.insert(window.iter().collect());
        }
    }
    grams
}

/// Jaccard-style trigram similarity from set sizes and overlap
pub fn trigram_similarity(query_count: usize, target_count: usize, shared: usize) -> f64 {
    let union = query_count + target_count - shared;
    if union == 0 {
        return 0.0;
    }
    shared as f64 / union as f64
}

/// Dice coefficient over word-token sets
pub fn token_overlap_score(query: &[String], target: &[String]) -> f64 {
    let q: BTreeSet<&str> = query.iter().map(String::as_str).collect();
    let t: BTreeSet<&str> = target.iter().map(String::as_str).collect();
    if q.is_empty() || t.is_empty() {
        return 0.0;
    }
    let shared = q.intersection(&t).count();
    (2 * shared) as f64 / (q.len() + t.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_equivalence() {
        assert_eq!(normalize_name("Chin-Up"), "chin-up");
        assert_eq!(normalize_name("chin up"), "chin-up");
        assert_eq!(normalize_name("CHIN-UP"), "chin-up");
        assert_eq!(normalize_name("  chin -- / up  "), "chin-up");
    }

    #[test]
    fn test_normalization_separators() {
        assert_eq!(normalize_name("Farmer's Walk"), "farmer-s-walk");
        assert_eq!(normalize_name("Push/Pull"), "push-pull");
        assert_eq!(normalize_name("Bench\tPress"), "bench-press");
        assert_eq!(normalize_name("---"), "");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for name in ["Romanian Deadlift", "Pull-up (banded)", "Ab Crunch Machine"] {
            let once = normalize_name(name);
            assert_eq!(normalize_name(&once), once);
        }
    }

    #[test]
    fn test_trigrams_padded_per_word() {
        let grams = trigrams("chin");
        let expected: BTreeSet<String> = ["  c", " ch", "chi", "hin", "in "]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(grams, expected);
    }

    #[test]
    fn test_short_query_trigram_overlap_is_low() {
        let query = trigrams("chin");
        let target = trigrams("Ab Crunch Machine");
        let shared = query.intersection(&target).count();
        let sim = trigram_similarity(query.len(), target.len(), shared);
        assert!(sim < 0.3, "similarity was {sim}");
    }

    #[test]
    fn test_token_overlap() {
        let q = tokenize("bench");
        let t = tokenize("Bench Press");
        assert!((token_overlap_score(&q, &t) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(token_overlap_score(&tokenize("chin"), &tokenize("Ab Crunch Machine")), 0.0);
    }
}
