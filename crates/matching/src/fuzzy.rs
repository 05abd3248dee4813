use ledgerlabel_core::normalize_description;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::util::{similarity, token_set_similarity};

/// A known description with the label it resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub vendor: Option<String>,
}

impl Exemplar {
    pub fn new(description: &str, category: &str, vendor: Option<&str>) -> Self {
        Exemplar {
            description: normalize_description(description),
            category: category.to_string(),
            vendor: vendor.map(str::to_string),
        }
    }
}

/// Reference descriptions for fuzzy scoring. Grows only through
/// [`ExemplarSet::insert`]; an existing description is never relabeled.
#[derive(Debug, Clone, Default)]
pub struct ExemplarSet {
    exemplars: Vec<Exemplar>,
    index: HashMap<String, usize>,
}

impl ExemplarSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.exemplars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exemplars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exemplar> {
        self.exemplars.iter()
    }

    pub fn get(&self, normalized: &str) -> Option<&Exemplar> {
        self.index.get(normalized).map(|&i| &self.exemplars[i])
    }

    /// Adds `exemplar` unless its description is empty or already known.
    /// Returns whether the set grew.
    pub fn insert(&mut self, mut exemplar: Exemplar) -> bool {
        exemplar.description = normalize_description(&exemplar.description);
        if exemplar.description.is_empty() || self.index.contains_key(&exemplar.description) {
            return false;
        }
        self.index
            .insert(exemplar.description.clone(), self.exemplars.len());
        self.exemplars.push(exemplar);
        true
    }
}

impl FromIterator<Exemplar> for ExemplarSet {
    fn from_iter<I: IntoIterator<Item = Exemplar>>(iter: I) -> Self {
        let mut set = ExemplarSet::new();
        for exemplar in iter {
            set.insert(exemplar);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyMatch<'a> {
    pub exemplar: &'a Exemplar,
    pub score: f32,
}

/// Scores a description against every exemplar and accepts the best one
/// at or above `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct FuzzyMatcher {
    pub threshold: f32,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self { threshold: 0.85 }
    }
}

impl FuzzyMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Ties on score go to the longer exemplar description, then to the
    /// earlier exemplar.
    pub fn best_match<'a>(&self, normalized: &str, exemplars: &'a ExemplarSet) -> Option<FuzzyMatch<'a>> {
        if normalized.is_empty() {
            return None;
        }
        let mut best: Option<FuzzyMatch<'a>> = None;
        for exemplar in exemplars.iter() {
            let score = score(normalized, &exemplar.description);
            if score < self.threshold {
                continue;
            }
            let candidate = FuzzyMatch { exemplar, score };
            best = match best {
                Some(current) if !beats(&candidate, &current) => Some(current),
                _ => Some(candidate),
            };
        }
        best
    }
}

/// Best of edit-distance and token-set similarity.
pub fn score(a: &str, b: &str) -> f32 {
    similarity(a, b).max(token_set_similarity(a, b))
}

fn beats(candidate: &FuzzyMatch<'_>, current: &FuzzyMatch<'_>) -> bool {
    match candidate.score.partial_cmp(&current.score) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Equal) => {
            candidate.exemplar.description.chars().count()
                > current.exemplar.description.chars().count()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[(&str, &str)]) -> ExemplarSet {
        items
            .iter()
            .map(|(d, c)| Exemplar::new(d, c, None))
            .collect()
    }

    #[test]
    fn near_miss_spelling_matches() {
        let ex = set(&[("starbucks coffee", "Dining")]);
        let m = FuzzyMatcher::new(0.85).best_match("starbuks coffee", &ex).unwrap();
        assert_eq!(m.exemplar.category, "Dining");
        assert!(m.score >= 0.85 && m.score < 1.0);
    }

    #[test]
    fn below_threshold_is_no_match() {
        let ex = set(&[("whole foods market", "Groceries")]);
        assert!(FuzzyMatcher::new(0.85).best_match("shell oil 5521", &ex).is_none());
    }

    #[test]
    fn highest_score_wins() {
        let ex = set(&[("shell oil", "Fuel"), ("shell oil 5521", "Utilities")]);
        let m = FuzzyMatcher::new(0.5).best_match("shell oil 5521", &ex).unwrap();
        assert_eq!(m.score, 1.0);
        // Both score 1.0 via token overlap; the longer description breaks the tie.
        assert_eq!(m.exemplar.description, "shell oil 5521");
    }

    #[test]
    fn tie_goes_to_longer_exemplar() {
        let ex = set(&[("netflix", "Entertainment"), ("netflix com", "Subscriptions")]);
        let m = FuzzyMatcher::new(0.8).best_match("netflix com la ca", &ex).unwrap();
        assert_eq!(m.score, 1.0);
        assert_eq!(m.exemplar.category, "Subscriptions");
    }

    #[test]
    fn threshold_is_inclusive_and_tunable() {
        let ex = set(&[("abcd", "X")]);
        // one substitution in four chars → 0.75
        assert!(FuzzyMatcher::new(0.75).best_match("abce", &ex).is_some());
        assert!(FuzzyMatcher::new(0.76).best_match("abce", &ex).is_none());
    }

    #[test]
    fn empty_description_never_matches() {
        let ex = set(&[("anything", "X")]);
        assert!(FuzzyMatcher::new(0.0).best_match("", &ex).is_none());
    }

    #[test]
    fn insert_normalizes_and_refuses_duplicates() {
        let mut ex = ExemplarSet::new();
        assert!(ex.insert(Exemplar {
            description: "NETFLIX.COM".into(),
            category: "Subscriptions".into(),
            vendor: None,
        }));
        assert!(!ex.insert(Exemplar::new("netflix com", "Entertainment", None)));
        assert!(!ex.insert(Exemplar::new("***", "X", None)));
        assert_eq!(ex.len(), 1);
        assert_eq!(ex.get("netflix com").unwrap().category, "Subscriptions");
    }
}
