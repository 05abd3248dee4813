use serde::{Deserialize, Serialize};

use crate::normalize::normalize_description;

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Groceries",
    "Dining",
    "Fuel",
    "Utilities",
    "Subscriptions",
    "Insurance",
    "Shopping",
    "Entertainment",
    "Medical",
    "Transportation",
    "Services",
    "Credit Card",
    "Rent",
    "Car Payment",
    "Income",
    "Refund",
];

/// Category the remote classifier is told to fall back on when unsure.
pub const FALLBACK_CATEGORY: &str = "Services";

/// How a candidate label was mapped onto the known category list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Exact,
    Loose,
}

/// The closed set of categories a remote answer must land in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategorySet(Vec<String>);

impl Default for CategorySet {
    fn default() -> Self {
        CategorySet(DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect())
    }
}

impl CategorySet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.into().trim().to_string();
            if !name.is_empty() && !out.contains(&name) {
                out.push(name);
            }
        }
        CategorySet(out)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|c| c == name)
    }

    /// Maps `candidate` onto a known category: exact match first, then a
    /// case- and punctuation-insensitive match.
    pub fn reconcile(&self, candidate: &str) -> Option<(&str, Reconciled)> {
        let candidate = candidate.trim();
        if let Some(c) = self.0.iter().find(|c| c.as_str() == candidate) {
            return Some((c.as_str(), Reconciled::Exact));
        }
        let wanted = normalize_description(candidate);
        if wanted.is_empty() {
            return None;
        }
        self.0
            .iter()
            .find(|c| normalize_description(c) == wanted)
            .map(|c| (c.as_str(), Reconciled::Loose))
    }
}
