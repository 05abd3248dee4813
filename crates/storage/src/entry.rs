use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerlabel_core::{Fingerprint, Label};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How a cache entry came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Resolved by the remote classifier.
    Remote,
    /// Written by an operator as an explicit override.
    Manual,
}

impl fmt::Display for EntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntrySource::Remote => write!(f, "remote"),
            EntrySource::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for EntrySource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote" => Ok(EntrySource::Remote),
            "manual" => Ok(EntrySource::Manual),
            other => Err(format!("Unknown entry source: '{other}'")),
        }
    }
}

/// A previously resolved label. `description` is the normalized text the
/// fingerprint was derived from, kept so the persisted cache can be audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub vendor: Option<String>,
    pub source: EntrySource,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn remote(description: &str, label: &Label) -> Self {
        CacheEntry {
            description: description.to_string(),
            category: label.category.clone(),
            vendor: label.vendor.clone(),
            source: EntrySource::Remote,
            confidence: label.confidence,
            created_at: Utc::now(),
        }
    }

    /// An operator override; carries no confidence.
    pub fn manual(description: &str, category: &str, vendor: Option<&str>) -> Self {
        CacheEntry {
            description: description.to_string(),
            category: category.to_string(),
            vendor: vendor.map(str::to_string),
            source: EntrySource::Manual,
            confidence: None,
            created_at: Utc::now(),
        }
    }

    pub fn label(&self) -> Label {
        Label {
            category: self.category.clone(),
            vendor: self.vendor.clone(),
            confidence: self.confidence,
        }
    }
}

/// One replayable change in a backend's history.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Put(Fingerprint, CacheEntry),
    Remove(Fingerprint),
}

/// Result of replaying a backend: readable records in write order, plus a
/// count of entries that could not be decoded and were treated as absent.
#[derive(Debug, Default)]
pub struct Loaded {
    pub records: Vec<Record>,
    pub skipped: usize,
}

/// Durable storage behind the in-memory cache. Implementations are only
/// ever driven by one writer at a time.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load(&self) -> Result<Loaded, CacheError>;
    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError>;
    async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), CacheError>;

    /// Rewrites storage so it holds exactly `live`.
    async fn compact(&self, _live: &[(Fingerprint, CacheEntry)]) -> Result<(), CacheError> {
        Ok(())
    }
}
