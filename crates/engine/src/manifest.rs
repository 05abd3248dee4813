use ledgerlabel_core::{Fingerprint, LabeledTransaction, MatchSource, RawTransaction, TransactionKey};
use serde::Serialize;
use std::fmt;

/// Why a transaction left the pipeline without a label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// The remote stage gave up on this transaction.
    RemoteFailed { error: String, attempts: u32 },
    /// Remote classification was halted by a fatal error elsewhere in the run.
    Aborted,
    /// The caller cancelled the run before this transaction was sent.
    Cancelled,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::RemoteFailed { error, attempts } => {
                write!(f, "remote failed after {attempts} attempt(s): {error}")
            }
            UnresolvedReason::Aborted => write!(f, "remote stage aborted"),
            UnresolvedReason::Cancelled => write!(f, "run cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedEntry {
    /// Position in the caller's input.
    pub index: usize,
    pub key: TransactionKey,
    pub fingerprint: Fingerprint,
    #[serde(flatten)]
    pub reason: UnresolvedReason,
}

/// An input record that failed validation and never entered the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedEntry {
    pub index: usize,
    pub record: RawTransaction,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub rule: usize,
    pub fuzzy: usize,
    pub cache: usize,
    pub remote: usize,
    pub unresolved: usize,
}

impl SourceCounts {
    pub fn record(&mut self, source: MatchSource) {
        match source {
            MatchSource::Rule => self.rule += 1,
            MatchSource::Fuzzy => self.fuzzy += 1,
            MatchSource::Cache => self.cache += 1,
            MatchSource::Remote => self.remote += 1,
            MatchSource::Unresolved => self.unresolved += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.rule + self.fuzzy + self.cache + self.remote + self.unresolved
    }
}

/// Everything about a run besides the labels themselves.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunManifest {
    pub counts: SourceCounts,
    pub unresolved: Vec<UnresolvedEntry>,
    pub rejected: Vec<RejectedEntry>,
    /// Set when a fatal remote error stopped the remote stage.
    pub aborted: Option<String>,
    pub cancelled: bool,
    /// Distinct remote requests started (one per fingerprint).
    pub remote_calls: usize,
    /// Remote attempts including retries.
    pub remote_attempts: u32,
    pub cache_write_failures: usize,
    /// Remote results added to the run's exemplar set.
    pub promoted: usize,
}

impl RunManifest {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && !self.cancelled
    }
}

/// Labeled output in input order, plus the manifest describing the run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub labeled: Vec<LabeledTransaction>,
    pub manifest: RunManifest,
}
