use ledgerlabel_core::{
    clean_vendor, Fingerprint, Label, LabeledTransaction, MatchSource, RawTransaction, Transaction,
};
use ledgerlabel_matching::{CategoryRuleEngine, Exemplar, ExemplarSet, FuzzyMatcher};
use ledgerlabel_remote::{classify_with_retry, ClassificationRequest, RemoteClassifier};
use ledgerlabel_storage::{CacheEntry, ClassificationCache, EntrySource, StoreOutcome};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::config::{AbortMode, ConfigError, EngineConfig, OrchestratorSettings};
use crate::manifest::{RejectedEntry, RunManifest, RunReport, UnresolvedEntry, UnresolvedReason};

/// Where a transaction is in the pipeline. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unclassified,
    RuleChecked,
    FuzzyChecked,
    CacheChecked,
    RemotePending,
    Resolved,
    Unresolved,
}

#[derive(Debug, Clone)]
enum Outcome {
    Resolved(Label, MatchSource),
    Unresolved(UnresolvedReason),
}

enum Local {
    Resolved {
        label: Label,
        source: MatchSource,
        promotable: bool,
    },
    Pending(Fingerprint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Fatal,
    Cancelled,
}

impl Halt {
    fn reason(self) -> UnresolvedReason {
        match self {
            Halt::Fatal => UnresolvedReason::Aborted,
            Halt::Cancelled => UnresolvedReason::Cancelled,
        }
    }
}

struct RunState {
    exemplars: ExemplarSet,
    /// Settled remote outcomes, successes and failures alike, so a
    /// fingerprint is sent at most once per run.
    remote_outcomes: HashMap<Fingerprint, Outcome>,
    halt: Option<Halt>,
    manifest: RunManifest,
}

/// Drives transactions through rule → fuzzy → cache → remote.
///
/// Input is processed in windows of `batch_size`. Within a window the local
/// stages run first, then every distinct fingerprint still unresolved gets
/// one remote request, with at most `concurrency` in flight. Confident remote
/// results join the run's exemplar set before the next window starts.
pub struct Orchestrator {
    rules: CategoryRuleEngine,
    fuzzy: FuzzyMatcher,
    exemplars: ExemplarSet,
    cache: Arc<ClassificationCache>,
    remote: Arc<dyn RemoteClassifier>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        rules: CategoryRuleEngine,
        exemplars: ExemplarSet,
        cache: Arc<ClassificationCache>,
        remote: Arc<dyn RemoteClassifier>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            rules,
            fuzzy: FuzzyMatcher::new(settings.fuzzy_threshold),
            exemplars,
            cache,
            remote,
            settings,
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        cache: Arc<ClassificationCache>,
        remote: Arc<dyn RemoteClassifier>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            config.rule_engine()?,
            config.exemplar_set(),
            cache,
            remote,
            config.settings(),
        ))
    }

    pub fn cache(&self) -> &Arc<ClassificationCache> {
        &self.cache
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn run(&self, transactions: Vec<Transaction>) -> RunReport {
        self.run_cancellable(transactions, CancelToken::never()).await
    }

    pub async fn run_cancellable(
        &self,
        transactions: Vec<Transaction>,
        cancel: CancelToken,
    ) -> RunReport {
        let items = transactions.into_iter().enumerate().collect();
        self.execute(items, Vec::new(), cancel).await
    }

    /// Validates each record first; invalid ones are reported in the
    /// manifest and left out of the labeled output.
    pub async fn run_raw(&self, records: Vec<RawTransaction>) -> RunReport {
        self.run_raw_cancellable(records, CancelToken::never()).await
    }

    pub async fn run_raw_cancellable(
        &self,
        records: Vec<RawTransaction>,
        cancel: CancelToken,
    ) -> RunReport {
        let mut items = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for (index, record) in records.into_iter().enumerate() {
            match Transaction::validate(record.clone()) {
                Ok(tx) => items.push((index, tx)),
                Err(e) => {
                    tracing::warn!(index, error = %e, "rejected input record");
                    rejected.push(RejectedEntry {
                        index,
                        record,
                        error: e.to_string(),
                    });
                }
            }
        }
        self.execute(items, rejected, cancel).await
    }

    async fn execute(
        &self,
        items: Vec<(usize, Transaction)>,
        rejected: Vec<RejectedEntry>,
        mut cancel: CancelToken,
    ) -> RunReport {
        tracing::info!(
            transactions = items.len(),
            rejected = rejected.len(),
            "classification run started"
        );
        let mut state = RunState {
            exemplars: self.exemplars.clone(),
            remote_outcomes: HashMap::new(),
            halt: None,
            manifest: RunManifest {
                rejected,
                ..RunManifest::default()
            },
        };
        let mut outcomes: Vec<Option<Outcome>> = (0..items.len()).map(|_| None).collect();

        let batch = self.settings.batch_size.max(1);
        for start in (0..items.len()).step_by(batch) {
            let window = start..(start + batch).min(items.len());
            self.run_window(&items, window, &mut outcomes, &mut state, &mut cancel)
                .await;
        }

        self.finish(items, outcomes, state)
    }

    async fn run_window(
        &self,
        items: &[(usize, Transaction)],
        window: Range<usize>,
        outcomes: &mut [Option<Outcome>],
        state: &mut RunState,
        cancel: &mut CancelToken,
    ) {
        if state.halt.is_none() && cancel.is_cancelled() {
            tracing::warn!("run cancelled; no further remote requests will be sent");
            state.halt = Some(Halt::Cancelled);
            state.manifest.cancelled = true;
        }

        let mut promotable = vec![false; window.len()];
        let mut pending: Vec<(Fingerprint, Vec<usize>)> = Vec::new();
        let mut pending_index: HashMap<Fingerprint, usize> = HashMap::new();

        for pos in window.clone() {
            let tx = &items[pos].1;
            match self.resolve_locally(tx, &state.exemplars) {
                Local::Resolved {
                    label,
                    source,
                    promotable: p,
                } => {
                    promotable[pos - window.start] = p;
                    outcomes[pos] = Some(Outcome::Resolved(label, source));
                }
                Local::Pending(fp) => {
                    if let Some(settled) = state.remote_outcomes.get(&fp) {
                        tracing::trace!(fingerprint = %fp, "reusing remote outcome from an earlier window");
                        if matches!(settled, Outcome::Resolved(..)) {
                            promotable[pos - window.start] = true;
                        }
                        outcomes[pos] = Some(settled.clone());
                        continue;
                    }
                    if let Some(halt) = state.halt {
                        outcomes[pos] = Some(Outcome::Unresolved(halt.reason()));
                        continue;
                    }
                    match pending_index.get(&fp) {
                        Some(&slot) => pending[slot].1.push(pos),
                        None => {
                            pending_index.insert(fp.clone(), pending.len());
                            pending.push((fp, vec![pos]));
                        }
                    }
                }
            }
        }

        if !pending.is_empty() {
            let waiting: usize = pending.iter().map(|(_, positions)| positions.len()).sum();
            tracing::debug!(
                transactions = waiting,
                requests = pending.len(),
                "dispatching remote classification"
            );
            let mut results = self.dispatch(items, &pending, state, cancel).await;

            for (fp, positions) in pending {
                let first = &items[positions[0]].1;
                let outcome = match results.remove(&fp) {
                    Some(Ok(mut label)) => {
                        if label.vendor.is_none() {
                            label.vendor = fallback_vendor(first);
                        }
                        self.write_back(&fp, first, &label, state).await;
                        for &pos in &positions {
                            promotable[pos - window.start] = true;
                        }
                        let outcome = Outcome::Resolved(label, MatchSource::Remote);
                        state.remote_outcomes.insert(fp.clone(), outcome.clone());
                        outcome
                    }
                    Some(Err(reason)) => {
                        let outcome = Outcome::Unresolved(reason);
                        state.remote_outcomes.insert(fp.clone(), outcome.clone());
                        outcome
                    }
                    None => Outcome::Unresolved(match state.halt {
                        Some(halt) => halt.reason(),
                        None => UnresolvedReason::RemoteFailed {
                            error: "remote task did not complete".to_string(),
                            attempts: 0,
                        },
                    }),
                };
                for pos in positions {
                    outcomes[pos] = Some(outcome.clone());
                }
            }
        }

        // Promotion follows input order so a replay from a warm cache grows
        // the exemplar set identically.
        for pos in window.clone() {
            if !promotable[pos - window.start] {
                continue;
            }
            if let Some(Outcome::Resolved(label, _)) = &outcomes[pos] {
                self.promote(&items[pos].1, label, state);
            }
        }
    }

    fn resolve_locally(&self, tx: &Transaction, exemplars: &ExemplarSet) -> Local {
        tracing::trace!(description = %tx.normalized, stage = ?Stage::Unclassified);

        if let Some(rule) = self.rules.find_match(&tx.normalized) {
            tracing::trace!(description = %tx.normalized, rule = %rule.name, stage = ?Stage::Resolved);
            return Local::Resolved {
                label: Label {
                    category: rule.category.clone(),
                    vendor: rule.vendor.clone().or_else(|| fallback_vendor(tx)),
                    confidence: None,
                },
                source: MatchSource::Rule,
                promotable: false,
            };
        }
        tracing::trace!(description = %tx.normalized, stage = ?Stage::RuleChecked);

        if let Some(m) = self.fuzzy.best_match(&tx.normalized, exemplars) {
            tracing::trace!(
                description = %tx.normalized,
                exemplar = %m.exemplar.description,
                score = m.score,
                stage = ?Stage::Resolved
            );
            return Local::Resolved {
                label: Label {
                    category: m.exemplar.category.clone(),
                    vendor: m.exemplar.vendor.clone().or_else(|| fallback_vendor(tx)),
                    confidence: Some(m.score),
                },
                source: MatchSource::Fuzzy,
                promotable: false,
            };
        }
        tracing::trace!(description = %tx.normalized, stage = ?Stage::FuzzyChecked);

        let fp = tx.fingerprint();
        if let Some(entry) = self.cache.lookup(&fp) {
            tracing::trace!(description = %tx.normalized, fingerprint = %fp, stage = ?Stage::Resolved);
            let mut label = entry.label();
            if label.vendor.is_none() {
                label.vendor = fallback_vendor(tx);
            }
            return Local::Resolved {
                label,
                source: MatchSource::Cache,
                promotable: entry.source == EntrySource::Remote,
            };
        }
        tracing::trace!(description = %tx.normalized, fingerprint = %fp, stage = ?Stage::CacheChecked);

        Local::Pending(fp)
    }

    async fn dispatch(
        &self,
        items: &[(usize, Transaction)],
        pending: &[(Fingerprint, Vec<usize>)],
        state: &mut RunState,
        cancel: &mut CancelToken,
    ) -> HashMap<Fingerprint, Result<Label, UnresolvedReason>> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (fp, positions) in pending {
            let request = ClassificationRequest::for_transaction(&items[positions[0]].1);
            let fp = fp.clone();
            let remote = Arc::clone(&self.remote);
            let policy = self.settings.retry.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // A closed semaphore means the run stopped calling out.
                let Ok(_permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    return (fp, None);
                };
                tracing::trace!(fingerprint = %fp, stage = ?Stage::RemotePending, "remote request started");
                let attempted = classify_with_retry(remote.as_ref(), &request, &policy).await;
                // Close before the permit is released so no waiter slips through.
                if matches!(&attempted.result, Err(e) if e.is_fatal()) {
                    semaphore.close();
                }
                (fp, Some(attempted))
            });
        }

        let mut results = HashMap::new();
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let (fp, attempted) = match joined {
                        Ok((fp, Some(attempted))) => (fp, attempted),
                        Ok((_, None)) => continue,
                        Err(e) if e.is_cancelled() => continue,
                        Err(e) => {
                            tracing::error!(error = %e, "remote classification task failed");
                            continue;
                        }
                    };

                    state.manifest.remote_calls += 1;
                    state.manifest.remote_attempts += attempted.attempts;
                    let attempts = attempted.attempts;
                    match attempted.result {
                        Ok(label) => {
                            results.insert(fp, Ok(label));
                        }
                        Err(error) => {
                            if error.is_fatal() && state.halt.is_none() {
                                tracing::error!(
                                    fingerprint = %fp,
                                    error = %error,
                                    "fatal remote error; halting remote classification"
                                );
                                state.halt = Some(Halt::Fatal);
                                state.manifest.aborted = Some(error.to_string());
                                semaphore.close();
                                if self.settings.on_abort == AbortMode::Cancel {
                                    tasks.abort_all();
                                }
                            } else {
                                tracing::warn!(
                                    fingerprint = %fp,
                                    attempts,
                                    error = %error,
                                    "remote classification failed"
                                );
                            }
                            results.insert(
                                fp,
                                Err(UnresolvedReason::RemoteFailed {
                                    error: error.to_string(),
                                    attempts,
                                }),
                            );
                        }
                    }
                }
                _ = cancel.cancelled(), if state.halt.is_none() => {
                    tracing::warn!("run cancelled; no further remote requests will be sent");
                    state.halt = Some(Halt::Cancelled);
                    state.manifest.cancelled = true;
                    semaphore.close();
                    if self.settings.on_abort == AbortMode::Cancel {
                        tasks.abort_all();
                    }
                }
            }
        }
        results
    }

    async fn write_back(&self, fp: &Fingerprint, tx: &Transaction, label: &Label, state: &mut RunState) {
        let entry = CacheEntry::remote(&tx.normalized, label);
        match self.cache.store(fp, entry, false).await {
            Ok(StoreOutcome::Kept(_)) => {
                tracing::debug!(fingerprint = %fp, "cache already held an entry; left unchanged");
            }
            Ok(_) => {}
            // The cache keeps the entry in memory and has logged the failure.
            Err(_) => state.manifest.cache_write_failures += 1,
        }
    }

    fn promote(&self, tx: &Transaction, label: &Label, state: &mut RunState) {
        let confident = label
            .confidence
            .is_some_and(|c| c >= self.settings.promotion_threshold);
        if !confident {
            return;
        }
        let exemplar = Exemplar {
            description: tx.normalized.clone(),
            category: label.category.clone(),
            vendor: label.vendor.clone(),
        };
        if state.exemplars.insert(exemplar) {
            tracing::debug!(description = %tx.normalized, category = %label.category, "promoted to exemplar");
            state.manifest.promoted += 1;
        }
    }

    fn finish(
        &self,
        items: Vec<(usize, Transaction)>,
        outcomes: Vec<Option<Outcome>>,
        mut state: RunState,
    ) -> RunReport {
        let mut labeled = Vec::with_capacity(items.len());
        for ((index, tx), outcome) in items.into_iter().zip(outcomes) {
            let outcome = outcome.unwrap_or(Outcome::Unresolved(UnresolvedReason::Aborted));
            let item = match outcome {
                Outcome::Resolved(label, source) => LabeledTransaction::resolved(tx, label, source),
                Outcome::Unresolved(reason) => {
                    tracing::trace!(description = %tx.normalized, %reason, stage = ?Stage::Unresolved);
                    state.manifest.unresolved.push(UnresolvedEntry {
                        index,
                        key: tx.key(),
                        fingerprint: tx.fingerprint(),
                        reason,
                    });
                    LabeledTransaction::unresolved(tx)
                }
            };
            state.manifest.counts.record(item.source);
            labeled.push(item);
        }

        let counts = state.manifest.counts;
        tracing::info!(
            rule = counts.rule,
            fuzzy = counts.fuzzy,
            cache = counts.cache,
            remote = counts.remote,
            unresolved = counts.unresolved,
            remote_calls = state.manifest.remote_calls,
            promoted = state.manifest.promoted,
            "classification run finished"
        );
        if let Some(reason) = &state.manifest.aborted {
            tracing::error!(%reason, "run finished with the remote stage aborted");
        }

        RunReport {
            labeled,
            manifest: state.manifest,
        }
    }
}

fn fallback_vendor(tx: &Transaction) -> Option<String> {
    let vendor = clean_vendor(&tx.description);
    (!vendor.is_empty()).then_some(vendor)
}
