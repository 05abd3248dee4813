use ledgerlabel_core::Fingerprint;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;

use crate::entry::{CacheBackend, CacheEntry, CacheError, Record};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Inserted,
    /// An entry already existed and `force` was not set; nothing changed.
    Kept(CacheEntry),
    Replaced(CacheEntry),
}

/// Fingerprint → label store shared by every in-flight classification.
///
/// Reads are served from memory. Writes are serialized through the backend
/// lock, so check-then-insert is atomic per key and the persisted history
/// replays in the same order the map was updated.
pub struct ClassificationCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    backend: Mutex<Box<dyn CacheBackend>>,
    skipped_on_load: usize,
}

impl ClassificationCache {
    /// Replays `backend` into memory. Undecodable entries are skipped.
    pub async fn open(backend: impl CacheBackend + 'static) -> Result<Self, CacheError> {
        Self::open_boxed(Box::new(backend)).await
    }

    pub async fn open_boxed(backend: Box<dyn CacheBackend>) -> Result<Self, CacheError> {
        let loaded = backend.load().await?;
        let mut entries = HashMap::new();
        for record in loaded.records {
            match record {
                Record::Put(fp, entry) => {
                    entries.insert(fp, entry);
                }
                Record::Remove(fp) => {
                    entries.remove(&fp);
                }
            }
        }
        if loaded.skipped > 0 {
            tracing::warn!(
                skipped = loaded.skipped,
                "ignored unreadable classification cache entries"
            );
        }
        tracing::info!(entries = entries.len(), "classification cache loaded");

        Ok(Self {
            entries: RwLock::new(entries),
            backend: Mutex::new(backend),
            skipped_on_load: loaded.skipped,
        })
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.read().get(fingerprint).cloned()
    }

    /// Records `entry` under `fingerprint`. An existing entry is left alone
    /// unless `force` is set.
    ///
    /// The in-memory map is updated before the backend write, so a failed
    /// write still leaves the entry visible for the rest of the process.
    pub async fn store(
        &self,
        fingerprint: &Fingerprint,
        entry: CacheEntry,
        force: bool,
    ) -> Result<StoreOutcome, CacheError> {
        let backend = self.backend.lock().await;

        let outcome = {
            let mut entries = self.write();
            match entries.get(fingerprint).cloned() {
                Some(existing) if !force => return Ok(StoreOutcome::Kept(existing)),
                Some(existing) => {
                    entries.insert(fingerprint.clone(), entry.clone());
                    StoreOutcome::Replaced(existing)
                }
                None => {
                    entries.insert(fingerprint.clone(), entry.clone());
                    StoreOutcome::Inserted
                }
            }
        };

        if let Err(e) = backend.put(fingerprint, &entry).await {
            tracing::warn!(%fingerprint, error = %e, "classification cache write failed");
            return Err(e);
        }
        Ok(outcome)
    }

    /// Removes the entry for `fingerprint`, returning it if present.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let backend = self.backend.lock().await;
        if self.lookup(fingerprint).is_none() {
            return Ok(None);
        }
        // Memory only forgets the entry once the backend has.
        backend.remove(fingerprint).await?;
        Ok(self.write().remove(fingerprint))
    }

    /// Rewrites the backend so it holds only the live entries.
    pub async fn compact(&self) -> Result<usize, CacheError> {
        let backend = self.backend.lock().await;
        let live = self.snapshot();
        backend.compact(&live).await?;
        Ok(live.len())
    }

    /// All live entries ordered by fingerprint.
    pub fn snapshot(&self) -> Vec<(Fingerprint, CacheEntry)> {
        let mut all: Vec<_> = self
            .read()
            .iter()
            .map(|(fp, e)| (fp.clone(), e.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn skipped_on_load(&self) -> usize {
        self.skipped_on_load
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Fingerprint, CacheEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Fingerprint, CacheEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntrySource;
    use crate::memory::MemoryBackend;
    use chrono::Utc;
    use std::sync::Arc;

    fn entry(category: &str) -> CacheEntry {
        CacheEntry {
            description: "starbucks 123".to_string(),
            category: category.to_string(),
            vendor: Some("STARBUCKS".to_string()),
            source: EntrySource::Remote,
            confidence: Some(0.9),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn store_then_lookup() {
        let cache = ClassificationCache::open(MemoryBackend::new()).await.unwrap();
        let fp = Fingerprint::of("starbucks 123");
        assert!(cache.lookup(&fp).is_none());
        let out = cache.store(&fp, entry("Dining"), false).await.unwrap();
        assert_eq!(out, StoreOutcome::Inserted);
        assert_eq!(cache.lookup(&fp).unwrap().category, "Dining");
    }

    #[tokio::test]
    async fn store_without_force_keeps_existing() {
        let cache = ClassificationCache::open(MemoryBackend::new()).await.unwrap();
        let fp = Fingerprint::of("starbucks 123");
        cache.store(&fp, entry("Dining"), false).await.unwrap();
        let out = cache.store(&fp, entry("Groceries"), false).await.unwrap();
        assert!(matches!(out, StoreOutcome::Kept(e) if e.category == "Dining"));
        assert_eq!(cache.lookup(&fp).unwrap().category, "Dining");
    }

    #[tokio::test]
    async fn store_with_force_replaces() {
        let cache = ClassificationCache::open(MemoryBackend::new()).await.unwrap();
        let fp = Fingerprint::of("starbucks 123");
        cache.store(&fp, entry("Dining"), false).await.unwrap();
        let out = cache.store(&fp, entry("Groceries"), true).await.unwrap();
        assert!(matches!(out, StoreOutcome::Replaced(e) if e.category == "Dining"));
        assert_eq!(cache.lookup(&fp).unwrap().category, "Groceries");
    }

    #[tokio::test]
    async fn failed_write_keeps_memory_entry() {
        let backend = MemoryBackend::new();
        backend.fail_writes(true);
        let cache = ClassificationCache::open(backend).await.unwrap();
        let fp = Fingerprint::of("starbucks 123");
        assert!(cache.store(&fp, entry("Dining"), false).await.is_err());
        assert_eq!(cache.lookup(&fp).unwrap().category, "Dining");
    }

    #[tokio::test]
    async fn replay_applies_removals() {
        let a = Fingerprint::of("a");
        let b = Fingerprint::of("b");
        let backend = MemoryBackend::with_records(vec![
            Record::Put(a.clone(), entry("Dining")),
            Record::Put(b.clone(), entry("Fuel")),
            Record::Remove(a.clone()),
        ]);
        let cache = ClassificationCache::open(backend).await.unwrap();
        assert!(cache.lookup(&a).is_none());
        assert_eq!(cache.lookup(&b).unwrap().category, "Fuel");
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = ClassificationCache::open(MemoryBackend::new()).await.unwrap();
        let fp = Fingerprint::of("x");
        cache.store(&fp, entry("Dining"), false).await.unwrap();
        assert!(cache.invalidate(&fp).await.unwrap().is_some());
        assert!(cache.lookup(&fp).is_none());
        assert!(cache.invalidate(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_invalidate_keeps_entry() {
        let backend = MemoryBackend::new();
        let cache = ClassificationCache::open(backend.clone()).await.unwrap();
        let fp = Fingerprint::of("x");
        cache.store(&fp, entry("Dining"), false).await.unwrap();

        backend.fail_writes(true);
        assert!(cache.invalidate(&fp).await.is_err());
        assert_eq!(cache.lookup(&fp).unwrap().category, "Dining");

        backend.fail_writes(false);
        assert!(cache.invalidate(&fp).await.unwrap().is_some());
        assert!(cache.lookup(&fp).is_none());
    }

    #[tokio::test]
    async fn concurrent_stores_keep_first_writer() {
        let cache = Arc::new(ClassificationCache::open(MemoryBackend::new()).await.unwrap());
        let fp = Fingerprint::of("race");
        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                cache.store(&fp, entry(&format!("C{i}")), false).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for h in handles {
            if h.await.unwrap() == StoreOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(cache.len(), 1);
    }
}
