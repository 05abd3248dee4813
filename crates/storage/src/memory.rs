use async_trait::async_trait;
use ledgerlabel_core::Fingerprint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::entry::{CacheBackend, CacheEntry, CacheError, Loaded, Record};

#[derive(Default)]
struct Inner {
    records: Mutex<Vec<Record>>,
    fail_writes: AtomicBool,
}

/// Non-persistent backend. Clones share state, so a test can keep a handle
/// to inspect what the cache wrote or to make writes fail.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        let backend = Self::new();
        *backend.records_mut() = records;
        backend
    }

    /// Makes every subsequent `put`/`remove` fail with an IO error.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every record written so far, in order.
    pub fn records(&self) -> Vec<Record> {
        self.records_mut().clone()
    }

    fn records_mut(&self) -> std::sync::MutexGuard<'_, Vec<Record>> {
        self.inner.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(&self) -> Result<(), CacheError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "memory backend configured to fail writes",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn load(&self) -> Result<Loaded, CacheError> {
        Ok(Loaded {
            records: self.records(),
            skipped: 0,
        })
    }

    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError> {
        self.check_writable()?;
        self.records_mut()
            .push(Record::Put(fingerprint.clone(), entry.clone()));
        Ok(())
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        self.check_writable()?;
        self.records_mut().push(Record::Remove(fingerprint.clone()));
        Ok(())
    }

    async fn compact(&self, live: &[(Fingerprint, CacheEntry)]) -> Result<(), CacheError> {
        *self.records_mut() = live
            .iter()
            .map(|(fp, e)| Record::Put(fp.clone(), e.clone()))
            .collect();
        Ok(())
    }
}
