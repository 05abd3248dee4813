use async_trait::async_trait;
use ledgerlabel_core::Fingerprint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;

use crate::entry::{CacheBackend, CacheEntry, CacheError, Loaded, Record};

/// One line of the log file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogLine {
    Put { fingerprint: String, entry: CacheEntry },
    Invalidate { fingerprint: String },
}

/// Append-only JSON-lines log: one `put` or `invalidate` object per line,
/// replayed in order on load. Plain text so it can be diffed and reviewed.
pub struct JsonlBackend {
    path: PathBuf,
    /// Set when the file ends mid-line (e.g. after a crash), so the next
    /// append starts on a fresh line instead of extending the torn one.
    torn_tail: AtomicBool,
}

impl JsonlBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            torn_tail: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &LogLine) -> Result<(), CacheError> {
        let mut bytes = Vec::new();
        if self.torn_tail.load(Ordering::SeqCst) {
            bytes.push(b'\n');
        }
        serde_json::to_writer(&mut bytes, line)?;
        bytes.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        self.torn_tail.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn decode_line(line: &[u8]) -> Option<Record> {
    match serde_json::from_slice::<LogLine>(line).ok()? {
        LogLine::Put { fingerprint, entry } => {
            Fingerprint::parse(&fingerprint).map(|fp| Record::Put(fp, entry))
        }
        LogLine::Invalidate { fingerprint } => Fingerprint::parse(&fingerprint).map(Record::Remove),
    }
}

#[async_trait]
impl CacheBackend for JsonlBackend {
    async fn load(&self) -> Result<Loaded, CacheError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::default()),
            Err(e) => return Err(e.into()),
        };
        self.torn_tail
            .store(bytes.last().is_some_and(|b| *b != b'\n'), Ordering::SeqCst);

        let mut loaded = Loaded::default();
        for (lineno, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match decode_line(line) {
                Some(record) => loaded.records.push(record),
                None => {
                    tracing::debug!(line = lineno + 1, path = %self.path.display(), "skipping unreadable cache line");
                    loaded.skipped += 1;
                }
            }
        }
        Ok(loaded)
    }

    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError> {
        self.append(&LogLine::Put {
            fingerprint: fingerprint.to_string(),
            entry: entry.clone(),
        })
        .await
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        self.append(&LogLine::Invalidate {
            fingerprint: fingerprint.to_string(),
        })
        .await
    }

    /// Writes the live set to a sibling temp file and renames it over the log.
    async fn compact(&self, live: &[(Fingerprint, CacheEntry)]) -> Result<(), CacheError> {
        let mut bytes = Vec::new();
        for (fp, entry) in live {
            serde_json::to_writer(
                &mut bytes,
                &LogLine::Put {
                    fingerprint: fp.to_string(),
                    entry: entry.clone(),
                },
            )?;
            bytes.push(b'\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        self.torn_tail.store(false, Ordering::SeqCst);
        Ok(())
    }
}
