pub mod cache;
pub mod db;
pub mod entry;
pub mod jsonl;
pub mod memory;

pub use cache::{ClassificationCache, StoreOutcome};
pub use db::{DbPool, SqliteBackend};
pub use entry::{CacheBackend, CacheEntry, CacheError, EntrySource, Loaded, Record};
pub use jsonl::JsonlBackend;
pub use memory::MemoryBackend;
