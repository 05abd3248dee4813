pub mod cancel;
pub mod config;
pub mod manifest;
pub mod orchestrator;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::{
    AbortMode, CacheBackendKind, CacheConfig, ConfigError, EngineConfig, MatchingConfig,
    OrchestratorSettings, RemoteConfig,
};
pub use manifest::{
    RejectedEntry, RunManifest, RunReport, SourceCounts, UnresolvedEntry, UnresolvedReason,
};
pub use orchestrator::{Orchestrator, Stage};
