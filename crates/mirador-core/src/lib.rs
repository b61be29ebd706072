//! Mirador Core - sync and cache reconciliation engine for a listings mirror.
//!
//! The engine is generic over a [`RecordStore`] and an [`UpstreamClientFactory`];
//! `mirador-db` and `mirador-client` provide the production implementations.

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod signals;
pub mod sync;
pub mod traits;
pub mod walker;

#[cfg(test)]
mod testing;

pub use config::{
    default_config_path, load_engine_config, CleanupConfig, ConfigUpdate, EngineConfig,
    HttpConfig, ScheduleConfig, SignalRules, SyncConfig, UpstreamConfig,
};
pub use engine::{EngineStatus, SyncEngine};
pub use error::AppError;
pub use models::{
    compute_content_hash, CachedRecord, CoreFields, LifecycleState, ListingDetail, ListingPage,
    ListingSummary, RecordFilter, RecordPatch,
};
pub use retry::RetryPolicy;
pub use scheduler::{evaluate_gate, Coverage, GateDecision};
pub use signals::compute_signals;
pub use sync::{CleanupReport, CycleStats, CycleStatus, SyncOutcome};
pub use traits::{RecordStore, UpstreamClient, UpstreamClientFactory};
pub use walker::{CollectedIds, PaginationWalker};
