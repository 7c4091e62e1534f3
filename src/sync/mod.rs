// ABOUTME: Sync orchestration - mappings, the per-mapping engine, run reports, and the cron trigger
// ABOUTME: Re-exports the types commands need to drive a run

pub mod engine;
pub mod mapping;
pub mod report;
pub mod scheduler;

pub use engine::{EngineOptions, StageError, SyncEngine, SyncStage};
pub use mapping::{find_mapping, LoadMode, Mapping};
pub use report::{write_report, RunReport};
pub use scheduler::CronTrigger;
