//! Per-target watch loop: fetch, extract, diff, notify and persist on a
//! jittered schedule, plus the operator gate and shutdown plumbing around it.

pub mod admin;
pub mod config;
pub mod cycle;
pub mod gate;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod status;
pub mod store;

pub use admin::admin_handler;
pub use config::{
    load_targets, parse_targets, validate_targets, ConfigError, Schedule, TargetConfig,
    DEFAULT_TARGET_URL,
};
pub use cycle::{CycleOutcome, CycleResult, FailureKind, Phase, TargetWatcher, WatchError};
pub use gate::{GateState, WatchGate};
pub use scheduler::{supervise, supervise_tasks};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use source::PageSource;
pub use status::StatusRegistry;
pub use store::{BaselineStore, RunStore};
