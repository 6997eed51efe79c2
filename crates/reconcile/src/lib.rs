//! appdeck reconcile: release status polling under a concurrency bound.

#![forbid(unsafe_code)]

pub mod options;
pub mod scheduler;

pub use options::{ConfigError, ReleaseControllerOptions};
pub use scheduler::{
    LogSink, Outcome, PollError, ReleasePhase, ReleaseScheduler, ReleaseStatusProvider, StatusSink, TaskEvent, TaskState,
};
