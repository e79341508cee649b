//! facegate-engine — Enrollment and authentication pipelines over a
//! persisted identity model store.
//!
//! [`Engine`] runs one capture worker at a time on a dedicated thread and
//! streams [`FrameEvent`]s plus a single terminal [`Outcome`] back to the
//! caller.

pub mod authenticate;
pub mod backup;
pub mod config;
pub mod decision;
pub mod engine;
pub mod enroll;
pub mod pipeline;
pub mod store;

#[cfg(test)]
mod testing;

pub use backup::export_backup;
pub use config::{Config, ConfigError};
pub use decision::{AuthState, DecisionMachine, FrameOutcome, FrameVerdict};
pub use engine::{Engine, EngineError, Outcome, PipelineSettings, WorkerHandle};
pub use pipeline::{FaceScan, FrameEvent, FrameStatus};
pub use store::{
    IdentitySummary, ModelState, ModelStore, SharedStore, StoreError, StorePaths, StoreSummary,
};
