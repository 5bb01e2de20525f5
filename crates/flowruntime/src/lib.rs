//! Reactive execution of flow definitions
//!
//! Each definition becomes a [`Pipeline`] of stages wired by demand-driven
//! subscriptions. Traces move through it as persisted contexts, so a
//! crashed worker's traces can be picked up by [`RestartContextSchedule`]
//! on another worker.

mod cleanup;
mod config;
mod owner;
mod pipeline;
mod recovery;
mod registry;
mod retry;
mod runtime;
mod schedule;
mod services;
pub mod stream;

pub use cleanup::{CleanupReport, ExpiredTraceCleaner};
pub use config::{ConfigError, RuntimeConfig};
pub use owner::TraceOwnerService;
pub use pipeline::Pipeline;
pub use recovery::{RecoveryReport, RestartContextSchedule};
pub use registry::{ConfigKey, JoberFactory, JoberMetadata, JoberRegistry};
pub use retry::{RetryDispatcher, RetryReport};
pub use runtime::{FlowRuntime, FlowRuntimeBuilder};
