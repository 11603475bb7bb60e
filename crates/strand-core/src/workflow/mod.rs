//! Durable workflow execution.
//!
//! - `definition` -- versioned handlers and the workflow registry
//! - `context` -- handler-facing API with op-indexed deterministic replay
//! - `engine` -- instance lifecycle, claims, outcome recording, replay check
//! - `scheduler` -- signal delivery and the timer sweep
//! - `retry` -- step retry decisions (fixed / exponential backoff)
//! - `duration` -- human-readable wait durations
//! - `error` -- `FlowError` (handler side) and `EngineError` (caller side)

pub mod context;
pub mod definition;
pub mod duration;
pub mod engine;
pub mod error;
pub mod retry;
pub mod scheduler;

pub use context::{Branch, WaitOptions, WorkflowContext};
pub use definition::{WorkflowDefinition, WorkflowRegistry};
pub use engine::{CancelOutcome, Engine, ReplayReport, ReplayResult, WorkflowOutcome};
pub use error::{EngineError, FlowError};
pub use scheduler::{Scheduler, SchedulerError, SignalDelivery, SignalRequest, SweepReport};
