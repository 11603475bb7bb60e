//! Shared domain types for Strand.
//!
//! This crate contains the core domain types used across the workspace:
//! workflow instances and their history, signals, timers, job records,
//! queue configuration, engine events, configuration, and the repository
//! error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod queue;
pub mod workflow;
