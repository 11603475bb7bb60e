//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (strand-infra) implements. The core crate never depends on any specific
//! storage technology; `crate::storage::memory` provides the in-process
//! implementation used by tests and ephemeral hosts.

pub mod job;
pub mod workflow;
