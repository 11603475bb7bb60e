//! Workflow engine, job dispatch and repository trait definitions for Strand.
//!
//! This crate defines the "ports" (storage traits) that the infrastructure
//! layer implements, plus everything that runs on top of them: the
//! replaying workflow engine, the signal/timer scheduler, and the job
//! dispatcher with its queue chainer. It depends only on `strand-types` --
//! never on `strand-infra` or any database/IO crate.

pub mod event;
pub mod job;
pub mod repository;
pub mod storage;
pub mod workflow;
