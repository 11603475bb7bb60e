//! Storage driver implementations that live in core.
//!
//! Only the in-memory driver is here; the SQLite driver is in strand-infra.

pub mod memory;
