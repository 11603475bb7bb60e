//! Infrastructure layer for Strand.
//!
//! Contains implementations of the ports defined in `strand-core`: SQLite
//! storage for workflows and jobs, the HTTP trigger target and webhook
//! notifier, HMAC-SHA256 callback signing, and the config file loader.

pub mod config;
pub mod dispatch;
pub mod sqlite;
