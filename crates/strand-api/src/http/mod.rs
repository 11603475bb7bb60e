//! HTTP/REST API layer for Strand.
//!
//! Axum-based REST API at `/api/v1/` with the envelope response format,
//! plus the raw `/workers/trigger` endpoint used for remote dispatch.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
