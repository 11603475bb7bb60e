//! HTTP dispatch plumbing: the remote trigger target and job callbacks.

pub mod http_trigger;
pub mod webhook;

pub use http_trigger::HttpTriggerTarget;
pub use webhook::{CallbackVerifier, HttpWebhookNotifier, SIGNATURE_HEADER, WebhookError};
