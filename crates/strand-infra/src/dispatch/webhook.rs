//! Job callback signing, verification and delivery.
//!
//! Callbacks carry an HMAC-SHA256 signature of the raw body in the
//! `X-Strand-Signature` header as `sha256=<hex>`.
//!
//! Provides:
//! - `sign_body()` / `verify_signature()` -- HMAC-SHA256 over the raw body
//! - `CallbackVerifier` -- the receive-side policy (secret or explicit opt-out)
//! - `HttpWebhookNotifier` -- `JobNotifier` that POSTs signed callbacks

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use strand_core::job::{DispatchError, JobNotifier};
use strand_types::config::WebhookConfig;
use strand_types::job::WebhookCallback;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the callback signature.
pub const SIGNATURE_HEADER: &str = "X-Strand-Signature";

const SIGNATURE_PREFIX: &str = "sha256=";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while verifying a callback.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HMAC signature verification failed")]
    InvalidSignature,

    #[error("missing {SIGNATURE_HEADER} header")]
    MissingSignature,

    /// No secret is configured and unsigned callbacks are not allowed.
    #[error("unsigned callbacks are not accepted; configure webhook.secret")]
    Unsigned,

    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),
}

// ---------------------------------------------------------------------------
// HMAC-SHA256
// ---------------------------------------------------------------------------

/// Compute the `sha256=<hex>` signature of `body`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex_encode(&mac.finalize().into_bytes())
    ))
}

/// Verify a signature header value against `body`.
///
/// Accepts both `sha256=<hex>` and bare hex. Comparison is constant-time
/// (`Mac::verify_slice`).
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<(), WebhookError> {
    let hex_sig = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature.trim());
    let expected = hex_decode(hex_sig).ok_or(WebhookError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// CallbackVerifier
// ---------------------------------------------------------------------------

/// Receive-side callback policy.
///
/// With a secret, every callback must carry a valid signature. Without one,
/// callbacks are rejected unless `allow_unsigned` was set explicitly.
#[derive(Debug, Clone, Default)]
pub struct CallbackVerifier {
    secret: Option<Vec<u8>>,
    allow_unsigned: bool,
}

impl CallbackVerifier {
    pub fn new(secret: Option<&str>, allow_unsigned: bool) -> Self {
        Self {
            secret: secret.map(|s| s.as_bytes().to_vec()),
            allow_unsigned,
        }
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(config.secret.as_deref(), config.allow_unsigned_callbacks)
    }

    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), WebhookError> {
        match &self.secret {
            Some(secret) => {
                let signature = signature.ok_or(WebhookError::MissingSignature)?;
                verify_signature(secret, body, signature)
            }
            None if self.allow_unsigned => Ok(()),
            None => Err(WebhookError::Unsigned),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpWebhookNotifier
// ---------------------------------------------------------------------------

/// Delivers job completion callbacks over HTTP, signed when a secret is set.
pub struct HttpWebhookNotifier {
    client: reqwest::Client,
    secret: Option<Vec<u8>>,
}

impl HttpWebhookNotifier {
    pub fn new(secret: Option<&str>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("strand-webhook/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            secret: secret.map(|s| s.as_bytes().to_vec()),
        })
    }

    /// Serialize and sign a callback, returning the body and signature header.
    pub fn prepare(
        &self,
        callback: &WebhookCallback,
    ) -> Result<(Vec<u8>, Option<String>), DispatchError> {
        let body =
            serde_json::to_vec(callback).map_err(|e| DispatchError::Transport(e.to_string()))?;
        let signature = match &self.secret {
            Some(secret) => {
                Some(sign_body(secret, &body).map_err(|e| DispatchError::Transport(e.to_string()))?)
            }
            None => None,
        };
        Ok((body, signature))
    }
}

impl JobNotifier for HttpWebhookNotifier {
    async fn notify(&self, url: &str, callback: &WebhookCallback) -> Result<(), DispatchError> {
        let (body, signature) = self.prepare(callback)?;

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Transport(format!(
                "webhook {url} responded {status}"
            )));
        }

        tracing::debug!(job_id = %callback.job_id, url, "webhook delivered");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
