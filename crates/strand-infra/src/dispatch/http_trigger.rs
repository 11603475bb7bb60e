//! Remote dispatch over the `POST /workers/trigger` endpoint.

use std::time::Duration;

use strand_core::job::{DispatchError, DispatchTarget};
use strand_types::job::{TriggerRequest, TriggerResponse};

/// Posts trigger requests to `{base_url}/workers/trigger`.
pub struct HttpTriggerTarget {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTriggerTarget {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("strand-dispatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: trigger_endpoint(base_url),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn trigger_endpoint(base_url: &str) -> String {
    format!("{}/workers/trigger", base_url.trim_end_matches('/'))
}

impl DispatchTarget for HttpTriggerTarget {
    fn name(&self) -> &str {
        "http"
    }

    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerResponse, DispatchError> {
        tracing::debug!(
            endpoint = %self.endpoint,
            job_id = %request.body.job_id,
            worker_id = %request.worker_id,
            "posting trigger request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Transport(format!(
                "trigger endpoint responded {status}: {body}"
            )));
        }

        response
            .json::<TriggerResponse>()
            .await
            .map_err(|e| DispatchError::Transport(format!("invalid trigger response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use strand_types::job::TriggerBody;
    use uuid::Uuid;

    #[test]
    fn endpoint_joins_base_url() {
        assert_eq!(
            trigger_endpoint("http://workers.internal:8080/"),
            "http://workers.internal:8080/workers/trigger"
        );
        let target = HttpTriggerTarget::new("http://localhost:9", Duration::from_secs(1)).unwrap();
        assert_eq!(target.endpoint(), "http://localhost:9/workers/trigger");
        assert_eq!(DispatchTarget::name(&target), "http");
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target =
            HttpTriggerTarget::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let job_id = Uuid::now_v7();
        let request = TriggerRequest {
            worker_id: "echo".to_string(),
            body: TriggerBody {
                worker_id: "echo".to_string(),
                job_id,
                input: json!({}),
                context: json!({}),
                webhook_url: None,
                metadata: json!({}),
                timestamp: Utc::now(),
            },
        };

        let err = target.trigger(&request).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }
}
