//! External sign-off gate, asked to approve a version before it is rolled out.

use crate::config;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, retry_with_backoff};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOffRequest {
    pub kcd_name: String,
    pub kcd_namespace: String,
    pub kcd_labels: BTreeMap<String, String>,
    pub kcd_tag: String,
    pub kcd_image_repo: String,
    pub versions: Vec<String>,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignOffReview {
    pub result: bool,
    #[serde(default)]
    pub uuid: String,
}

pub struct SignOffGate {
    client: Client,
    endpoint: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl SignOffGate {
    pub fn new(client: Client, config: &config::SignOff) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            retry: config.retry.clone(),
        }
    }

    /// One request to the gate. Transport errors, error statuses and unreadable bodies all fail.
    pub async fn review(&self, request: &SignOffRequest) -> Result<SignOffReview> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SignOff(format!(
                "{} returned status {}",
                self.endpoint, status
            )));
        }
        Ok(response.json().await?)
    }

    /// Asks the gate with retries and returns its verdict. Exhausted retries return the last error.
    pub async fn approve(&self, request: &SignOffRequest) -> Result<bool> {
        debug!(
            "Requesting sign-off for {}/{} versions {:?}",
            request.kcd_namespace, request.kcd_name, request.versions
        );
        let review =
            retry_with_backoff(&self.retry, "sign-off", |_| true, move || self.review(request))
                .await?;
        info!(
            "Sign-off review for {}/{} is {} with uuid {}",
            request.kcd_namespace, request.kcd_name, review.result, review.uuid
        );
        Ok(review.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Gate {
        calls: Arc<AtomicUsize>,
        failures: usize,
        bodies: Arc<std::sync::Mutex<Vec<serde_json::Value>>>,
    }

    async fn signoff(
        State(gate): State<Gate>,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> impl IntoResponse {
        gate.bodies.lock().unwrap().push(body);
        let call = gate.calls.fetch_add(1, Ordering::SeqCst);
        if call < gate.failures {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        axum::Json(serde_json::json!({ "result": true, "uuid": "4f1c" })).into_response()
    }

    async fn serve(failures: usize) -> (String, Gate) {
        let gate = Gate {
            calls: Arc::new(AtomicUsize::new(0)),
            failures,
            bodies: Arc::default(),
        };
        let app = Router::new()
            .route("/signoff", post(signoff))
            .with_state(gate.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/signoff", addr), gate)
    }

    fn gate(endpoint: String) -> SignOffGate {
        SignOffGate::new(
            Client::new(),
            &config::SignOff {
                endpoint,
                timeout_seconds: 5,
                retry: RetryPolicy {
                    max_attempts: 3,
                    initial_delay_ms: 1,
                    multiplier: 2.0,
                    max_delay_ms: 10,
                },
            },
        )
    }

    fn request() -> SignOffRequest {
        SignOffRequest {
            kcd_name: "web".to_string(),
            kcd_namespace: "default".to_string(),
            kcd_labels: BTreeMap::from([("team".to_string(), "shop".to_string())]),
            kcd_tag: "stable".to_string(),
            kcd_image_repo: "registry.example.com/app".to_string(),
            versions: vec!["v2".to_string()],
            digest: "sha256:b".to_string(),
        }
    }

    #[tokio::test]
    async fn test_third_attempt_succeeds() {
        let (endpoint, server) = serve(2).await;

        assert!(gate(endpoint).approve(&request()).await.unwrap());
        assert_eq!(server.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_the_last_error() {
        let (endpoint, server) = serve(usize::MAX).await;

        let err = gate(endpoint).approve(&request()).await.unwrap_err();
        assert!(matches!(err, Error::SignOff(_)));
        assert_eq!(server.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let err = gate("http://127.0.0.1:9/signoff".to_string())
            .approve(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }

    #[tokio::test]
    async fn test_request_body_uses_gate_field_names() {
        let (endpoint, server) = serve(0).await;
        gate(endpoint).review(&request()).await.unwrap();

        let body = server.bodies.lock().unwrap()[0].clone();
        assert_eq!(
            body,
            serde_json::json!({
                "kcdName": "web",
                "kcdNamespace": "default",
                "kcdLabels": { "team": "shop" },
                "kcdTag": "stable",
                "kcdImageRepo": "registry.example.com/app",
                "versions": ["v2"],
                "digest": "sha256:b"
            })
        );
    }
}
