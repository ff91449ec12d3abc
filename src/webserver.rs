use crate::crd::SyncResult;
use crate::events::CounterSnapshot;
use crate::state::SharedState;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn metrics(State(state): State<SharedState>) -> Json<CounterSnapshot> {
    Json(state.counters.snapshot())
}

async fn resources(State(state): State<SharedState>) -> Json<Vec<SyncResult>> {
    Json(state.resources().await)
}

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/metrics", get(metrics))
        .route("/resources", get(resources))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serve(state: SharedState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, create_app(state)).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_probes_return_no_content() {
        let base = serve(SharedState::default()).await;
        for path in ["/health/live", "/health/ready"] {
            let response = reqwest::get(format!("{}{}", base, path)).await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        }
    }

    #[tokio::test]
    async fn test_metrics_and_resources_are_served() {
        let state = SharedState::default();
        state.counters.inc("web.sync.success");
        state
            .set_resources(
                "shop",
                "web",
                vec![SyncResult {
                    namespace: "shop".to_string(),
                    name: "web".to_string(),
                    kind: "Deployment".to_string(),
                    container: "app".to_string(),
                    version: "v2".to_string(),
                    container_version: "web".to_string(),
                    tag: "stable".to_string(),
                }],
            )
            .await;
        let base = serve(state).await;

        let metrics: serde_json::Value = reqwest::get(format!("{}/metrics", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics, serde_json::json!({ "web.sync.success": 1 }));

        let resources: serde_json::Value = reqwest::get(format!("{}/resources", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resources[0]["containerVersion"], "web");
        assert_eq!(resources[0]["version"], "v2");
    }
}
