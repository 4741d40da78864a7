use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use k8s_openapi::List;
use k8s_openapi::api::core::v1::Pod;
use tower_http::trace::TraceLayer;

use crate::provider::PodLifecycle;

/// Source of the pods bound to this node, as seen by the cluster.
pub trait PodLister: Send + Sync {
    fn list(&self) -> Vec<Pod>;
}

impl PodLister for Vec<Pod> {
    fn list(&self) -> Vec<Pod> {
        self.clone()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub pods: Arc<dyn PodLister>,
    pub provider: Arc<dyn PodLifecycle>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/pods", get(pods))
        .route("/runningpods", get(running_pods))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn pods(State(state): State<ApiState>) -> Json<List<Pod>> {
    Json(List {
        items: state.pods.list(),
        metadata: Default::default(),
    })
}

async fn running_pods(State(state): State<ApiState>) -> Response {
    match state.provider.get_pods().await {
        Ok(items) => Json(List {
            items,
            metadata: Default::default(),
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found\n")
}
