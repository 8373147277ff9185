use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tracing::error;

use crate::blob::BlobStore;
use crate::pipeline::{ChunkPipeline, PipelineStore};

pub async fn index() -> &'static str {
    "chunk worker"
}

async fn liveness<S: PipelineStore, B: BlobStore + 'static>(
    State(pipeline): State<Arc<ChunkPipeline<S, B>>>,
) -> Response {
    Json(pipeline.status().await).into_response()
}

async fn lock_state<S: PipelineStore, B: BlobStore + 'static>(
    State(pipeline): State<Arc<ChunkPipeline<S, B>>>,
) -> Response {
    match pipeline.lock_state().await {
        Ok(state) => Json(state).into_response(),
        Err(e) => {
            error!("failed to read processing lock: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// Status routes for a running pipeline. Metrics routes are added by the caller, since they
/// touch the global recorder.
pub fn app<S, B>(pipeline: Arc<ChunkPipeline<S, B>>) -> Router
where
    S: PipelineStore,
    B: BlobStore + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(liveness::<S, B>))
        .route("/lock", get(lock_state::<S, B>))
        .with_state(pipeline)
}
