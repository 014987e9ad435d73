use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{modules, web::AppState};

pub fn build_router(state: AppState) -> Router {
    let max_upload_bytes = state.config().max_upload_bytes;

    Router::new()
        .route("/healthz", get(healthz))
        .merge(modules::assignments::router(max_upload_bytes))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
