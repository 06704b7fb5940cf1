use axum::{
    Json, Router,
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{media, resource, scan, setup, sources};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/setup/source/validate", post(setup::validate_source))
        .route("/setup/source", post(setup::create_source))
        .route("/media-sources", get(sources::list_sources))
        .route("/media-sources/{id}", delete(sources::delete_source))
        .route("/scan/start", post(scan::start_scan))
        .route("/scan/status", get(scan::scan_status))
        .route("/media-list", get(media::media_list))
        .route("/media/{id}/tag", post(media::set_tag))
        .route("/media/{id}/thumbnail", get(media::thumbnail))
        .route("/media-resource/{id}", get(resource::media_resource))
        .route("/session/seed", get(media::session_seed))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
