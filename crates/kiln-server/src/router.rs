use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::handler::{self, AppState};
use kiln_core::Dispatcher;

/// Build the axum router with all kiln endpoints.
pub fn build_router(dispatcher: Dispatcher, config: &ServerConfig) -> Router {
    let state = AppState {
        dispatcher,
        allow_flush: config.allow_flush,
    };
    Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route("/v1/process", post(handler::process_handler))
        .route("/v1/retrieve", post(handler::retrieve_handler))
        .route("/v1/exists/:module/:oid", get(handler::exists_handler))
        .route("/v1/field/:module/:oid/:field", get(handler::field_handler))
        .route("/v1/oids/:oid", delete(handler::flush_oid_handler))
        .route("/v1/modules", get(handler::modules_handler))
        .route(
            "/v1/modules/:module",
            get(handler::module_doc_handler).delete(handler::flush_module_handler),
        )
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
