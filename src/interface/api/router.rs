//! API Router configuration

use super::device_handler::{
    add_session, bye, bye2, get_session, health_check, invite, invite_without_bye, query, route,
    AppState,
};
use super::metrics_handler::metrics_handler;
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the operator API router
pub fn build_router(state: AppState, prometheus_handle: PrometheusHandle) -> Router {
    let session_routes = Router::new()
        .route("/getSession", get(get_session))
        .route("/addSession", post(add_session))
        .route("/route", get(route))
        .route("/health", get(health_check));

    let signaling_routes = Router::new()
        .route("/invite", post(invite))
        .route("/inviteWithoutBye", post(invite_without_bye))
        .route("/bye", post(bye))
        .route("/bye2", post(bye2))
        .route("/query", post(query));

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(session_routes)
        .merge(signaling_routes)
        .with_state(state)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
