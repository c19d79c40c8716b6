//! Prometheus metrics handler

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and describe the gateway metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_gauge!("gb_sessions", "Device sessions held by this instance");
    describe_counter!("gb_registrations_total", "Successful device registrations");
    describe_counter!("gb_invites_total", "Stream INVITEs sent");
    describe_counter!("gb_invites_failed", "Stream INVITEs that did not reach a 200");
    describe_counter!("gb_byes_total", "Dialogs closed by the gateway");

    Ok(handle)
}

/// Handle backed by a recorder that is not installed globally
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> Response {
    (StatusCode::OK, handle.render()).into_response()
}
