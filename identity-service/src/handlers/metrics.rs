use service_core::axum::{http::header, response::IntoResponse};

use crate::services::metrics::get_metrics;

/// Prometheus text exposition.
pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        get_metrics(),
    )
}
