use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use metrics::{counter, describe_counter, describe_gauge, histogram};
use std::time::Instant;

/// Records `http_requests_total` and `http_request_duration_seconds` per route.
pub async fn metrics_middleware(
    matched_path: Option<MatchedPath>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = matched_path
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method),
        ("path", path),
        ("status", status),
    ];

    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration);

    response
}

pub fn init_metrics() -> metrics_exporter_prometheus::PrometheusHandle {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    describe_counter!("anonchat_sessions_created_total", "Sessions opened by the matchmaker");
    describe_counter!("anonchat_sessions_ended_total", "Sessions ended, labelled by reason");
    describe_counter!("anonchat_search_timeouts_total", "Searches that timed out without a partner");
    describe_counter!("anonchat_warnings_total", "Warnings recorded from partner reports");
    describe_counter!("anonchat_bans_total", "Users banned");
    describe_gauge!("anonchat_waiting_users", "Users currently in the waiting pool");
    describe_gauge!("anonchat_active_sessions", "Sessions currently active");

    handle
}
