//! HTTP request metrics middleware, applied to both the connection-plane
//! and observability routers. Grounded on the teacher's
//! `metrics_middleware.rs`: request counts, durations, and an in-flight
//! gauge, labelled by endpoint/method/status.

use std::time::Instant;

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use wsgate_metrics::{http as http_metrics, labels};

pub async fn http_metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request.uri().path().to_string();

    metrics::gauge!(
        http_metrics::REQUESTS_IN_FLIGHT,
        labels::ENDPOINT => endpoint.clone(),
        labels::METHOD => method.clone()
    )
    .increment(1.0);

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let duration = start.elapsed().as_secs_f64();

    metrics::counter!(
        http_metrics::REQUESTS_TOTAL,
        labels::ENDPOINT => endpoint.clone(),
        labels::METHOD => method.clone(),
        labels::STATUS => status.clone()
    )
    .increment(1);

    metrics::histogram!(
        http_metrics::REQUEST_DURATION_SECONDS,
        labels::ENDPOINT => endpoint.clone(),
        labels::METHOD => method.clone(),
        labels::STATUS => status
    )
    .record(duration);

    metrics::gauge!(
        http_metrics::REQUESTS_IN_FLIGHT,
        labels::ENDPOINT => endpoint,
        labels::METHOD => method
    )
    .decrement(1.0);

    response
}
