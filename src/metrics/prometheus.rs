//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge,
    CounterVec, Encoder, GaugeVec, HistogramVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "app_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "app_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "app_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Keys dropped without further retries
    pub static ref DROPPED_KEYS: CounterVec = register_counter_vec!(
        "app_operator_dropped_keys_total",
        "Keys dropped after a permanent error or the retry ceiling",
        &["kind", "reason"]
    ).unwrap();

    /// Mutating calls issued for derived resources
    pub static ref DERIVED_OPERATIONS: CounterVec = register_counter_vec!(
        "app_operator_derived_operations_total",
        "Create, update and delete calls issued for derived resources",
        &["kind", "action"]
    ).unwrap();

    /// Keys ready in each work queue
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "app_operator_workqueue_depth",
        "Number of keys ready to be processed",
        &["queue"]
    ).unwrap();

    /// Keys added to each work queue
    pub static ref QUEUE_ADDS: CounterVec = register_counter_vec!(
        "app_operator_workqueue_adds_total",
        "Total number of keys added to the work queue",
        &["queue"]
    ).unwrap();

    /// Rate-limited requeues per work queue
    pub static ref QUEUE_RETRIES: CounterVec = register_counter_vec!(
        "app_operator_workqueue_retries_total",
        "Total number of rate-limited requeues",
        &["queue"]
    ).unwrap();

    /// Controllers still waiting for their caches
    pub static ref CONTROLLERS_SYNCING: IntGauge = register_int_gauge!(
        "app_operator_controllers_syncing",
        "Number of controllers whose caches have not synced yet"
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "app_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    // Set initial health
    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

/// Ready once every started controller has synced its caches
fn ready_response() -> Response<Full<Bytes>> {
    if CONTROLLERS_SYNCING.get() == 0 && OPERATOR_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
