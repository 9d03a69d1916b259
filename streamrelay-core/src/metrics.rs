//! Prometheus metrics, exposed on `GET /metrics`.
//!
//! Every metric lives in one process wide [Registry]. The observer feeds it once per reporting
//! window through [crate::statsreceiver::PrometheusStatsReceiver].

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Error;

const REGISTRY_PREFIX: &str = "streamrelay";

// counters; the `_total` suffix is added by the client library
const TARGET_RESULTS_TOTAL: &str = "target_results";
const MESSAGES_TOTAL: &str = "messages";
const FILTERED_TOTAL: &str = "filtered";
const ERRORS_TOTAL: &str = "errors";

// per window maxima, in milliseconds
const MAX_LATENCY: &str = "max_latency_ms";

pub(crate) const TARGET_LABEL: &str = "target";
pub(crate) const STATUS_LABEL: &str = "status";
pub(crate) const CATEGORY_LABEL: &str = "category";
pub(crate) const CODE_LABEL: &str = "code";
pub(crate) const STAGE_LABEL: &str = "stage";

/// The global register of all metrics.
struct GlobalRegistry {
    // registration happens once, so a blocking mutex is fine
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

type Labels = Vec<(String, String)>;

/// Metrics describing delivery outcomes.
pub(crate) struct RelayMetrics {
    /// Write calls, labelled by target (`primary`, `oversized`, `invalid`).
    pub(crate) target_results_total: Family<Labels, Counter>,
    /// Messages per target and status (`sent`, `failed`).
    pub(crate) messages_total: Family<Labels, Counter>,
    pub(crate) filtered_total: Counter,
    /// Per-message errors by category (`failed`, `invalid`) and code.
    pub(crate) errors_total: Family<Labels, Counter>,
    /// Largest latency of the last window, by stage.
    pub(crate) max_latency: Family<Labels, Gauge>,
}

impl RelayMetrics {
    fn new() -> Self {
        let metrics = Self {
            target_results_total: Family::<Labels, Counter>::default(),
            messages_total: Family::<Labels, Counter>::default(),
            filtered_total: Counter::default(),
            errors_total: Family::<Labels, Counter>::default(),
            max_latency: Family::<Labels, Gauge>::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            TARGET_RESULTS_TOTAL,
            "A Counter to keep track of the number of write calls per target",
            metrics.target_results_total.clone(),
        );
        registry.register(
            MESSAGES_TOTAL,
            "A Counter to keep track of the number of messages written per target and status",
            metrics.messages_total.clone(),
        );
        registry.register(
            FILTERED_TOTAL,
            "A Counter to keep track of the number of messages filtered by the transformations",
            metrics.filtered_total.clone(),
        );
        registry.register(
            ERRORS_TOTAL,
            "A Counter to keep track of per-message errors by category and code",
            metrics.errors_total.clone(),
        );
        registry.register(
            MAX_LATENCY,
            "A Gauge holding the largest latency observed in the last reporting window",
            metrics.max_latency.clone(),
        );
        metrics
    }
}

static RELAY_METRICS: OnceLock<RelayMetrics> = OnceLock::new();

pub(crate) fn relay_metrics() -> &'static RelayMetrics {
    RELAY_METRICS.get_or_init(RelayMetrics::new)
}

pub(crate) fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Renders the registry in the OpenMetrics text format.
pub async fn metrics_handler() -> impl IntoResponse {
    // make sure the relay metrics are registered even before the first flush
    relay_metrics();

    let mut buffer = String::new();
    let encoded = {
        let registry = global_registry().registry.lock();
        encode(&mut buffer, &registry)
    };
    if let Err(e) = encoded {
        error!(?e, "Encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);

    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .map(IntoResponse::into_response)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves the metrics endpoints until `cancel` fires.
pub async fn start_metrics_server(addr: SocketAddr, cancel: CancellationToken) -> crate::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Metrics server listening");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))
}
