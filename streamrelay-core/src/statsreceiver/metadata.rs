use std::collections::HashMap;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AppInfo, MetadataReporterConfig};
use crate::observer::buffer::{ErrorKey, ObserverBuffer};
use crate::{Error, Result};

const EVENT_SCHEMA: &str =
    "iglu:com.snowplowanalytics.snowplow/event_forwarding_metrics/jsonschema/1-0-0";

const RETRY_BASE_MS: u64 = 200;
const RETRY_MAX_MS: u64 = 2000;
const RETRY_ATTEMPTS: u16 = 2;

#[derive(Debug, Serialize)]
struct SelfDescribing<'a> {
    schema: &'static str,
    data: Event<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Event<'a> {
    app_name: &'a str,
    app_version: &'a str,
    period_start: String,
    period_end: String,
    success_count: u64,
    filter_count: u64,
    failed_count: u64,
    invalid_count: u64,
    invalid_errors: Vec<AggregatedError>,
    /// Transient, retryable errors.
    failed_errors: Vec<AggregatedError>,
    tags: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct AggregatedError {
    code: String,
    description: String,
    count: u64,
}

#[derive(Error, Debug)]
enum ReportError {
    #[error("sending report: {0}")]
    Transport(String),
    #[error("report rejected with status {0}")]
    Rejected(StatusCode),
    #[error("collector answered with status {0}")]
    Server(StatusCode),
}

/// Reports every closed window to an HTTP endpoint. Client errors are not retried; transport
/// and server errors are, a couple of times with backoff.
pub struct MetadataReporter {
    client: Client,
    endpoint: String,
    tags: HashMap<String, String>,
    app: AppInfo,
}

impl MetadataReporter {
    pub fn new(config: &MetadataReporterConfig, app: &AppInfo) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec))
            .build()
            .map_err(|e| Error::StatsReceiver(format!("Creating metadata reporter client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            tags: config.tags.clone(),
            app: app.clone(),
        })
    }

    fn event(
        &self,
        buffer: &ObserverBuffer,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> SelfDescribing<'_> {
        SelfDescribing {
            schema: EVENT_SCHEMA,
            data: Event {
                app_name: &self.app.name,
                app_version: &self.app.version,
                period_start: window_start.to_rfc3339_opts(SecondsFormat::Millis, true),
                period_end: window_end.to_rfc3339_opts(SecondsFormat::Millis, true),
                success_count: buffer.msg_sent,
                filter_count: buffer.msg_filtered,
                failed_count: buffer.msg_failed,
                invalid_count: buffer.invalid_msg_total,
                invalid_errors: aggregate(&buffer.invalid_errors),
                failed_errors: aggregate(&buffer.failed_errors),
                tags: &self.tags,
            },
        }
    }

    pub async fn send(
        &self,
        buffer: &ObserverBuffer,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<()> {
        let event = self.event(buffer, window_start, window_end);
        let post = || {
            let request = self.client.post(&self.endpoint).json(&event).send();
            async move {
                let status = match request.await {
                    Ok(response) => response.status(),
                    Err(e) => return Err(ReportError::Transport(e.to_string())),
                };
                if status.is_success() {
                    return Ok(());
                }
                if status.is_client_error() {
                    return Err(ReportError::Rejected(status));
                }
                Err(ReportError::Server(status))
            }
        };
        let retryable = |e: &ReportError| {
            let retry = !matches!(e, ReportError::Rejected(_));
            if retry {
                warn!(error = %e, "Sending metadata report failed, retrying");
            }
            retry
        };

        let backoff =
            Exponential::from_millis(RETRY_BASE_MS, RETRY_MAX_MS, 2.0, 0.5, Some(RETRY_ATTEMPTS));
        Retry::new(backoff, post, retryable)
            .await
            .map_err(|e| Error::StatsReceiver(e.to_string()))?;
        debug!(endpoint = %self.endpoint, "Sent metadata report");
        Ok(())
    }
}

fn aggregate(errors: &HashMap<ErrorKey, u64>) -> Vec<AggregatedError> {
    let mut aggregated: Vec<AggregatedError> = errors
        .iter()
        .map(|(key, count)| AggregatedError {
            code: key.code.clone(),
            description: key.description.clone(),
            count: *count,
        })
        .collect();
    aggregated.sort_by(|a, b| (&a.code, &a.description).cmp(&(&b.code, &b.description)));
    aggregated
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Clone, Default)]
    struct Collector {
        bodies: Arc<Mutex<Vec<Value>>>,
        hits: Arc<Mutex<usize>>,
    }

    async fn accept(State(collector): State<Collector>, Json(body): Json<Value>) -> AxumStatus {
        *collector.hits.lock() += 1;
        collector.bodies.lock().push(body);
        AxumStatus::OK
    }

    async fn reject(State(collector): State<Collector>) -> AxumStatus {
        *collector.hits.lock() += 1;
        AxumStatus::BAD_REQUEST
    }

    async fn serve(collector: Collector) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new()
            .route("/report", post(accept))
            .route("/reject", post(reject))
            .with_state(collector);
        tokio::spawn(async move { axum::serve(listener, router).await });
        addr
    }

    fn reporter(endpoint: String) -> MetadataReporter {
        let config = MetadataReporterConfig {
            endpoint,
            tags: HashMap::from([("env".to_string(), "test".to_string())]),
            timeout_sec: 2,
        };
        let app = AppInfo {
            name: "streamrelay".to_string(),
            version: "1.2.3".to_string(),
        };
        MetadataReporter::new(&config, &app).unwrap()
    }

    fn buffer() -> ObserverBuffer {
        let mut buffer = ObserverBuffer {
            msg_sent: 10,
            msg_filtered: 2,
            msg_failed: 1,
            invalid_msg_total: 3,
            ..Default::default()
        };
        buffer.invalid_errors.insert(
            ErrorKey {
                code: "TypeError".to_string(),
                description: "error running JavaScript function [main]".to_string(),
            },
            3,
        );
        buffer
    }

    #[tokio::test]
    async fn test_posts_event() {
        let collector = Collector::default();
        let addr = serve(collector.clone()).await;
        let reporter = reporter(format!("http://{addr}/report"));

        let start = Utc::now();
        let end = start + chrono::TimeDelta::seconds(1);
        reporter.send(&buffer(), start, end).await.unwrap();

        let bodies = collector.bodies.lock().clone();
        assert_eq!(bodies.len(), 1);
        let body = &bodies[0];
        assert_eq!(body["schema"], EVENT_SCHEMA);
        assert_eq!(body["data"]["appName"], "streamrelay");
        assert_eq!(body["data"]["appVersion"], "1.2.3");
        assert_eq!(body["data"]["successCount"], 10);
        assert_eq!(body["data"]["filterCount"], 2);
        assert_eq!(body["data"]["failedCount"], 1);
        assert_eq!(body["data"]["invalidCount"], 3);
        assert_eq!(
            body["data"]["invalidErrors"],
            json!([{"code": "TypeError", "description": "error running JavaScript function [main]", "count": 3}])
        );
        assert_eq!(body["data"]["failedErrors"], json!([]));
        assert_eq!(body["data"]["tags"], json!({"env": "test"}));
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let collector = Collector::default();
        let addr = serve(collector.clone()).await;
        let reporter = reporter(format!("http://{addr}/reject"));

        let result = reporter.send(&buffer(), Utc::now(), Utc::now()).await;
        assert!(matches!(result, Err(Error::StatsReceiver(_))));
        assert_eq!(*collector.hits.lock(), 1);
    }
}
