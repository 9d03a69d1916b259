//! The forwarder reads batches from the source and hands each one to a [DeliveryOrchestrator],
//! which drives it to a terminal state.
//!
//! ```text
//!                       +--> filtered ------------------------------------> ack
//!                       |
//! batch --> transform --+--> successful --> target --+--> sent ---------> ack
//!                       |                            +--> failed --------> retry
//!                       |                            +--> oversized --+
//!                       |                            +--> invalid ----+
//!                       +--> invalid ------------------------------------+--> failure target --> ack
//! ```
//!
//! Batches run concurrently, bounded by `concurrent_writes`. A batch that cannot be delivered
//! stops the forwarder; the runner then drains what is in flight, closes the targets and stops the
//! observer before returning the error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use chrono::Utc;
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FailureFormat, RetryConfig, Settings, SourceConfig};
use crate::failure::{FailureTarget, SnowplowFailure};
use crate::message::Message;
use crate::metrics::start_metrics_server;
use crate::observer::Observer;
use crate::source::{LineSource, Source};
use crate::statsreceiver::{MetadataReporter, PrometheusStatsReceiver, StatsReceiver};
use crate::target::{Target, TargetClient, TargetWriteResult};
use crate::transformer::{TransformationResult, Transformer};
use crate::{Error, Result};

/// Attempts to open a target before giving up.
const OPEN_ATTEMPTS: u16 = 5;

/// Where a write attempt goes. The two failure-target paths share a target but are reported
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Primary,
    Oversized,
    Invalid,
}

/// Delivers a single batch. It holds no per-batch state, so one instance serves every
/// concurrent batch.
pub struct DeliveryOrchestrator<T, F, S> {
    target: Arc<T>,
    failure: Arc<F>,
    transformer: Transformer,
    observer: Arc<Observer<S>>,
    retry: RetryConfig,
}

impl<T, F, S> DeliveryOrchestrator<T, F, S>
where
    T: Target + Sync + 'static,
    F: FailureTarget + Sync + 'static,
    S: StatsReceiver + Sync + 'static,
{
    pub fn new(
        target: Arc<T>,
        failure: Arc<F>,
        transformer: Transformer,
        observer: Arc<Observer<S>>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            target,
            failure,
            transformer,
            observer,
            retry,
        }
    }

    /// Returns once every message of the batch is filtered, sent to the target or sent to the
    /// failure target. Every message that gets there is acked.
    pub async fn deliver(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        // scripts may hold the thread for up to their run timeout
        let transformer = self.transformer.clone();
        let TransformationResult {
            successful,
            filtered,
            mut invalid,
        } = tokio::task::spawn_blocking(move || transformer.transform(&messages))
            .await
            .map_err(|e| Error::Transformer(format!("transformation task failed: {e}")))?;

        if !filtered.is_empty() {
            let now = Utc::now();
            let filtered: Vec<Message> = filtered
                .into_iter()
                .map(|mut msg| {
                    msg.time_finished = Some(now);
                    msg.ack();
                    msg
                })
                .collect();
            self.observer.filtered(&filtered);
        }

        let mut primary = self
            .write_with_retry(Destination::Primary, successful)
            .await?;
        if !primary.failed.is_empty() {
            return Err(Error::Target(format!(
                "{} messages could not be written to target {} after {} attempts",
                primary.failed.len(),
                self.target.id(),
                self.retry.max_attempts
            )));
        }

        if !primary.oversized.is_empty() {
            let rows = self.failure.oversized_rows(
                self.target.max_message_size_bytes(),
                std::mem::take(&mut primary.oversized),
            )?;
            self.write_failure_rows(Destination::Oversized, rows)
                .await?;
        }

        invalid.append(&mut primary.invalid);
        if !invalid.is_empty() {
            let rows = self.failure.invalid_rows(invalid)?;
            self.write_failure_rows(Destination::Invalid, rows).await?;
        }

        Ok(())
    }

    async fn write_failure_rows(&self, destination: Destination, rows: Vec<Message>) -> Result<()> {
        let result = self.write_with_retry(destination, rows).await?;
        if !result.failed.is_empty() {
            return Err(Error::FailureTarget(format!(
                "{} rows could not be written to failure target {} after {} attempts",
                result.failed.len(),
                self.failure.id(),
                self.retry.max_attempts
            )));
        }
        Ok(())
    }

    /// Writes `messages`, retrying only the ones that failed, until they are all sent or the
    /// attempt budget is spent. The returned result accumulates every attempt; its `failed` list
    /// holds whatever was still failing at the end.
    async fn write_with_retry(
        &self,
        destination: Destination,
        messages: Vec<Message>,
    ) -> Result<TargetWriteResult> {
        let mut outcome = TargetWriteResult::default();
        if messages.is_empty() {
            return Ok(outcome);
        }

        let mut backoff = Exponential::from_millis(
            self.retry.initial_delay_ms,
            self.retry.max_delay_ms,
            RetryConfig::FACTOR,
            RetryConfig::JITTER,
            Some(self.retry.max_attempts.saturating_sub(1)),
        );
        let mut retry_attempt = 0;
        let mut pending = messages;

        loop {
            let mut result = self.attempt(destination, pending).await?;
            let error_map: HashMap<String, usize> = result.error_codes();
            pending = std::mem::take(&mut result.failed);
            outcome.append(result);

            if pending.is_empty() {
                break;
            }

            match backoff.next() {
                Some(delay) => {
                    retry_attempt += 1;
                    warn!(
                        ?destination,
                        ?retry_attempt,
                        ?error_map,
                        remaining = pending.len(),
                        "Retrying failed messages"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        ?destination,
                        retry_attempts = ?retry_attempt,
                        errors = ?error_map,
                        remaining = pending.len(),
                        "Retries exhausted"
                    );
                    outcome.failed = pending;
                    break;
                }
            }
        }

        Ok(outcome)
    }

    /// One write call. Sent messages are acked before the result is reported to the observer.
    async fn attempt(
        &self,
        destination: Destination,
        messages: Vec<Message>,
    ) -> Result<TargetWriteResult> {
        let start = Instant::now();
        let mut result = match destination {
            Destination::Primary => self.target.write(messages).await,
            Destination::Oversized | Destination::Invalid => self.failure.write(messages).await,
        };
        let latency = start.elapsed();
        let now = Utc::now();
        for msg in &mut result.sent {
            msg.time_finished = Some(now);
            msg.ack();
        }
        debug!(
            ?destination,
            sent = result.sent.len(),
            failed = result.failed.len(),
            oversized = result.oversized.len(),
            invalid = result.invalid.len(),
            ?latency,
            "Write attempt"
        );

        match destination {
            Destination::Primary => self.observer.target_write(&result, latency),
            Destination::Oversized | Destination::Invalid => {
                if !result.oversized.is_empty() || !result.invalid.is_empty() {
                    return Err(Error::Fatal(format!(
                        "failure target {} rejected {} oversized and {} invalid rows",
                        self.failure.id(),
                        result.oversized.len(),
                        result.invalid.len()
                    )));
                }
                if destination == Destination::Oversized {
                    self.observer.target_write_oversized(&result, latency);
                } else {
                    self.observer.target_write_invalid(&result, latency);
                }
            }
        }
        Ok(result)
    }
}

/// Pulls batches from a [Source] and delivers them concurrently.
pub struct Forwarder<T, F, S> {
    orchestrator: Arc<DeliveryOrchestrator<T, F, S>>,
    concurrent_writes: usize,
    cancel: CancellationToken,
}

impl<T, F, S> Forwarder<T, F, S>
where
    T: Target + Sync + 'static,
    F: FailureTarget + Sync + 'static,
    S: StatsReceiver + Sync + 'static,
{
    pub fn new(
        orchestrator: Arc<DeliveryOrchestrator<T, F, S>>,
        concurrent_writes: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            concurrent_writes,
            cancel,
        }
    }

    /// Runs until the source is exhausted, the token is cancelled or a batch fails. In-flight
    /// batches are always awaited before returning. The first error wins.
    pub async fn run<Src: Source>(self, mut source: Src) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrent_writes));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut first_error = None;

        info!(source = source.name(), concurrent_writes = self.concurrent_writes, "Forwarder started");
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = tasks.join_next() => {
                    self.record(joined, &mut first_error);
                    continue;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|e| Error::Forwarder(format!("acquiring write permit: {e}")))?,
            };

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                read = source.read() => read,
            };
            let messages = match read {
                Ok(Some(messages)) => messages,
                Ok(None) => {
                    info!("Source exhausted");
                    break;
                }
                Err(e) => {
                    error!(?e, "Reading from source failed");
                    first_error.get_or_insert(e);
                    self.cancel.cancel();
                    break;
                }
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = orchestrator.deliver(messages).await;
                // the read loop may be parked on a quiet source, wake it up
                if result.is_err() {
                    cancel.cancel();
                }
                result
            });
        }

        info!(in_flight = tasks.len(), "Waiting for in-flight batches");
        while let Some(joined) = tasks.join_next().await {
            self.record(joined, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record(
        &self,
        joined: std::result::Result<Result<()>, JoinError>,
        first_error: &mut Option<Error>,
    ) {
        let err = match joined {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(e) => Error::Forwarder(format!("batch task failed: {e}")),
        };
        error!(?err, "Batch delivery failed, stopping");
        self.cancel.cancel();
        first_error.get_or_insert(err);
    }
}

/// Builds every component from `settings` and relays until the input ends, a shutdown signal
/// arrives or a batch cannot be delivered.
pub async fn run(settings: Settings) -> Result<()> {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let result = start(settings, cancel.clone()).await;
    cancel.cancel();
    result
}

async fn start(settings: Settings, cancel: CancellationToken) -> Result<()> {
    let transformer = Transformer::from_config(&settings.transform)?;
    info!(stages = transformer.len(), "Transformation chain ready");

    let target = Arc::new(TargetClient::from_config("target", &settings.target));
    let failure = Arc::new(match settings.failure_target.format {
        FailureFormat::Snowplow => SnowplowFailure::new(
            TargetClient::from_config("failure_target", &settings.failure_target.target),
            &settings.app,
        ),
    });
    let reporter = settings
        .metadata_reporter
        .as_ref()
        .map(|config| MetadataReporter::new(config, &settings.app))
        .transpose()?;
    let observer = Arc::new(Observer::new(
        &settings.stats,
        Some(PrometheusStatsReceiver::new()),
        reporter,
    ));

    if let Some(port) = settings.stats.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let metrics_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(addr, metrics_cancel).await {
                error!(?e, "Metrics server failed");
            }
        });
    }

    let source = match &settings.source {
        SourceConfig::Stdin(config) => LineSource::stdin(config),
    };
    relay(target, failure, transformer, observer, source, &settings, cancel).await
}

/// Opens the targets, forwards until the source stops, then tears down in reverse order: the
/// targets are closed and the observer flushes one last time.
async fn relay<T, F, S, Src>(
    target: Arc<T>,
    failure: Arc<F>,
    transformer: Transformer,
    observer: Arc<Observer<S>>,
    source: Src,
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<()>
where
    T: Target + Sync + 'static,
    F: FailureTarget + Sync + 'static,
    S: StatsReceiver + Sync + 'static,
    Src: Source,
{
    open_with_retry(target.id(), &settings.retry, || target.open()).await?;
    open_with_retry(failure.id(), &settings.retry, || failure.open()).await?;
    observer.start()?;

    let orchestrator = Arc::new(DeliveryOrchestrator::new(
        Arc::clone(&target),
        Arc::clone(&failure),
        transformer,
        Arc::clone(&observer),
        settings.retry.clone(),
    ));
    let result = Forwarder::new(orchestrator, settings.concurrent_writes.0, cancel.clone())
        .run(source)
        .await;

    if let Err(e) = target.close().await {
        warn!(?e, "Closing target failed");
    }
    if let Err(e) = failure.close().await {
        warn!(?e, "Closing failure target failed");
    }
    observer.stop().await;
    cancel.cancel();

    info!("Forwarder stopped");
    result
}

async fn open_with_retry<O, Fut>(id: &str, retry: &RetryConfig, open: O) -> Result<()>
where
    O: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let backoff = Exponential::from_millis(
        retry.initial_delay_ms,
        retry.max_delay_ms,
        RetryConfig::FACTOR,
        RetryConfig::JITTER,
        Some(OPEN_ATTEMPTS - 1),
    );
    Retry::new(backoff, open, |e: &Error| {
        warn!(target_id = id, ?e, "Opening target failed, retrying");
        true
    })
    .await?;
    info!(target_id = id, "Target opened");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
