//! The observer aggregates delivery outcomes and reports them once per window.
//!
//! ```text
//!  orchestrators --try_send--> [filtered | primary | oversized | invalid] queues
//!                                              |
//!                                     aggregation loop --flush--> log, stats receiver,
//!                                                                 metadata reporter
//! ```
//!
//! Producers never wait on the observer: when a queue is full the update is dropped with a
//! warning. The loop is the only owner of the [ObserverBuffer]. When no update arrives within the
//! idle timeout it still checks whether the window is over, so quiet periods get reported too.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StatsConfig;
use crate::message::Message;
use crate::statsreceiver::{MetadataReporter, StatsReceiver};
use crate::target::TargetWriteResult;
use crate::{Error, Result};

/// Window accumulator and the summaries producers feed into it.
pub mod buffer;

use buffer::{FilterSummary, ObserverBuffer, WriteSummary};

const QUEUE_CAPACITY: usize = 1000;

struct Receivers {
    filtered: mpsc::Receiver<FilterSummary>,
    primary: mpsc::Receiver<WriteSummary>,
    oversized: mpsc::Receiver<WriteSummary>,
    invalid: mpsc::Receiver<WriteSummary>,
}

enum State {
    /// Holds the queue receivers while no loop runs. `None` only if a loop died without handing
    /// them back.
    Stopped(Option<Receivers>),
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<Receivers>,
    },
}

/// Collects delivery outcomes from any number of concurrent producers.
pub struct Observer<S> {
    filtered_tx: mpsc::Sender<FilterSummary>,
    primary_tx: mpsc::Sender<WriteSummary>,
    oversized_tx: mpsc::Sender<WriteSummary>,
    invalid_tx: mpsc::Sender<WriteSummary>,
    state: Mutex<State>,
    stats_receiver: Option<Arc<S>>,
    reporter: Option<Arc<MetadataReporter>>,
    idle_timeout: Duration,
    report_interval: Duration,
}

impl<S> Observer<S>
where
    S: StatsReceiver + Sync + 'static,
{
    pub fn new(
        config: &StatsConfig,
        stats_receiver: Option<S>,
        reporter: Option<MetadataReporter>,
    ) -> Self {
        let (filtered_tx, filtered) = mpsc::channel(QUEUE_CAPACITY);
        let (primary_tx, primary) = mpsc::channel(QUEUE_CAPACITY);
        let (oversized_tx, oversized) = mpsc::channel(QUEUE_CAPACITY);
        let (invalid_tx, invalid) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            filtered_tx,
            primary_tx,
            oversized_tx,
            invalid_tx,
            state: Mutex::new(State::Stopped(Some(Receivers {
                filtered,
                primary,
                oversized,
                invalid,
            }))),
            stats_receiver: stats_receiver.map(Arc::new),
            reporter: reporter.map(Arc::new),
            idle_timeout: config.buffer_timeout(),
            report_interval: config.report_interval(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running { .. })
    }

    /// Starts the aggregation loop. Calling it while the loop runs only logs a warning.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        let receivers = match &mut *state {
            State::Running { .. } => {
                warn!("Observer is already running");
                return Ok(());
            }
            State::Stopped(receivers) => receivers.take().ok_or_else(|| {
                Error::Observer("observer queues were lost by a previous run".to_string())
            })?,
        };

        let cancel = CancellationToken::new();
        let aggregator = Aggregator {
            stats_receiver: self.stats_receiver.clone(),
            reporter: self.reporter.clone(),
            idle_timeout: self.idle_timeout,
            report_interval: self.report_interval,
        };
        let handle = tokio::spawn(aggregator.run(receivers, cancel.clone()));
        *state = State::Running { cancel, handle };
        info!("Observer started");
        Ok(())
    }

    /// Stops the loop and waits for its final flush.
    pub async fn stop(&self) {
        info!("Observer stop called");
        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Stopped(None)) {
                State::Running { cancel, handle } => Some((cancel, handle)),
                stopped => {
                    *state = stopped;
                    None
                }
            }
        };
        let Some((cancel, handle)) = running else {
            return;
        };

        cancel.cancel();
        match handle.await {
            Ok(receivers) => *self.state.lock() = State::Stopped(Some(receivers)),
            Err(e) => warn!(error = ?e, "Observer loop ended abnormally"),
        }
    }

    /// Reports messages that were filtered and acked.
    pub fn filtered(&self, messages: &[Message]) {
        enqueue(&self.filtered_tx, FilterSummary::new(messages), "filtered");
    }

    /// Reports one write attempt against the primary target.
    pub fn target_write(&self, result: &TargetWriteResult, request_latency: Duration) {
        enqueue(
            &self.primary_tx,
            WriteSummary::new(result, request_latency),
            "primary",
        );
    }

    /// Reports one write attempt of oversized rows against the failure target.
    pub fn target_write_oversized(&self, result: &TargetWriteResult, request_latency: Duration) {
        enqueue(
            &self.oversized_tx,
            WriteSummary::new(result, request_latency),
            "oversized",
        );
    }

    /// Reports one write attempt of invalid rows against the failure target.
    pub fn target_write_invalid(&self, result: &TargetWriteResult, request_latency: Duration) {
        enqueue(
            &self.invalid_tx,
            WriteSummary::new(result, request_latency),
            "invalid",
        );
    }
}

fn enqueue<T>(tx: &mpsc::Sender<T>, update: T, queue: &'static str) {
    match tx.try_send(update) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!(queue, "Observer queue is full, dropping update"),
        Err(TrySendError::Closed(_)) => warn!(queue, "Observer queue is closed, dropping update"),
    }
}

/// State moved into the aggregation task.
struct Aggregator<S> {
    stats_receiver: Option<Arc<S>>,
    reporter: Option<Arc<MetadataReporter>>,
    idle_timeout: Duration,
    report_interval: Duration,
}

impl<S> Aggregator<S>
where
    S: StatsReceiver + Sync + 'static,
{
    async fn run(self, mut rx: Receivers, cancel: CancellationToken) -> Receivers {
        let mut buffer = ObserverBuffer::default();
        let mut window_start = Utc::now();
        let mut report_at = Instant::now() + self.report_interval;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Received exit signal, shutting down Observer");
                    drain(&mut rx, &mut buffer);
                    self.flush(&buffer, window_start, Utc::now()).await;
                    break;
                }
                Some(summary) = rx.filtered.recv() => buffer.append_filtered(&summary),
                Some(summary) = rx.primary.recv() => buffer.append_write(&summary),
                Some(summary) = rx.oversized.recv() => buffer.append_write_oversized(&summary),
                Some(summary) = rx.invalid.recv() => buffer.append_write_invalid(&summary),
                _ = tokio::time::sleep(self.idle_timeout) => {
                    debug!(timeout = ?self.idle_timeout, "Observer timed out waiting for result");
                }
            }

            if Instant::now() >= report_at {
                let window_end = Utc::now();
                self.flush(&buffer, window_start, window_end).await;
                buffer = ObserverBuffer::default();
                window_start = window_end;
                report_at = Instant::now() + self.report_interval;
            }
        }
        rx
    }

    async fn flush(
        &self,
        buffer: &ObserverBuffer,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) {
        info!("{buffer}");
        if let Some(receiver) = &self.stats_receiver
            && let Err(e) = receiver.send(buffer).await
        {
            warn!(error = %e, "Stats receiver failed");
        }
        if let Some(reporter) = &self.reporter
            && let Err(e) = reporter.send(buffer, window_start, window_end).await
        {
            warn!(error = %e, "Metadata reporter failed");
        }
    }
}

/// Folds whatever is still queued into the buffer.
fn drain(rx: &mut Receivers, buffer: &mut ObserverBuffer) {
    while let Ok(summary) = rx.filtered.try_recv() {
        buffer.append_filtered(&summary);
    }
    while let Ok(summary) = rx.primary.try_recv() {
        buffer.append_write(&summary);
    }
    while let Ok(summary) = rx.oversized.try_recv() {
        buffer.append_write_oversized(&summary);
    }
    while let Ok(summary) = rx.invalid.try_recv() {
        buffer.append_write_invalid(&summary);
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use parking_lot::Mutex;

    use super::buffer::ObserverBuffer;
    use crate::Result;
    use crate::statsreceiver::StatsReceiver;

    /// Keeps every buffer it receives.
    #[derive(Default)]
    pub(crate) struct RecordingReceiver {
        pub(crate) buffers: Mutex<Vec<ObserverBuffer>>,
    }

    impl StatsReceiver for RecordingReceiver {
        async fn send(&self, buffer: &ObserverBuffer) -> Result<()> {
            self.buffers.lock().push(buffer.clone());
            Ok(())
        }
    }
}
