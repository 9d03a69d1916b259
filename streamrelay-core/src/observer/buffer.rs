//! Aggregates delivery outcomes for one reporting window.
//!
//! Producers do not ship messages to the observer. They condense each result into a
//! [FilterSummary] or [WriteSummary] first, so the observer queues only hold a few numbers per
//! result.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::message::Message;
use crate::target::TargetWriteResult;

/// Groups per-message errors for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorKey {
    pub code: String,
    pub description: String,
}

/// Condensed view of a batch of filtered messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSummary {
    pub count: u64,
    pub max_filter_latency: Duration,
}

impl FilterSummary {
    pub fn new(messages: &[Message]) -> Self {
        let now = Utc::now();
        Self {
            count: messages.len() as u64,
            max_filter_latency: messages
                .iter()
                .map(|msg| elapsed(msg.time_pulled, msg.time_finished.unwrap_or(now)))
                .max()
                .unwrap_or_default(),
        }
    }
}

/// Condensed view of one [TargetWriteResult].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSummary {
    pub sent: u64,
    pub failed: u64,
    pub oversized: u64,
    pub invalid: u64,
    /// Pulled to finished, over sent messages.
    pub max_proc_latency: Duration,
    /// Created to finished, over sent messages.
    pub max_msg_latency: Duration,
    /// Pulled to transformed, over sent messages.
    pub max_transform_latency: Duration,
    /// How long the write call took.
    pub request_latency: Duration,
    /// Errors of retryable failures.
    pub failed_errors: HashMap<ErrorKey, u64>,
    /// Errors carried by messages that were delivered or rejected as invalid.
    pub invalid_errors: HashMap<ErrorKey, u64>,
}

impl WriteSummary {
    pub fn new(result: &TargetWriteResult, request_latency: Duration) -> Self {
        let now = Utc::now();
        let mut summary = Self {
            sent: result.sent.len() as u64,
            failed: result.failed.len() as u64,
            oversized: result.oversized.len() as u64,
            invalid: result.invalid.len() as u64,
            request_latency,
            ..Default::default()
        };

        for msg in &result.sent {
            let finished = msg.time_finished.unwrap_or(now);
            summary.max_proc_latency = summary
                .max_proc_latency
                .max(elapsed(msg.time_pulled, finished));
            summary.max_msg_latency = summary
                .max_msg_latency
                .max(elapsed(msg.time_created, finished));
            if let Some(transformed) = msg.time_transformed {
                summary.max_transform_latency = summary
                    .max_transform_latency
                    .max(elapsed(msg.time_pulled, transformed));
            }
        }

        count_errors(&mut summary.failed_errors, &result.failed);
        count_errors(
            &mut summary.invalid_errors,
            result.sent.iter().chain(&result.invalid),
        );
        summary
    }
}

fn count_errors<'a>(
    into: &mut HashMap<ErrorKey, u64>,
    messages: impl IntoIterator<Item = &'a Message>,
) {
    for err in messages.into_iter().filter_map(|msg| msg.error.as_ref()) {
        let key = ErrorKey {
            code: err.code().to_string(),
            description: err.safe_message().to_string(),
        };
        *into.entry(key).or_insert(0) += 1;
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

/// Counters and maxima for one reporting window. Everything here is cumulative for the window,
/// so a flush starts the next window from [Default::default].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObserverBuffer {
    pub target_results: u64,
    pub msg_sent: u64,
    pub msg_failed: u64,
    pub msg_total: u64,

    pub msg_filtered: u64,

    pub oversized_target_results: u64,
    pub oversized_msg_sent: u64,
    pub oversized_msg_failed: u64,
    pub oversized_msg_total: u64,

    pub invalid_target_results: u64,
    pub invalid_msg_sent: u64,
    pub invalid_msg_failed: u64,
    pub invalid_msg_total: u64,

    pub max_proc_latency: Duration,
    pub max_msg_latency: Duration,
    pub max_filter_latency: Duration,
    pub max_transform_latency: Duration,
    pub max_request_latency: Duration,

    pub failed_errors: HashMap<ErrorKey, u64>,
    pub invalid_errors: HashMap<ErrorKey, u64>,
}

impl ObserverBuffer {
    pub fn append_filtered(&mut self, summary: &FilterSummary) {
        self.msg_filtered += summary.count;
        self.max_filter_latency = self.max_filter_latency.max(summary.max_filter_latency);
    }

    /// A write to the primary target.
    pub fn append_write(&mut self, summary: &WriteSummary) {
        self.target_results += 1;
        self.msg_sent += summary.sent;
        self.msg_failed += summary.failed;
        self.msg_total += total(summary);
        self.append_write_summary(summary);
    }

    /// A write of oversized rows to the failure target.
    pub fn append_write_oversized(&mut self, summary: &WriteSummary) {
        self.oversized_target_results += 1;
        self.oversized_msg_sent += summary.sent;
        self.oversized_msg_failed += summary.failed;
        self.oversized_msg_total += total(summary);
        self.append_write_summary(summary);
    }

    /// A write of invalid rows to the failure target.
    pub fn append_write_invalid(&mut self, summary: &WriteSummary) {
        self.invalid_target_results += 1;
        self.invalid_msg_sent += summary.sent;
        self.invalid_msg_failed += summary.failed;
        self.invalid_msg_total += total(summary);
        self.append_write_summary(summary);
    }

    fn append_write_summary(&mut self, summary: &WriteSummary) {
        self.max_proc_latency = self.max_proc_latency.max(summary.max_proc_latency);
        self.max_msg_latency = self.max_msg_latency.max(summary.max_msg_latency);
        self.max_transform_latency = self
            .max_transform_latency
            .max(summary.max_transform_latency);
        self.max_request_latency = self.max_request_latency.max(summary.request_latency);
        merge(&mut self.failed_errors, &summary.failed_errors);
        merge(&mut self.invalid_errors, &summary.invalid_errors);
    }

    pub fn sum_results(&self) -> u64 {
        self.target_results + self.oversized_target_results + self.invalid_target_results
    }
}

fn total(summary: &WriteSummary) -> u64 {
    summary.sent + summary.failed + summary.oversized + summary.invalid
}

fn merge(into: &mut HashMap<ErrorKey, u64>, from: &HashMap<ErrorKey, u64>) {
    for (key, count) in from {
        *into.entry(key.clone()).or_insert(0) += count;
    }
}

impl fmt::Display for ObserverBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TargetResults:{},MsgFiltered:{},MsgSent:{},MsgFailed:{},\
             OversizedTargetResults:{},OversizedMsgSent:{},OversizedMsgFailed:{},\
             InvalidTargetResults:{},InvalidMsgSent:{},InvalidMsgFailed:{},\
             MaxProcLatency:{},MaxMsgLatency:{},MaxFilterLatency:{},MaxTransformLatency:{},\
             MaxRequestLatency:{}",
            self.target_results,
            self.msg_filtered,
            self.msg_sent,
            self.msg_failed,
            self.oversized_target_results,
            self.oversized_msg_sent,
            self.oversized_msg_failed,
            self.invalid_target_results,
            self.invalid_msg_sent,
            self.invalid_msg_failed,
            self.max_proc_latency.as_millis(),
            self.max_msg_latency.as_millis(),
            self.max_filter_latency.as_millis(),
            self.max_transform_latency.as_millis(),
            self.max_request_latency.as_millis(),
        )
    }
}
