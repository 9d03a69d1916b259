//! A [Target] is where transformed messages are delivered. Every write sorts its input into a
//! [TargetWriteResult]; per-message problems never surface as an `Err`, so the caller can always
//! tell which messages to retry, which to reroute and which are done.
//!
//! Builtin targets are selected through [crate::config::TargetConfig] and wrapped in
//! [TargetClient].

use std::collections::HashMap;

use crate::Result;
use crate::message::Message;

/// Builtin targets selected by configuration.
mod client;

/// Appends newline delimited payloads to a file.
mod file;

/// Logs every payload.
mod log;

/// Accepts and discards everything, like `/dev/null`.
mod silent;

#[cfg(test)]
pub(crate) mod test_utils;

pub use client::TargetClient;
pub use file::FileTarget;
pub use log::LogTarget;
pub use silent::SilentTarget;

/// Set of items to be implemented by a delivery target. Implementations are shared by concurrent
/// batches and must be safe for concurrent use.
#[trait_variant::make(Target: Send)]
#[allow(dead_code)]
pub trait LocalTarget {
    /// Called once before the first write.
    async fn open(&self) -> Result<()>;

    /// Writes the messages. Every input message ends up in exactly one list of the result.
    async fn write(&self, messages: Vec<Message>) -> TargetWriteResult;

    /// Called once after the last write.
    async fn close(&self) -> Result<()>;

    /// Largest payload the target accepts; anything bigger is reported as oversized.
    fn max_message_size_bytes(&self) -> usize;

    fn id(&self) -> &str;
}

/// Outcome of one write attempt. The four lists are disjoint.
#[derive(Debug, Default)]
pub struct TargetWriteResult {
    /// Delivered.
    pub sent: Vec<Message>,
    /// Retryable failures.
    pub failed: Vec<Message>,
    /// Too large for this target.
    pub oversized: Vec<Message>,
    /// Rejected for their content; retrying will not help.
    pub invalid: Vec<Message>,
}

impl TargetWriteResult {
    pub fn new(
        sent: Vec<Message>,
        failed: Vec<Message>,
        oversized: Vec<Message>,
        invalid: Vec<Message>,
    ) -> Self {
        Self {
            sent,
            failed,
            oversized,
            invalid,
        }
    }

    /// A result where every message was delivered.
    pub fn all_sent(sent: Vec<Message>) -> Self {
        Self {
            sent,
            ..Default::default()
        }
    }

    pub fn total(&self) -> usize {
        self.sent.len() + self.failed.len() + self.oversized.len() + self.invalid.len()
    }

    pub fn append(&mut self, other: TargetWriteResult) {
        self.sent.extend(other.sent);
        self.failed.extend(other.failed);
        self.oversized.extend(other.oversized);
        self.invalid.extend(other.invalid);
    }

    /// Number of messages per error code among the failed and invalid lists.
    pub fn error_codes(&self) -> HashMap<String, usize> {
        let mut codes = HashMap::new();
        for err in self
            .failed
            .iter()
            .chain(&self.invalid)
            .filter_map(|msg| msg.error.as_ref())
        {
            *codes.entry(err.code().to_string()).or_insert(0) += 1;
        }
        codes
    }
}
