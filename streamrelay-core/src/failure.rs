//! The failure target takes messages the primary target could not accept (oversized or invalid)
//! and writes them, wrapped as Snowplow bad rows, to a secondary [Target].
//!
//! Formatting a row and writing it are separate steps so a retried write resends the same rows
//! instead of wrapping an already wrapped payload again.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use crate::config::AppInfo;
use crate::message::Message;
use crate::target::{Target, TargetWriteResult};
use crate::{Error, Result};

const SIZE_VIOLATION_SCHEMA: &str =
    "iglu:com.snowplowanalytics.snowplow.badrows/size_violation/jsonschema/1-0-0";
const GENERIC_ERROR_SCHEMA: &str =
    "iglu:com.snowplowanalytics.snowplow.badrows/generic_error/jsonschema/1-0-0";
const SIZE_EXPECTATION: &str = "Expected payload to fit into requested target";

/// Set of items to be implemented by a failure target.
#[trait_variant::make(FailureTarget: Send)]
#[allow(dead_code)]
pub trait LocalFailureTarget {
    async fn open(&self) -> Result<()>;

    /// Wraps messages that exceeded `max_size_bytes` on the primary target.
    fn oversized_rows(&self, max_size_bytes: usize, messages: Vec<Message>) -> Result<Vec<Message>>;

    /// Wraps messages that carry an error.
    fn invalid_rows(&self, messages: Vec<Message>) -> Result<Vec<Message>>;

    /// Writes rows built by [LocalFailureTarget::oversized_rows] or
    /// [LocalFailureTarget::invalid_rows].
    async fn write(&self, rows: Vec<Message>) -> TargetWriteResult;

    async fn close(&self) -> Result<()>;

    fn max_message_size_bytes(&self) -> usize;

    fn id(&self) -> &str;
}

/// Writes Snowplow `size_violation` and `generic_error` bad rows.
pub struct SnowplowFailure<T> {
    target: T,
    artifact: String,
    version: String,
}

impl<T: Target> SnowplowFailure<T> {
    pub fn new(target: T, app: &AppInfo) -> Self {
        Self {
            target,
            artifact: app.name.clone(),
            version: app.version.clone(),
        }
    }

    /// The wrapped target.
    pub fn inner(&self) -> &T {
        &self.target
    }

    fn processor(&self) -> Value {
        json!({ "artifact": self.artifact, "version": self.version })
    }

    /// Replaces the payload of `msg` with `row`. The ack, partition key and error are kept so that
    /// delivering the row completes the original message and its error can still be reported.
    fn into_row(mut msg: Message, row: Vec<u8>) -> Message {
        msg.data = row.into();
        msg
    }
}

impl<T: Target + Sync> FailureTarget for SnowplowFailure<T> {
    async fn open(&self) -> Result<()> {
        self.target.open().await
    }

    fn oversized_rows(&self, max_size_bytes: usize, messages: Vec<Message>) -> Result<Vec<Message>> {
        messages
            .into_iter()
            .map(|msg| {
                let failure = json!({
                    "timestamp": timestamp(msg.time_pulled),
                    "maximumAllowedSizeBytes": max_size_bytes,
                    "actualSizeBytes": msg.len(),
                    "expectation": SIZE_EXPECTATION,
                });
                let row = bad_row(
                    SIZE_VIOLATION_SCHEMA,
                    self.processor(),
                    failure,
                    &String::from_utf8_lossy(&msg.data),
                    self.target.max_message_size_bytes(),
                )?;
                Ok(Self::into_row(msg, row))
            })
            .collect()
    }

    fn invalid_rows(&self, messages: Vec<Message>) -> Result<Vec<Message>> {
        messages
            .into_iter()
            .map(|msg| {
                let errors: Vec<String> = msg
                    .error
                    .iter()
                    .map(|err| {
                        if err.detail().is_empty() {
                            err.to_string()
                        } else {
                            err.detail().to_string()
                        }
                    })
                    .collect();
                let failure = json!({
                    "timestamp": timestamp(msg.time_pulled),
                    "errors": errors,
                });
                let row = bad_row(
                    GENERIC_ERROR_SCHEMA,
                    self.processor(),
                    failure,
                    &String::from_utf8_lossy(&msg.data),
                    self.target.max_message_size_bytes(),
                )?;
                Ok(Self::into_row(msg, row))
            })
            .collect()
    }

    async fn write(&self, rows: Vec<Message>) -> TargetWriteResult {
        self.target.write(rows).await
    }

    async fn close(&self) -> Result<()> {
        self.target.close().await
    }

    fn max_message_size_bytes(&self) -> usize {
        self.target.max_message_size_bytes()
    }

    fn id(&self) -> &str {
        self.target.id()
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn encode(schema: &str, processor: &Value, failure: &Value, payload: &str) -> Result<Vec<u8>> {
    let row = json!({
        "schema": schema,
        "data": {
            "processor": processor,
            "failure": failure,
            "payload": payload,
        },
    });
    serde_json::to_vec(&row).map_err(|e| Error::FailureTarget(format!("encoding bad row: {e}")))
}

/// Encodes a bad row that fits in `max_size` bytes, truncating the payload if it has to.
fn bad_row(
    schema: &str,
    processor: Value,
    failure: Value,
    payload: &str,
    max_size: usize,
) -> Result<Vec<u8>> {
    let row = encode(schema, &processor, &failure, payload)?;
    if row.len() <= max_size {
        return Ok(row);
    }

    let envelope = encode(schema, &processor, &failure, "")?.len();
    let Some(mut budget) = max_size.checked_sub(envelope).filter(|budget| *budget > 0) else {
        return Err(Error::FailureTarget(format!(
            "bad row envelope of {envelope} bytes does not fit into {max_size} bytes"
        )));
    };

    // escaping can grow the payload, so shrink until the encoded row fits
    loop {
        let row = encode(schema, &processor, &failure, truncate(payload, budget))?;
        if row.len() <= max_size {
            return Ok(row);
        }
        budget = budget * 9 / 10;
        if budget == 0 {
            return Err(Error::FailureTarget(format!(
                "payload cannot be truncated to fit a bad row into {max_size} bytes"
            )));
        }
    }
}

/// Longest prefix of `s` of at most `max_bytes` bytes that ends on a char boundary.
fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.get(..end).unwrap_or_default()
}
