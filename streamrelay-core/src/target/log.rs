use tracing::info;

use super::{Target, TargetWriteResult};
use crate::Result;
use crate::error::MessageError;
use crate::message::{Message, split_oversized};

pub struct LogTarget {
    id: String,
    max_message_size_bytes: usize,
}

impl LogTarget {
    pub fn new(id: impl Into<String>, max_message_size_bytes: usize) -> Self {
        Self {
            id: id.into(),
            max_message_size_bytes,
        }
    }
}

impl Target for LogTarget {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Payloads that are not UTF-8 cannot be written as a log line and are reported invalid.
    async fn write(&self, messages: Vec<Message>) -> TargetWriteResult {
        let (fit, oversized) = split_oversized(messages, self.max_message_size_bytes);
        let mut result = TargetWriteResult {
            oversized,
            ..Default::default()
        };

        for mut msg in fit {
            let line = match std::str::from_utf8(&msg.data) {
                Ok(line) => line,
                Err(e) => {
                    msg.set_error(MessageError::target(
                        "InvalidPayload",
                        "payload is not valid UTF-8",
                        e.to_string(),
                    ));
                    result.invalid.push(msg);
                    continue;
                }
            };

            let mut headers = String::new();
            if let Some(map) = &msg.headers {
                map.iter().for_each(|(k, v)| {
                    headers.push_str(&format!("{k}: {v}, "));
                });
            }
            info!(
                target_id = %self.id,
                partition_key = %msg.partition_key,
                headers = %headers,
                "Payload - {line}"
            );
            result.sent.push(msg);
        }
        result
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn max_message_size_bytes(&self) -> usize {
        self.max_message_size_bytes
    }

    fn id(&self) -> &str {
        &self.id
    }
}
