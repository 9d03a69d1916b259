//! A target whose answers are scripted per write call, for exercising retry and rerouting paths.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{Target, TargetWriteResult};
use crate::Result;
use crate::error::MessageError;
use crate::message::{Message, split_oversized};

/// What the target does with the messages of one write call.
#[derive(Debug, Clone)]
pub(crate) enum Behaviour {
    SendAll,
    FailAll,
    /// Fails messages whose payload contains the needle, sends the rest.
    FailMatching(&'static str),
    /// Reports messages whose payload contains the needle as invalid, sends the rest.
    InvalidMatching(&'static str),
    /// Reports every message as oversized, whatever its size.
    OversizeAll,
}

pub(crate) struct ScriptedTarget {
    id: String,
    max_message_size_bytes: usize,
    script: Mutex<VecDeque<Behaviour>>,
    /// Payloads of every write call, in order.
    calls: Mutex<Vec<Vec<Bytes>>>,
    opened: Mutex<bool>,
    closed: Mutex<bool>,
}

impl ScriptedTarget {
    /// Once the script runs out every write succeeds.
    pub(crate) fn new(script: impl IntoIterator<Item = Behaviour>) -> Self {
        Self {
            id: "scripted".to_string(),
            max_message_size_bytes: usize::MAX,
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::new(vec![]),
            opened: Mutex::new(false),
            closed: Mutex::new(false),
        }
    }

    pub(crate) fn with_max_size(mut self, max_message_size_bytes: usize) -> Self {
        self.max_message_size_bytes = max_message_size_bytes;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Vec<Bytes>> {
        self.calls.lock().clone()
    }

    pub(crate) fn is_opened(&self) -> bool {
        *self.opened.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

fn failed(mut msg: Message) -> Message {
    msg.set_error(MessageError::target("Scripted", "scripted failure", "scripted failure"));
    msg
}

fn contains(msg: &Message, needle: &str) -> bool {
    String::from_utf8_lossy(&msg.data).contains(needle)
}

impl Target for ScriptedTarget {
    async fn open(&self) -> Result<()> {
        *self.opened.lock() = true;
        Ok(())
    }

    async fn write(&self, messages: Vec<Message>) -> TargetWriteResult {
        self.calls
            .lock()
            .push(messages.iter().map(|msg| msg.data.clone()).collect());
        let behaviour = self.script.lock().pop_front().unwrap_or(Behaviour::SendAll);

        let (fit, oversized) = split_oversized(messages, self.max_message_size_bytes);
        let mut result = TargetWriteResult {
            oversized,
            ..Default::default()
        };
        for msg in fit {
            match &behaviour {
                Behaviour::SendAll => result.sent.push(msg),
                Behaviour::FailAll => result.failed.push(failed(msg)),
                Behaviour::OversizeAll => result.oversized.push(msg),
                Behaviour::FailMatching(needle) if contains(&msg, needle) => {
                    result.failed.push(failed(msg));
                }
                Behaviour::InvalidMatching(needle) if contains(&msg, needle) => {
                    result.invalid.push(failed(msg));
                }
                Behaviour::FailMatching(_) | Behaviour::InvalidMatching(_) => {
                    result.sent.push(msg);
                }
            }
        }
        result
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }

    fn max_message_size_bytes(&self) -> usize {
        self.max_message_size_bytes
    }

    fn id(&self) -> &str {
        &self.id
    }
}
