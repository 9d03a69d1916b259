//! [Message] is the unit that travels from the source, through the transformation chain, to a
//! target. The source hands every message an [AckHandle]; the delivery path fires it exactly once,
//! when the message reaches a terminal state (filtered, sent to the target, or sent to the failure
//! target). Copies made along the way share the same handle, so the source never sees a second
//! ack.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::MessageError;

type AckFn = Box<dyn FnOnce() + Send>;

/// Wraps the source's acknowledgement callback and guarantees it runs at most once.
pub struct AckHandle {
    callback: Mutex<Option<AckFn>>,
}

impl AckHandle {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// Runs the callback if it has not run yet. Returns whether this call ran it.
    pub fn ack(&self) -> bool {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    pub fn is_acked(&self) -> bool {
        self.callback.lock().is_none()
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// NOTE: It is cheap to clone; the payload is a [Bytes] and the ack handle is shared.
#[derive(Debug, Clone)]
pub struct Message {
    /// Routing key used by the target.
    pub partition_key: String,
    pub data: Bytes,
    /// HTTP-style headers, forwarded by targets that understand them.
    pub headers: Option<HashMap<String, String>>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// When the event was first produced upstream.
    pub time_created: DateTime<Utc>,
    /// When the source pulled the message.
    pub time_pulled: DateTime<Utc>,
    /// Set by the transformation chain only for messages that survive every stage.
    pub time_transformed: Option<DateTime<Utc>>,
    /// Set when the message reaches a terminal state.
    pub time_finished: Option<DateTime<Utc>>,
    pub ack: Option<Arc<AckHandle>>,
    /// A message carrying an error is never written to the primary target.
    pub error: Option<MessageError>,
}

impl Message {
    pub fn new(data: impl Into<Bytes>, partition_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            partition_key: partition_key.into(),
            data: data.into(),
            headers: None,
            metadata: None,
            time_created: now,
            time_pulled: now,
            time_transformed: None,
            time_finished: None,
            ack: None,
            error: None,
        }
    }

    pub fn with_ack(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.ack = Some(Arc::new(AckHandle::new(callback)));
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn set_error(&mut self, error: MessageError) {
        self.error = Some(error);
    }

    /// Fires the source acknowledgement, if any. Safe to call more than once.
    pub fn ack(&self) {
        if let Some(handle) = &self.ack {
            handle.ack();
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PartitionKey:{}, TimeCreated:{}, TimePulled:{}, TimeTransformed:{:?}",
            self.partition_key,
            self.time_created.to_rfc3339(),
            self.time_pulled.to_rfc3339(),
            self.time_transformed.map(|t| t.to_rfc3339()),
        )
    }
}

/// Splits `messages` into those that fit within `max_size` bytes and those that do not.
pub fn split_oversized(messages: Vec<Message>, max_size: usize) -> (Vec<Message>, Vec<Message>) {
    messages.into_iter().partition(|msg| msg.len() <= max_size)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_ack_fires_once_across_clones() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&counter);
        let msg = Message::new("hello", "key").with_ack(move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        });

        let copy = msg.clone();
        msg.ack();
        copy.ack();
        msg.ack();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(copy.ack.as_ref().unwrap().is_acked());
    }

    #[test]
    fn test_ack_without_handle_is_noop() {
        let msg = Message::new("hello", "key");
        msg.ack();
        assert!(msg.ack.is_none());
    }

    #[test]
    fn test_split_oversized() {
        let messages = vec![
            Message::new("a".repeat(10), "1"),
            Message::new("a".repeat(11), "2"),
            Message::new("", "3"),
        ];
        let (fit, oversized) = split_oversized(messages, 10);
        assert_eq!(fit.len(), 2);
        assert_eq!(oversized.len(), 1);
        assert_eq!(oversized[0].partition_key, "2");
    }

    #[test]
    fn test_display_omits_payload() {
        let msg = Message::new("very secret", "pk");
        let rendered = msg.to_string();
        assert!(rendered.contains("PartitionKey:pk"));
        assert!(!rendered.contains("very secret"));
    }
}
