use super::{Target, TargetWriteResult};
use crate::Result;
use crate::message::Message;

pub struct SilentTarget {
    id: String,
}

impl SilentTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Target for SilentTarget {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, messages: Vec<Message>) -> TargetWriteResult {
        TargetWriteResult::all_sent(messages)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn max_message_size_bytes(&self) -> usize {
        usize::MAX
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_silent() {
        let target = SilentTarget::new("silent");
        let messages = vec![
            Message::new("Hello, World!", "a"),
            Message::new(vec![0u8; 4096], "b"),
        ];

        let result = target.write(messages).await;
        assert_eq!(result.sent.len(), 2);
        assert!(result.failed.is_empty());
        assert!(result.oversized.is_empty());
        assert!(result.invalid.is_empty());
    }
}
