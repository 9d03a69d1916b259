use super::{FileTarget, LogTarget, SilentTarget, Target, TargetWriteResult};
use crate::Result;
use crate::config::TargetConfig;
use crate::message::Message;

/// The builtin targets behind one type so that the runner can pick one from configuration.
pub enum TargetClient {
    Log(LogTarget),
    File(FileTarget),
    Silent(SilentTarget),
}

impl TargetClient {
    pub fn from_config(id: &str, config: &TargetConfig) -> Self {
        match config {
            TargetConfig::Log {
                max_message_size_bytes,
            } => TargetClient::Log(LogTarget::new(id, *max_message_size_bytes)),
            TargetConfig::File {
                path,
                max_message_size_bytes,
            } => TargetClient::File(FileTarget::new(id, path.clone(), *max_message_size_bytes)),
            TargetConfig::Silent {} => TargetClient::Silent(SilentTarget::new(id)),
        }
    }
}

impl Target for TargetClient {
    async fn open(&self) -> Result<()> {
        match self {
            TargetClient::Log(target) => target.open().await,
            TargetClient::File(target) => target.open().await,
            TargetClient::Silent(target) => target.open().await,
        }
    }

    async fn write(&self, messages: Vec<Message>) -> TargetWriteResult {
        match self {
            TargetClient::Log(target) => target.write(messages).await,
            TargetClient::File(target) => target.write(messages).await,
            TargetClient::Silent(target) => target.write(messages).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            TargetClient::Log(target) => target.close().await,
            TargetClient::File(target) => target.close().await,
            TargetClient::Silent(target) => target.close().await,
        }
    }

    fn max_message_size_bytes(&self) -> usize {
        match self {
            TargetClient::Log(target) => target.max_message_size_bytes(),
            TargetClient::File(target) => target.max_message_size_bytes(),
            TargetClient::Silent(target) => target.max_message_size_bytes(),
        }
    }

    fn id(&self) -> &str {
        match self {
            TargetClient::Log(target) => target.id(),
            TargetClient::File(target) => target.id(),
            TargetClient::Silent(target) => target.id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_from_config() {
        let client = TargetClient::from_config("primary", &TargetConfig::Silent {});
        assert_eq!(client.id(), "primary");
        client.open().await.unwrap();
        let result = client.write(vec![Message::new("a", "k")]).await;
        assert_eq!(result.sent.len(), 1);
        client.close().await.unwrap();

        let client = TargetClient::from_config(
            "primary",
            &TargetConfig::Log {
                max_message_size_bytes: 3,
            },
        );
        assert_eq!(client.max_message_size_bytes(), 3);
    }
}
