use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Target, TargetWriteResult};
use crate::error::MessageError;
use crate::message::{Message, split_oversized};
use crate::{Error, Result};

/// The file is opened in append mode by [Target::open]. Writes are serialised so that lines from
/// concurrent batches never interleave.
pub struct FileTarget {
    id: String,
    path: PathBuf,
    max_message_size_bytes: usize,
    file: Mutex<Option<File>>,
}

impl FileTarget {
    pub fn new(id: impl Into<String>, path: PathBuf, max_message_size_bytes: usize) -> Self {
        Self {
            id: id.into(),
            path,
            max_message_size_bytes,
            file: Mutex::new(None),
        }
    }

    fn fail_all(messages: Vec<Message>, code: &str, safe: &str, detail: String) -> Vec<Message> {
        messages
            .into_iter()
            .map(|mut msg| {
                msg.set_error(MessageError::target(code, safe, detail.clone()));
                msg
            })
            .collect()
    }
}

async fn write_line(file: &mut File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.write_all(b"\n").await
}

impl Target for FileTarget {
    async fn open(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Target(format!("opening {}: {e}", self.path.display())))?;
        *self.file.lock().await = Some(file);
        info!(path = %self.path.display(), "File target opened");
        Ok(())
    }

    async fn write(&self, messages: Vec<Message>) -> TargetWriteResult {
        let (fit, oversized) = split_oversized(messages, self.max_message_size_bytes);
        let mut result = TargetWriteResult {
            oversized,
            ..Default::default()
        };

        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            result.failed = Self::fail_all(
                fit,
                "NotOpen",
                "file target is not open",
                format!("{} has not been opened", self.path.display()),
            );
            return result;
        };

        let mut pending = fit.into_iter();
        while let Some(msg) = pending.next() {
            if let Err(e) = write_line(file, &msg.data).await {
                warn!(error = ?e, path = %self.path.display(), "Failed writing to file target");
                let mut rest = vec![msg];
                rest.extend(pending);
                result.failed.extend(Self::fail_all(
                    rest,
                    "WriteError",
                    "failed writing to file",
                    e.to_string(),
                ));
                break;
            }
            result.sent.push(msg);
        }

        if !result.sent.is_empty()
            && let Err(e) = file.flush().await
        {
            warn!(error = ?e, "Failed flushing file target");
            let sent = std::mem::take(&mut result.sent);
            result.failed.extend(Self::fail_all(
                sent,
                "WriteError",
                "failed writing to file",
                e.to_string(),
            ));
        }
        result
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush()
                .await
                .map_err(|e| Error::Target(format!("closing {}: {e}", self.path.display())))?;
        }
        Ok(())
    }

    fn max_message_size_bytes(&self) -> usize {
        self.max_message_size_bytes
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let target = FileTarget::new("file", path.clone(), 10);
        target.open().await.unwrap();

        let result = target
            .write(vec![
                Message::new("one", "k"),
                Message::new("way too long to fit", "k"),
                Message::new("two", "k"),
            ])
            .await;
        assert_eq!(result.sent.len(), 2);
        assert_eq!(result.oversized.len(), 1);
        target.close().await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = FileTarget::new("file", dir.path().join("never"), 10);

        let result = target.write(vec![Message::new("one", "k")]).await;
        assert!(result.sent.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].error.as_ref().unwrap().code(), "NotOpen");
    }

    #[tokio::test]
    async fn test_open_bad_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = FileTarget::new("file", dir.path().join("missing/dir/out"), 10);
        assert!(matches!(target.open().await, Err(Error::Target(_))));
    }
}
