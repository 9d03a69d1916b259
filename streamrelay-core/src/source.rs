//! Sources pull input and hand it to the relay in batches.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;
use uuid::Uuid;

use crate::config::StdinConfig;
use crate::message::Message;
use crate::{Error, Result};

/// Set of items to be implemented to become a source.
#[trait_variant::make(Source: Send)]
#[allow(dead_code)]
pub trait LocalSource {
    /// Next batch of messages. `None` once the input is exhausted.
    async fn read(&mut self) -> Result<Option<Vec<Message>>>;

    fn name(&self) -> &'static str;
}

type LineBatches = Pin<Box<dyn Stream<Item = Vec<io::Result<Vec<u8>>>> + Send>>;

/// Reads newline delimited input, one message per line. Lines are taken as raw bytes, with a
/// trailing `\r` dropped. A batch is cut when it is full or when the read timeout passes with at
/// least one line pending.
///
/// Lines carry no acknowledgement since there is nothing to acknowledge to. Each gets a random
/// partition key.
pub struct LineSource {
    batches: LineBatches,
}

impl LineSource {
    pub fn new<R>(reader: R, batch_size: usize, read_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let lines = SplitStream::new(BufReader::new(Box::pin(reader)).split(b'\n')).map(|line| {
            line.map(|mut line| {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                line
            })
        });
        Self {
            batches: Box::pin(lines.chunks_timeout(batch_size, read_timeout)),
        }
    }

    pub fn stdin(config: &StdinConfig) -> Self {
        Self::new(tokio::io::stdin(), config.batch_size, config.read_timeout())
    }
}

impl Source for LineSource {
    async fn read(&mut self) -> Result<Option<Vec<Message>>> {
        let Some(lines) = self.batches.next().await else {
            return Ok(None);
        };

        let messages = lines
            .into_iter()
            .map(|line| {
                line.map(|line| Message::new(line, Uuid::new_v4().to_string()))
                    .map_err(|e| Error::Source(format!("reading input: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(count = messages.len(), "Read batch");
        Ok(Some(messages))
    }

    fn name(&self) -> &'static str {
        "stdin"
    }
}
