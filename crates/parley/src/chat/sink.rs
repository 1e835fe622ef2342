//! Stream sink writing into a message row.

use anyhow::Result;
use async_trait::async_trait;

use crate::stream::StreamSink;

use super::ChatRepository;

/// Appends streamed segments to one message. Every append is a committed
/// mutation, so subscribers of the message and its conversation see the text
/// grow flush by flush.
pub struct MessageStreamSink {
    repo: ChatRepository,
    message_id: String,
}

impl MessageStreamSink {
    pub fn new(repo: ChatRepository, message_id: impl Into<String>) -> Self {
        Self {
            repo,
            message_id: message_id.into(),
        }
    }
}

#[async_trait]
impl StreamSink for MessageStreamSink {
    async fn append(&mut self, segment: &str) -> Result<()> {
        self.repo
            .append_message_content(&self.message_id, segment)
            .await?;
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        self.repo.finish_message_stream(&self.message_id).await?;
        Ok(())
    }
}
