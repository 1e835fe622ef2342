//! Source of assistant replies.

use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use super::Message;

/// Produces the chunks of an assistant reply to a message.
pub trait Responder: Send + Sync {
    fn respond(&self, prompt: &Message) -> BoxStream<'static, Result<String>>;
}

/// Replies by echoing the prompt back one word at a time.
#[derive(Debug, Clone)]
pub struct EchoResponder {
    delay: Duration,
}

impl EchoResponder {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoResponder {
    fn default() -> Self {
        Self::new(Duration::from_millis(40))
    }
}

impl Responder for EchoResponder {
    fn respond(&self, prompt: &Message) -> BoxStream<'static, Result<String>> {
        let words: Vec<String> = prompt
            .content
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect();
        let delay = self.delay;

        stream::iter(words)
            .then(move |word| async move {
                tokio::time::sleep(delay).await;
                Ok(word)
            })
            .boxed()
    }
}
