//! Queue-based fake backend.
//!
//! [`MockAi`] hands out queued responses in order and records every request
//! it receives, so tests can drive the full generation loop without a
//! network. An empty queue yields an [`AiError::Provider`] rather than a
//! panic.

use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    AiError, AiFeatures, AiService, ChatDelta, ChatRequest, ChatResponse, ChatStream, FunctionCall,
};

enum Queued {
    Response(ChatResponse),
    Stream(Vec<ChatDelta>),
    Error(String),
}

pub struct MockAi {
    name: String,
    features: AiFeatures,
    delay: Option<Duration>,
    chunk_delay: Option<Duration>,
    queue: Mutex<VecDeque<Queued>>,
    requests: Mutex<Vec<ChatRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MockAi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAi {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            features: AiFeatures::default(),
            delay: None,
            chunk_delay: None,
            queue: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_features(mut self, features: AiFeatures) -> Self {
        self.features = features;
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep before each streamed delta.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn queue_response(&self, response: ChatResponse) -> &Self {
        lock(&self.queue).push_back(Queued::Response(response));
        self
    }

    pub fn queue_text(&self, text: impl Into<String>) -> &Self {
        self.queue_response(ChatResponse::text(text))
    }

    /// Queue a single function call request. Arguments are serialized as
    /// JSON text.
    pub fn queue_function_call(
        &self,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> &Self {
        let call = FunctionCall::new("", name, arguments.to_string());
        self.queue_response(ChatResponse::calls(vec![call]))
    }

    /// Queue a streamed answer made of the given text chunks.
    pub fn queue_chunks<I, S>(&self, chunks: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let deltas = chunks.into_iter().map(ChatDelta::text).collect();
        self.queue_stream(deltas)
    }

    pub fn queue_stream(&self, deltas: Vec<ChatDelta>) -> &Self {
        lock(&self.queue).push_back(Queued::Stream(deltas));
        self
    }

    pub fn queue_error(&self, message: impl Into<String>) -> &Self {
        lock(&self.queue).push_back(Queued::Error(message.into()));
        self
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.queue).len()
    }

    async fn next(&self, request: &ChatRequest) -> Result<Queued, AiError> {
        lock(&self.requests).push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = lock(&self.queue).pop_front();
        match queued {
            Some(Queued::Error(message)) => Err(self.error(message)),
            Some(other) => Ok(other),
            None => Err(self.error("no queued response")),
        }
    }

    fn error(&self, message: impl Into<String>) -> AiError {
        AiError::Provider {
            provider: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl AiService for MockAi {
    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> AiFeatures {
        self.features
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        match self.next(request).await? {
            Queued::Response(response) => Ok(response),
            Queued::Stream(deltas) => {
                // Collapse a queued stream into one response for non-streaming callers.
                let mut response = ChatResponse::default();
                for delta in deltas {
                    response.content.push_str(&delta.text);
                    if let Some(usage) = delta.usage {
                        response.usage = Some(response.usage.unwrap_or_default() + usage);
                    }
                    for fragment in delta.function_calls {
                        while response.function_calls.len() <= fragment.index {
                            response.function_calls.push(FunctionCall::new("", "", ""));
                        }
                        let call = &mut response.function_calls[fragment.index];
                        if let Some(id) = fragment.id {
                            call.id = id;
                        }
                        if let Some(name) = fragment.name {
                            call.name.push_str(&name);
                        }
                        if let Some(args) = fragment.arguments {
                            call.arguments.push_str(&args);
                        }
                    }
                }
                Ok(response)
            }
            Queued::Error(message) => Err(self.error(message)),
        }
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, AiError> {
        let deltas = match self.next(request).await? {
            Queued::Stream(deltas) => deltas,
            Queued::Response(response) => vec![ChatDelta::from(response)],
            Queued::Error(message) => return Err(self.error(message)),
        };
        let deltas = stream::iter(deltas.into_iter().map(Ok::<_, AiError>));
        match self.chunk_delay {
            Some(delay) => Ok(deltas
                .then(move |delta| async move {
                    tokio::time::sleep(delay).await;
                    delta
                })
                .boxed()),
            None => Ok(Box::pin(deltas)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ChatMessage;

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user(text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_queue_order_and_recording() {
        let mock = MockAi::new();
        mock.queue_text("one").queue_text("two");

        assert_eq!(mock.chat(&request("a")).await.unwrap().content, "one");
        assert_eq!(mock.chat(&request("b")).await.unwrap().content, "two");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requests()[1].messages[0].text(), "b");
    }

    #[tokio::test]
    async fn test_empty_queue_is_error() {
        let mock = MockAi::new();
        let err = mock.chat(&request("a")).await.unwrap_err();
        assert!(err.to_string().contains("no queued response"));
    }

    #[tokio::test]
    async fn test_stream_chunks() {
        let mock = MockAi::new();
        mock.queue_chunks(["Ans", "wer: Paris"]);
        let stream = mock.chat_stream(&request("q")).await.unwrap();
        let texts: Vec<String> = stream.map(|d| d.unwrap().text).collect().await;
        assert_eq!(texts, vec!["Ans", "wer: Paris"]);
    }

    #[tokio::test]
    async fn test_stream_collapses_for_chat() {
        let mock = MockAi::new();
        mock.queue_chunks(["a", "b"]);
        assert_eq!(mock.chat(&request("q")).await.unwrap().content, "ab");
    }

    #[tokio::test]
    async fn test_queued_error() {
        let mock = MockAi::new();
        mock.queue_error("boom");
        assert!(mock.chat_stream(&request("q")).await.is_err());
    }

    #[tokio::test]
    async fn test_chunk_delay_spaces_out_deltas() {
        let mock = MockAi::new().with_chunk_delay(Duration::from_millis(20));
        mock.queue_chunks(["a", "b"]);
        let started = std::time::Instant::now();
        let mut stream = mock.chat_stream(&request("q")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().text, "a");
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(stream.next().await.unwrap().unwrap().text, "b");
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(stream.next().await.is_none());
    }
}
