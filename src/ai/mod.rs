//! The boundary between the generation engine and a model backend.
//!
//! Every backend implements [`AiService`]. The engine only ever sees the
//! canonical shapes defined here: [`ChatRequest`] going out, and either one
//! [`ChatResponse`] or a [`ChatStream`] of [`ChatDelta`]s coming back.

pub mod mock;
#[cfg(feature = "ollama")]
pub mod ollama;

pub use mock::MockAi;
#[cfg(feature = "ollama")]
pub use ollama::{Ollama, OllamaConfig};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::{Add, AddAssign};
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a model backend. Transport retries are the backend's
/// business; anything surfacing here aborts the generation call.
#[derive(Debug, Error)]
pub enum AiError {
    #[cfg(feature = "ollama")]
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} error: {message}")]
    Provider { provider: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { mime_type: String, data: String },
    Audio { mime_type: String, data: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// A function invocation requested by the model. `arguments` is the raw
/// JSON text the model produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl FunctionCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// A conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Calls requested by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCall>,
    /// For function-result turns: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl ChatMessage {
    fn with_text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::text(text)],
            function_calls: Vec::new(),
            function_call_id: None,
            is_error: false,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_text(Role::User, text)
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            parts,
            ..Self::with_text(Role::User, "")
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_text(Role::Assistant, text)
    }

    /// An assistant turn that requested function calls, with any text it
    /// produced alongside them.
    pub fn assistant_calls(text: impl Into<String>, calls: Vec<FunctionCall>) -> Self {
        Self {
            function_calls: calls,
            ..Self::with_text(Role::Assistant, text)
        }
    }

    pub fn function_result(
        call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            function_call_id: Some(call_id.into()),
            is_error,
            ..Self::with_text(Role::Function, content)
        }
    }

    /// Concatenated text parts; media parts are skipped.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A function the model may call, as advertised to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn calls(calls: Vec<FunctionCall>) -> Self {
        Self {
            function_calls: calls,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// A fragment of a function call in a stream. Fragments sharing an
/// `index` belong to the same call; `arguments` pieces are concatenated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// One increment of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatDelta {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub function_calls: Vec<FunctionCallDelta>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

impl From<ChatResponse> for ChatDelta {
    fn from(resp: ChatResponse) -> Self {
        let function_calls = resp
            .function_calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| FunctionCallDelta {
                index,
                id: Some(call.id),
                name: Some(call.name),
                arguments: Some(call.arguments),
            })
            .collect();
        Self {
            text: resp.content,
            function_calls,
            usage: resp.usage,
            model: resp.model,
        }
    }
}

/// A pinned, boxed, `Send` stream of deltas.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatDelta, AiError>> + Send>>;

/// What a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiFeatures {
    pub streaming: bool,
    pub functions: bool,
    /// Function calls can arrive inside a stream rather than only in
    /// complete responses.
    pub streaming_functions: bool,
}

impl Default for AiFeatures {
    fn default() -> Self {
        Self {
            streaming: true,
            functions: true,
            streaming_functions: true,
        }
    }
}

/// Token accounting for one or more model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(rhs.total_tokens),
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// A model backend.
#[async_trait]
pub trait AiService: Send + Sync {
    fn name(&self) -> &str;

    fn features(&self) -> AiFeatures {
        AiFeatures::default()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AiError>;

    /// Streaming variant. Backends without native streaming get a
    /// single-delta stream wrapping [`AiService::chat`].
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, AiError> {
        let response = self.chat(request).await?;
        let delta = ChatDelta::from(response);
        Ok(Box::pin(futures::stream::once(async move { Ok::<_, AiError>(delta) })))
    }
}
