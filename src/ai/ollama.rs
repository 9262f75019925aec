//! Ollama backend for local inference over `/api/chat`.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    AiError, AiFeatures, AiService, ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream,
    ContentPart, FunctionCall, FunctionCallDelta, Role, Usage,
};

/// Configuration for the Ollama backend
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama server URL (default: http://localhost:11434)
    pub host: String,
    /// Model used when the request doesn't name one (default: phi4)
    pub default_model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            default_model: "phi4".to_string(),
        }
    }
}

/// Request body for `POST /api/chat`
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OllamaFunctionDef,
}

#[derive(Debug, Serialize)]
struct OllamaFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// One response object; streaming sends one of these per line.
#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

impl OllamaChatChunk {
    fn usage(&self) -> Option<Usage> {
        if !self.done {
            return None;
        }
        Some(Usage::new(
            self.prompt_eval_count.unwrap_or(0),
            self.eval_count.unwrap_or(0),
        ))
    }
}

fn to_ollama_message(msg: &ChatMessage) -> OllamaMessage {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Function => "tool",
    };
    let images = msg
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Image { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect();
    let tool_calls = msg
        .function_calls
        .iter()
        .map(|c| OllamaToolCall {
            function: OllamaFunctionCall {
                name: c.name.clone(),
                arguments: serde_json::from_str(&c.arguments).unwrap_or(Value::Null),
            },
        })
        .collect();
    OllamaMessage {
        role,
        content: msg.text(),
        images,
        tool_calls,
    }
}

fn arguments_text(arguments: &Value) -> String {
    if arguments.is_null() {
        String::new()
    } else {
        arguments.to_string()
    }
}

/// Ollama backend
pub struct Ollama {
    client: reqwest::Client,
    config: OllamaConfig,
}

impl Default for Ollama {
    fn default() -> Self {
        Self::new(OllamaConfig::default())
    }
}

impl Ollama {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Backend at a custom host with the default model
    pub fn at(host: impl Into<String>) -> Self {
        Self::new(OllamaConfig {
            host: host.into(),
            ..Default::default()
        })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OllamaChatRequest {
        let options = (request.temperature.is_some() || request.max_tokens.is_some()).then(|| {
            OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            }
        });
        OllamaChatRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            messages: request.messages.iter().map(to_ollama_message).collect(),
            stream,
            options,
            tools: request
                .functions
                .iter()
                .map(|f| OllamaTool {
                    kind: "function",
                    function: OllamaFunctionDef {
                        name: f.name.clone(),
                        description: f.description.clone(),
                        parameters: f.parameters.clone(),
                    },
                })
                .collect(),
        }
    }

    async fn post(&self, body: &OllamaChatRequest) -> Result<reqwest::Response, AiError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.config.host))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ollama_error(format!("HTTP {status}: {error_text}")));
        }
        Ok(response)
    }
}

fn ollama_error(message: impl Into<String>) -> AiError {
    AiError::Provider {
        provider: "ollama".to_string(),
        message: message.into(),
    }
}

/// Parses one NDJSON line into a delta. Blank lines yield `None`.
fn parse_line(line: &str, call_offset: &mut usize) -> Option<Result<ChatDelta, AiError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let chunk: OllamaChatChunk = match serde_json::from_str(line) {
        Ok(chunk) => chunk,
        Err(e) => return Some(Err(e.into())),
    };
    if let Some(error) = &chunk.error {
        return Some(Err(ollama_error(error.as_str())));
    }

    let usage = chunk.usage();
    let mut delta = ChatDelta {
        usage,
        model: chunk.model,
        ..Default::default()
    };
    if let Some(message) = chunk.message {
        delta.text = message.content;
        // Ollama sends whole calls, never fragments; give each its own index.
        for call in message.tool_calls {
            delta.function_calls.push(FunctionCallDelta {
                index: *call_offset,
                id: None,
                name: Some(call.function.name),
                arguments: Some(arguments_text(&call.function.arguments)),
            });
            *call_offset += 1;
        }
    }
    Some(Ok(delta))
}

/// Decodes an NDJSON byte stream into deltas. Lines are split on raw bytes
/// so multi-byte characters cut by a chunk boundary are decoded whole, and
/// a last line without a trailing newline is flushed when the bytes end.
fn ndjson_deltas<S, B, E>(bytes: S) -> impl futures::Stream<Item = Result<ChatDelta, AiError>>
where
    S: futures::Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<AiError>,
{
    bytes
        .map(Some)
        .chain(futures::stream::once(futures::future::ready(None)))
        .scan((Vec::<u8>::new(), 0usize), |(buffer, call_offset), chunk| {
            let items: Vec<Result<ChatDelta, AiError>> = match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(bytes.as_ref());
                    let mut items = Vec::new();
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        items.extend(parse_line(&String::from_utf8_lossy(&line), call_offset));
                    }
                    items
                }
                Some(Err(e)) => vec![Err(e.into())],
                None => {
                    let rest = std::mem::take(buffer);
                    parse_line(&String::from_utf8_lossy(&rest), call_offset)
                        .into_iter()
                        .collect()
                }
            };
            futures::future::ready(Some(items))
        })
        .flat_map(futures::stream::iter)
}

#[async_trait]
impl AiService for Ollama {
    fn name(&self) -> &str {
        "ollama"
    }

    fn features(&self) -> AiFeatures {
        AiFeatures {
            streaming: true,
            functions: true,
            streaming_functions: true,
        }
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let body = self.build_request(request, false);
        log::debug!("ollama chat: model={} messages={}", body.model, body.messages.len());

        let chunk: OllamaChatChunk = self.post(&body).await?.json().await?;
        if let Some(error) = &chunk.error {
            return Err(ollama_error(error.as_str()));
        }
        let usage = chunk.usage();
        let message = chunk
            .message
            .ok_or_else(|| AiError::InvalidResponse("response has no message".to_string()))?;

        Ok(ChatResponse {
            content: message.content,
            function_calls: message
                .tool_calls
                .into_iter()
                .map(|c| {
                    let arguments = arguments_text(&c.function.arguments);
                    FunctionCall::new("", c.function.name, arguments)
                })
                .collect(),
            usage,
            model: chunk.model,
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, AiError> {
        let body = self.build_request(request, true);
        log::debug!("ollama stream: model={} messages={}", body.model, body.messages.len());

        let bytes = self.post(&body).await?.bytes_stream();
        let stream = ndjson_deltas(bytes);

        Ok(Box::pin(stream))
    }
}
