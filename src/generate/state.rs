use crate::ai::{ChatDelta, ChatMessage, ChatResponse, FunctionCall, Usage};
use crate::extract::FieldValues;
use crate::function::FunctionCallRecord;

/// Live state of one `forward` call. Owned by that call alone and dropped
/// when it returns.
#[derive(Debug, Clone, Default)]
pub struct GenerationState {
    /// The conversation so far, starting with the rendered prompt.
    pub messages: Vec<ChatMessage>,
    /// Values of the last accepted extraction.
    pub extracted: FieldValues,
    /// Validation retries used.
    pub attempt: u32,
    /// Model turns taken in the function-call loop, the first one included.
    pub steps: u32,
    pub function_calls: Vec<FunctionCallRecord>,
    pub usage: Usage,
    pub model_calls: u32,
    /// Model name reported by the backend, if any.
    pub model: Option<String>,
    /// Raw text of the most recent model turn.
    pub last_output: String,
    /// Field processor results from the accepted turn.
    pub processed: FieldValues,
}

impl GenerationState {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub(crate) fn record_usage(&mut self, usage: Option<Usage>, model: Option<String>) {
        if let Some(usage) = usage {
            self.usage += usage;
        }
        if model.is_some() {
            self.model = model;
        }
    }
}

/// Accumulates streamed function-call fragments by index.
#[derive(Debug, Default)]
pub(crate) struct CallAccumulator {
    calls: Vec<FunctionCall>,
}

impl CallAccumulator {
    pub(crate) fn push(&mut self, delta: &ChatDelta) {
        for fragment in &delta.function_calls {
            while self.calls.len() <= fragment.index {
                self.calls.push(FunctionCall::new("", "", ""));
            }
            let call = &mut self.calls[fragment.index];
            if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
                call.id = id.to_string();
            }
            if let Some(name) = &fragment.name {
                call.name.push_str(name);
            }
            if let Some(args) = &fragment.arguments {
                call.arguments.push_str(args);
            }
        }
    }

    /// Completed calls. Slots that never received a name are dropped.
    pub(crate) fn finish(self) -> Vec<FunctionCall> {
        self.calls.into_iter().filter(|c| !c.name.is_empty()).collect()
    }
}

impl From<&ChatResponse> for CallAccumulator {
    fn from(response: &ChatResponse) -> Self {
        Self {
            calls: response.function_calls.clone(),
        }
    }
}
