//! The generation loop.
//!
//! A [`Generator`] owns a compiled prompt and everything registered with
//! it. Each `forward` call renders the prompt, calls the model, and then
//! either runs requested functions and calls the model again, or extracts
//! and checks the output fields, feeding corrections back on failure.
//!
//! ```rust
//! use sigforge::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), GenError> {
//! let ai = MockAi::new();
//! ai.queue_text("Answer: Paris");
//!
//! let generator = Generator::new("question -> answer")?;
//! let output = generator.forward(&ai, json!({"question": "Capital of France?"})).await?;
//! assert_eq!(output.get_str("answer"), Some("Paris"));
//! # Ok(())
//! # }
//! ```

pub mod output;
pub mod state;

pub use output::GenerateOutput;
pub use state::GenerationState;

use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::ai::{AiService, ChatMessage, ChatRequest, FunctionCall};
use crate::assertion::{Assertion, AssertionFailure, AssertionScope, evaluate};
use crate::config::GenerateConfig;
use crate::error::GenError;
use crate::extract::{FieldError, FieldValues, FinalizedField, StreamingExtractor};
use crate::function::executor::stringify_result;
use crate::function::{FunctionCallRecord, FunctionRegistry, assign_call_ids, execute_calls};
use crate::processor::{FieldProcessor, ProcessorContext};
use crate::prompt::{
    Correction, Demo, PromptTemplate, RenderError, render_correction, render_function_results,
    render_processed,
};
use crate::signature::{Field, FieldKind, FieldType, Signature, to_title};
use crate::telemetry::{Telemetry, TraceEntry};
use state::CallAccumulator;

/// Progress notifications for callers watching a run.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A field was finalized. `attempt` is 0 for the first model answer and
    /// counts up with each retry.
    FieldFinalized { attempt: u32, name: String, value: Value },
    FunctionCalled(FunctionCallRecord),
    /// An answer was rejected and the model is asked again.
    Retry { attempt: u32, message: String },
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cancel: CancellationToken,
    pub events: Option<UnboundedSender<GenerationEvent>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn events(mut self, sender: UnboundedSender<GenerationEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    fn emit(&self, event: GenerationEvent) {
        if let Some(sender) = &self.events {
            // A dropped receiver just means nobody is listening.
            let _ = sender.send(event);
        }
    }
}

/// Why an answer was not accepted.
#[derive(Debug, Clone)]
struct Rejection {
    field: Option<String>,
    value: Option<String>,
    message: String,
}

impl From<FieldError> for Rejection {
    fn from(err: FieldError) -> Self {
        Self {
            field: Some(err.field().to_string()),
            value: err.value().map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl From<AssertionFailure> for Rejection {
    fn from(failure: AssertionFailure) -> Self {
        Self {
            field: failure.field,
            value: failure.value.as_ref().map(stringify_result),
            message: failure.message,
        }
    }
}

/// Extraction of one model turn.
struct Extraction {
    extractor: StreamingExtractor,
    rejection: Option<Rejection>,
    /// Field processor results for this turn.
    processed: FieldValues,
    /// Text is arriving in pieces.
    live: bool,
}

async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output, GenError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(GenError::Cancelled),
        out = fut => Ok(out),
    }
}

pub struct Generator {
    signature: Signature,
    template: PromptTemplate,
    /// Used when the backend cannot take function definitions.
    prompted: PromptTemplate,
    functions: Arc<FunctionRegistry>,
    assertions: Vec<Assertion>,
    processors: Vec<FieldProcessor>,
    demos: Vec<Demo>,
    config: GenerateConfig,
    telemetry: Option<Arc<dyn Telemetry>>,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("signature", &self.signature.to_string())
            .field("functions", &self.functions.len())
            .field("assertions", &self.assertions.len())
            .field("processors", &self.processors.len())
            .field("demos", &self.demos.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Generator {
    /// Generator for a DSL signature with default settings.
    pub fn new(signature: &str) -> Result<Self, GenError> {
        GeneratorBuilder::new(signature.parse()?).build()
    }

    pub fn builder(signature: Signature) -> GeneratorBuilder {
        GeneratorBuilder::new(signature)
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The template used with backends that call functions natively.
    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// The template used with backends that can't, where functions are
    /// called by writing output fields.
    pub fn prompted_template(&self) -> &PromptTemplate {
        &self.prompted
    }

    pub fn config(&self) -> &GenerateConfig {
        &self.config
    }

    pub async fn forward(
        &self,
        ai: &dyn AiService,
        inputs: Value,
    ) -> Result<GenerateOutput, GenError> {
        self.forward_with(ai, inputs, RunOptions::default()).await
    }

    pub async fn forward_with(
        &self,
        ai: &dyn AiService,
        inputs: Value,
        options: RunOptions,
    ) -> Result<GenerateOutput, GenError> {
        let Value::Object(inputs) = inputs else {
            return Err(RenderError::NotAnObject.into());
        };
        let mut state = GenerationState::default();
        let result = self.run(ai, &inputs, &mut state, &options).await;
        if let Err(e) = &result {
            log::debug!("generation failed after {} model calls: {e}", state.model_calls);
        }
        self.trace(&inputs, &state, &result);
        result
    }

    async fn run(
        &self,
        ai: &dyn AiService,
        inputs: &FieldValues,
        state: &mut GenerationState,
        options: &RunOptions,
    ) -> Result<GenerateOutput, GenError> {
        let prompted = !self.functions.is_empty() && !ai.features().functions;
        let template = if prompted { &self.prompted } else { &self.template };
        state.messages = template.render(inputs, &self.demos)?;
        state.steps = 1;

        loop {
            let (mut calls, mut extraction) = self.call_model(ai, template, state, options).await?;
            if prompted && calls.is_empty() {
                calls = self.calls_from_fields(&mut extraction, state.attempt, options);
            }

            if !calls.is_empty() {
                let processed = std::mem::take(&mut extraction.processed);
                let stopped = self.run_functions(calls, prompted, state, options).await?;
                if let Some(record) = stopped {
                    log::debug!("stop function {} ended the loop", record.name);
                    state.processed = processed;
                    state.extracted = lenient_values(extraction);
                    return output::assemble(&self.signature, state, Some(record));
                }
                self.report_processed(&processed, state);
                if state.steps >= self.config.max_steps.max(1) {
                    return Err(GenError::MaxStepsExceeded {
                        max_steps: self.config.max_steps,
                    });
                }
                state.steps += 1;
                continue;
            }

            match self.settle(&mut extraction, state.attempt, options) {
                Ok(values) => {
                    state.extracted = values;
                    state.processed = extraction.processed;
                    return output::assemble(&self.signature, state, None);
                }
                Err(rejection) => self.reject(rejection, &extraction.processed, state, options)?,
            }
        }
    }

    fn request(&self, ai: &dyn AiService, messages: &[ChatMessage]) -> ChatRequest {
        let functions = if ai.features().functions {
            self.functions.definitions()
        } else {
            Vec::new()
        };
        ChatRequest {
            messages: messages.to_vec(),
            functions,
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    /// One model round trip. Output text is fed to a fresh extractor as it
    /// arrives.
    async fn call_model(
        &self,
        ai: &dyn AiService,
        template: &PromptTemplate,
        state: &mut GenerationState,
        options: &RunOptions,
    ) -> Result<(Vec<FunctionCall>, Extraction), GenError> {
        let request = self.request(ai, &state.messages);
        let features = ai.features();
        let streaming = self.config.stream
            && features.streaming
            && (request.functions.is_empty() || features.streaming_functions);

        let mut extraction = Extraction {
            extractor: StreamingExtractor::new(&template.signature().outputs),
            rejection: None,
            processed: FieldValues::new(),
            live: streaming,
        };
        state.model_calls += 1;
        log::debug!(
            "model call {} to {} (attempt {}, step {}, streaming: {streaming})",
            state.model_calls,
            ai.name(),
            state.attempt,
            state.steps
        );

        let calls = if streaming {
            let mut stream = cancellable(&options.cancel, ai.chat_stream(&request)).await??;
            let mut text = String::new();
            let mut calls = CallAccumulator::default();
            while let Some(delta) = cancellable(&options.cancel, stream.next()).await? {
                let delta = delta?;
                calls.push(&delta);
                state.record_usage(delta.usage, delta.model.clone());
                text.push_str(&delta.text);
                self.absorb(&mut extraction, &delta.text, state.attempt, options);
                if extraction.rejection.is_some() {
                    log::debug!("abandoning stream after a rejected field");
                    break;
                }
            }
            state.last_output = text;
            calls.finish()
        } else {
            let response = cancellable(&options.cancel, ai.chat(&request)).await??;
            state.record_usage(response.usage, response.model.clone());
            self.absorb(&mut extraction, &response.content, state.attempt, options);
            let calls = CallAccumulator::from(&response).finish();
            state.last_output = response.content;
            calls
        };
        Ok((calls, extraction))
    }

    fn absorb(&self, extraction: &mut Extraction, text: &str, attempt: u32, options: &RunOptions) {
        if extraction.rejection.is_some() || text.is_empty() {
            return;
        }
        match extraction.extractor.push(text) {
            Ok(fields) => {
                if !fields.is_empty() {
                    self.finalized(extraction, &fields, attempt, options);
                    extraction.rejection = self.check_streaming(&extraction.extractor);
                }
                if extraction.live && extraction.rejection.is_none() {
                    self.process_partial(extraction);
                }
            }
            Err(e) => extraction.rejection = Some(e.into()),
        }
    }

    /// Announces finalized fields and hands them to streaming processors.
    /// Function argument fields stay quiet.
    fn finalized(
        &self,
        extraction: &mut Extraction,
        fields: &[FinalizedField],
        attempt: u32,
        options: &RunOptions,
    ) {
        for field in fields {
            let Some(value) = &field.value else { continue };
            if self.signature.output_by_name(&field.name).is_none() {
                continue;
            }
            log::debug!("field {} finalized", field.name);
            options.emit(GenerationEvent::FieldFinalized {
                attempt,
                name: field.name.clone(),
                value: value.clone(),
            });

            for processor in self.streaming_processors(&field.name) {
                let context = ProcessorContext {
                    values: extraction.extractor.values(),
                    done: true,
                };
                if let Some(result) = processor.run(value, context) {
                    extraction.processed.insert(field.name.clone(), result);
                }
            }
        }
    }

    /// Streaming processors over the text of the field still arriving.
    fn process_partial(&self, extraction: &mut Extraction) {
        let Some((name, text)) = extraction.extractor.partial() else {
            return;
        };
        if text.is_empty() {
            return;
        }
        let text = Value::String(text.to_string());
        for processor in self.streaming_processors(name) {
            let context = ProcessorContext {
                values: extraction.extractor.values(),
                done: false,
            };
            if let Some(result) = processor.run(&text, context) {
                extraction.processed.insert(name.to_string(), result);
            }
        }
    }

    fn streaming_processors<'a>(
        &'a self,
        field: &'a str,
    ) -> impl Iterator<Item = &'a FieldProcessor> {
        self.processors
            .iter()
            .filter(move |p| p.streaming && p.field == field)
    }

    /// Streaming assertions over the finalized fields plus the one in progress.
    fn check_streaming(&self, extractor: &StreamingExtractor) -> Option<Rejection> {
        let mut streaming = self
            .assertions
            .iter()
            .filter(|a| a.scope == AssertionScope::Streaming)
            .peekable();
        streaming.peek()?;

        let mut values = extractor.values().clone();
        if let Some((name, value)) = extractor.tentative() {
            values.insert(name.to_string(), value);
        }
        let visible = output::visible_values(&self.signature, &values);
        evaluate(streaming, &values, &visible).map(Rejection::from)
    }

    /// Function calls written as output fields. Finishes the turn's
    /// extraction; any field failure is left for [`Generator::settle`].
    fn calls_from_fields(
        &self,
        extraction: &mut Extraction,
        attempt: u32,
        options: &RunOptions,
    ) -> Vec<FunctionCall> {
        if extraction.rejection.is_some() {
            return Vec::new();
        }
        match extraction.extractor.finish() {
            Ok(fields) => self.finalized(extraction, &fields, attempt, options),
            Err(e) => {
                extraction.rejection = Some(e.into());
                return Vec::new();
            }
        }

        let values = extraction.extractor.values();
        self.functions
            .iter()
            .filter(|f| self.signature.output_by_name(&f.name).is_none())
            .filter_map(|f| {
                let args = values.get(&f.name)?;
                Some(FunctionCall::new("", f.name.clone(), args.to_string()))
            })
            .collect()
    }

    /// Finishes extraction, runs every assertion in registration order, then
    /// the plain field processors.
    fn settle(
        &self,
        extraction: &mut Extraction,
        attempt: u32,
        options: &RunOptions,
    ) -> Result<FieldValues, Rejection> {
        if let Some(rejection) = extraction.rejection.take() {
            return Err(rejection);
        }
        if !extraction.extractor.is_done() {
            let fields = extraction.extractor.finish()?;
            self.finalized(extraction, &fields, attempt, options);
        }

        let values = extraction.extractor.values().clone();
        if let Some(field) = self
            .signature
            .outputs
            .iter()
            .find(|f| !f.optional && !values.contains_key(&f.name))
        {
            return Err(FieldError::Missing {
                field: field.name.clone(),
                title: field.title(),
            }
            .into());
        }

        let visible = output::visible_values(&self.signature, &values);
        if let Some(failure) = evaluate(&self.assertions, &values, &visible) {
            return Err(failure.into());
        }

        for processor in self.processors.iter().filter(|p| !p.streaming) {
            let Some(value) = values.get(&processor.field) else { continue };
            let context = ProcessorContext {
                values: &values,
                done: true,
            };
            if let Some(result) = processor.run(value, context) {
                extraction.processed.insert(processor.field.clone(), result);
            }
        }
        Ok(values)
    }

    /// Appends the rejected answer and one correction, or gives up once the
    /// retry budget is spent.
    fn reject(
        &self,
        rejection: Rejection,
        processed: &FieldValues,
        state: &mut GenerationState,
        options: &RunOptions,
    ) -> Result<(), GenError> {
        if state.attempt >= self.config.max_retries {
            return Err(GenError::Validation {
                field: rejection.field,
                value: rejection.value,
                message: rejection.message,
                attempts: state.attempt + 1,
                raw_output: state.last_output.clone(),
            });
        }
        state.attempt += 1;
        log::warn!("attempt {} rejected: {}", state.attempt, rejection.message);
        options.emit(GenerationEvent::Retry {
            attempt: state.attempt,
            message: rejection.message.clone(),
        });

        let field_title = rejection.field.as_deref().map(|name| {
            self.signature
                .output_by_name(name)
                .map_or_else(|| to_title(name), Field::title)
        });
        let correction = Correction {
            field_title,
            value: rejection.value,
            message: rejection.message,
        };
        state.messages.push(ChatMessage::assistant(state.last_output.clone()));
        self.report_processed(processed, state);
        state.messages.push(ChatMessage::user(render_correction(&correction)));
        Ok(())
    }

    /// Tells the model what the processors made of its last turn.
    fn report_processed(&self, processed: &FieldValues, state: &mut GenerationState) {
        for (name, result) in processed {
            let title = self
                .signature
                .output_by_name(name)
                .map_or_else(|| to_title(name), Field::title);
            state.messages.push(ChatMessage::user(render_processed(&title, result)));
        }
    }

    /// Executes one turn's calls and appends the results. Returns the stop
    /// function's record if one succeeded.
    async fn run_functions(
        &self,
        mut calls: Vec<FunctionCall>,
        prompted: bool,
        state: &mut GenerationState,
        options: &RunOptions,
    ) -> Result<Option<FunctionCallRecord>, GenError> {
        assign_call_ids(&mut calls);
        let turn = if prompted {
            ChatMessage::assistant(state.last_output.clone())
        } else {
            ChatMessage::assistant_calls(state.last_output.clone(), calls.clone())
        };
        state.messages.push(turn);

        let records = cancellable(&options.cancel, execute_calls(&self.functions, calls)).await??;

        if prompted {
            state.messages.push(ChatMessage::user(render_function_results(&records)));
        }
        let mut stopped = None;
        for record in records {
            options.emit(GenerationEvent::FunctionCalled(record.clone()));
            if !prompted {
                state.messages.push(record.to_message());
            }
            let stops = !record.is_error() && self.config.is_stop_function(&record.name);
            if stopped.is_none() && stops {
                stopped = Some(record.clone());
            }
            state.function_calls.push(record);
        }
        Ok(stopped)
    }

    fn trace(
        &self,
        inputs: &FieldValues,
        state: &GenerationState,
        result: &Result<GenerateOutput, GenError>,
    ) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let (outputs, error) = match result {
            Ok(out) => (out.values.clone(), None),
            Err(e) => (FieldValues::new(), Some(e.to_string())),
        };
        telemetry.record(TraceEntry {
            timestamp: chrono::Utc::now().timestamp_millis(),
            signature_hash: self.signature.structural_hash(),
            inputs: inputs.clone(),
            outputs,
            model_name: state.model.clone().or_else(|| self.config.model.clone()),
            model_calls: state.model_calls,
            retries: state.attempt,
            function_calls: state.function_calls.len(),
            usage: state.usage,
            error,
        });
    }
}

/// Whatever the turn's text yielded. Missing fields are fine here since
/// the stop function's result is the answer.
fn lenient_values(mut extraction: Extraction) -> FieldValues {
    if !extraction.extractor.is_done() {
        let _ = extraction.extractor.finish();
    }
    extraction.extractor.into_values()
}

/// Builder for [`Generator`].
pub struct GeneratorBuilder {
    signature: Signature,
    functions: Arc<FunctionRegistry>,
    assertions: Vec<Assertion>,
    processors: Vec<FieldProcessor>,
    demos: Vec<Demo>,
    config: GenerateConfig,
    telemetry: Option<Arc<dyn Telemetry>>,
}

impl GeneratorBuilder {
    pub fn new(signature: Signature) -> Self {
        Self {
            signature,
            functions: Arc::new(FunctionRegistry::new()),
            assertions: Vec::new(),
            processors: Vec::new(),
            demos: Vec::new(),
            config: GenerateConfig::default(),
            telemetry: None,
        }
    }

    pub fn functions(mut self, registry: FunctionRegistry) -> Self {
        self.functions = Arc::new(registry);
        self
    }

    /// Share one registry between several generators.
    pub fn shared_functions(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.functions = registry;
        self
    }

    pub fn assert(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn processor(mut self, processor: FieldProcessor) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn demo(mut self, demo: Demo) -> Self {
        self.demos.push(demo);
        self
    }

    pub fn demos(mut self, demos: impl IntoIterator<Item = Demo>) -> Self {
        self.demos.extend(demos);
        self
    }

    pub fn config(mut self, config: GenerateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.config.max_steps = max_steps;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    pub fn stop_function(mut self, name: impl Into<String>) -> Self {
        self.config.stop_functions.push(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn thought_field(mut self, name: impl Into<String>) -> Self {
        self.config.thought_field = Some(name.into());
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(self) -> Result<Generator, GenError> {
        let mut signature = self.signature;
        if let Some(name) = &self.config.thought_field {
            let thought = Field::new(name.clone())
                .internal()
                .describe("Step-by-step reasoning leading to the answer");
            signature.outputs.insert(0, thought);
        }
        signature.validate()?;

        for processor in &self.processors {
            check_processor(&signature, processor)?;
        }

        for name in &self.config.stop_functions {
            if !self.functions.iter().any(|f| f.name.eq_ignore_ascii_case(name)) {
                log::warn!("stop function {name} is not registered");
            }
        }

        let template = PromptTemplate::new(&signature, &self.functions);
        let prompted = if self.functions.is_empty() {
            template.clone()
        } else {
            PromptTemplate::with_prompt_functions(&signature, &self.functions).unwrap_or_else(|e| {
                log::warn!("functions can't be offered through the prompt: {e}");
                PromptTemplate::new(&signature, &FunctionRegistry::new())
            })
        };

        Ok(Generator {
            signature,
            template,
            prompted,
            functions: self.functions,
            assertions: self.assertions,
            processors: self.processors,
            demos: self.demos,
            config: self.config,
            telemetry: self.telemetry,
        })
    }
}

fn check_processor(signature: &Signature, processor: &FieldProcessor) -> Result<(), GenError> {
    let invalid = |message: &str| GenError::Processor {
        field: processor.field.clone(),
        message: message.to_string(),
    };
    let field = signature
        .output_by_name(&processor.field)
        .ok_or_else(|| invalid("no output field has this name"))?;
    let text = field.kind == FieldKind::Scalar && field.field_type == FieldType::String;
    if processor.streaming && !text {
        return Err(invalid("streaming processors need a string field"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::mock::MockAi;
    use serde_json::json;

    #[test]
    fn test_thought_field_is_prepended_and_internal() {
        let sig: Signature = "question -> answer".parse().unwrap();
        let generator = Generator::builder(sig).thought_field("reasoning").build().unwrap();
        let outputs = &generator.signature().outputs;
        assert_eq!(outputs[0].name, "reasoning");
        assert!(outputs[0].internal);
        let prompt = generator.template().system_prompt();
        assert!(prompt.contains("Reasoning: (This string field must be included)"));
    }

    #[test]
    fn test_thought_field_clash_is_rejected() {
        let sig: Signature = "question -> answer".parse().unwrap();
        let err = Generator::builder(sig).thought_field("answer").build().unwrap_err();
        assert!(matches!(err, GenError::Signature(_)));
    }

    #[test]
    fn test_invalid_signature_is_rejected() {
        assert!(matches!(Generator::new("question ->"), Err(GenError::Parse(_))));
    }

    #[tokio::test]
    async fn test_non_object_inputs() {
        let ai = MockAi::new();
        let generator = Generator::new("q -> a").unwrap();
        let err = generator.forward(&ai, json!(["q"])).await.unwrap_err();
        assert!(matches!(err, GenError::Render(RenderError::NotAnObject)));
        assert_eq!(ai.call_count(), 0);
    }

    #[tokio::test]
    async fn test_request_carries_config() {
        let ai = MockAi::new();
        ai.queue_text("A: ok");
        let generator = Generator::builder("q -> a".parse().unwrap())
            .model("tiny")
            .config(GenerateConfig {
                temperature: Some(0.2),
                model: Some("tiny".into()),
                ..Default::default()
            })
            .build()
            .unwrap();
        generator.forward(&ai, json!({"q": "hi"})).await.unwrap();
        let request = &ai.requests()[0];
        assert_eq!(request.model.as_deref(), Some("tiny"));
        assert_eq!(request.temperature, Some(0.2));
        assert!(request.functions.is_empty());
        assert_eq!(request.messages.len(), 2);
    }

    #[test]
    fn test_processors_are_checked_against_outputs() {
        let sig: Signature = "q -> a, n:number".parse().unwrap();
        let unknown = Generator::builder(sig.clone())
            .processor(FieldProcessor::new("q", |v, _| Some(v.clone())))
            .build()
            .unwrap_err();
        assert!(matches!(unknown, GenError::Processor { ref field, .. } if field == "q"));

        let numeric = Generator::builder(sig.clone())
            .processor(FieldProcessor::streaming("n", |t, _| Some(json!(t))))
            .build()
            .unwrap_err();
        assert!(matches!(numeric, GenError::Processor { ref field, .. } if field == "n"));

        Generator::builder(sig)
            .processor(FieldProcessor::streaming("a", |t, _| Some(json!(t.len()))))
            .processor(FieldProcessor::new("n", |v, _| Some(v.clone())))
            .build()
            .unwrap();
    }

    #[test]
    fn test_prompted_template_only_differs_with_functions() {
        let plain = Generator::new("q -> a").unwrap();
        assert_eq!(
            plain.prompted_template().system_prompt(),
            plain.template().system_prompt()
        );
    }
}
