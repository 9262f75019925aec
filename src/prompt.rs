//! Builds the conversation sent to the model for a signature.
//!
//! The system prompt tells the model to answer with one `Title: value`
//! header per output field, each at the start of a line. The extractor
//! looks for exactly these headers, so the two modules share one
//! convention.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ai::{ChatMessage, ContentPart};
use crate::extract::FieldValues;
use crate::extract::coerce::{parse_date, parse_datetime};
use crate::function::{FunctionCallRecord, FunctionRegistry};
use crate::signature::{Field, FieldKind, FieldType, Signature, SignatureError, to_title};

const FUNCTION_CALL_INSTRUCTIONS: &str = "## Function Call Instructions
- Complete the task, using the functions defined earlier in this prompt.
- Call functions step-by-step, using the output of one function as input to the next.
- Use the function results to generate the output fields.";

const PROMPT_CALL_INSTRUCTIONS: &str = "## Function Call Instructions
- To call a function, write its title as a field header followed by a JSON object of arguments.
- Write only function fields when calling functions; their results arrive in the next message.
- Once the results are enough, write the output fields and no function fields.";

const FORMATTING_RULES: &str = "## Strict Output Formatting Rules
- Output must strictly follow the plain-text `Field Title: value` format, \
with each field header at the start of its own line.
- Output the fields in the order listed under Output Fields.
- Write list fields as a markdown list under the header, one `- item` per line.
- Do not add any text before or after the output fields.
- Do not use code blocks.";

/// Problems with the values supplied for rendering. Raised before any model
/// call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("Value for input field '{field}' is required")]
    MissingInput { field: String },

    #[error("Invalid value for input field '{field}': {message}")]
    InvalidInput { field: String, message: String },

    #[error("Inputs must be a JSON object")]
    NotAnObject,

    #[error("Invalid demo #{index}: {message}")]
    InvalidDemo { index: usize, message: String },
}

/// A worked example shown to the model before the live input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demo {
    pub inputs: FieldValues,
    pub outputs: FieldValues,
}

impl Demo {
    pub fn new(inputs: FieldValues, outputs: FieldValues) -> Self {
        Self { inputs, outputs }
    }
}

/// Capitalizes the first letter and ends with a period.
pub fn format_description(text: &str) -> String {
    let trimmed = text.trim();
    let mut chars = trimmed.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let mut out: String = first.to_uppercase().chain(chars).collect();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

/// What went wrong with the previous answer, for the correction message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correction {
    pub field_title: Option<String>,
    pub value: Option<String>,
    pub message: String,
}

/// The user message carrying function results to a backend without native
/// function calling.
pub fn render_function_results(records: &[FunctionCallRecord]) -> String {
    let mut text = String::from("Function results:");
    for record in records {
        match &record.result {
            Ok(output) => text.push_str(&format!("\n- `{}`: {output}", record.name)),
            Err(error) => text.push_str(&format!("\n- `{}` failed: {error}", record.name)),
        }
    }
    text
}

/// The user message reporting a field processor's result.
pub fn render_processed(field_title: &str, result: &Value) -> String {
    let text = match result {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    format!(
        "The field \"{field_title}\" was processed. \
         The field contents were transformed into the following output: {text}"
    )
}

/// The user message sent after a rejected answer.
pub fn render_correction(correction: &Correction) -> String {
    let mut text = String::from("The previous output had a problem that must be fixed.\n");
    if let Some(title) = &correction.field_title {
        text.push_str(&format!("Field: `{title}`\n"));
    }
    if let Some(value) = &correction.value {
        text.push_str(&format!("Value: {value}\n"));
    }
    text.push_str(&format!("Problem: {}\n\n", correction.message));
    text.push_str("Respond again with all output fields, following the output format exactly.");
    text
}

/// The compiled prompt for one signature. Immutable once built.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    signature: Signature,
    system: String,
}

impl PromptTemplate {
    pub fn new(signature: &Signature, functions: &FunctionRegistry) -> Self {
        let style = (!functions.is_empty()).then_some(FunctionStyle::Native);
        Self {
            signature: signature.clone(),
            system: compose(signature, functions, style),
        }
    }

    /// Template for backends without native function calling. Every function
    /// becomes an optional JSON output field named after it, and every real
    /// output turns optional so a turn may hold only function fields. Fails
    /// when a function name is not a usable field name or clashes with an
    /// output field.
    pub fn with_prompt_functions(
        signature: &Signature,
        functions: &FunctionRegistry,
    ) -> Result<Self, SignatureError> {
        let mut calling = signature.clone();
        for field in &mut calling.outputs {
            field.optional = true;
        }
        for function in functions.iter() {
            calling.outputs.push(
                Field::new(function.name.clone())
                    .typed(FieldType::Json)
                    .optional()
                    .describe(format!("Arguments for calling `{}`", function.name)),
            );
        }
        calling.validate()?;

        Ok(Self {
            system: compose(signature, functions, Some(FunctionStyle::Prompt)),
            signature: calling,
        })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn system_prompt(&self) -> &str {
        &self.system
    }

    /// System prompt, demo pairs, then the live user turn.
    pub fn render(
        &self,
        values: &FieldValues,
        demos: &[Demo],
    ) -> Result<Vec<ChatMessage>, RenderError> {
        let mut messages = Vec::with_capacity(2 + demos.len() * 2);
        messages.push(ChatMessage::system(self.system.clone()));

        for (index, demo) in demos.iter().enumerate() {
            let inputs = self
                .render_inputs(&demo.inputs)
                .map_err(|e| RenderError::InvalidDemo {
                    index,
                    message: e.to_string(),
                })?;
            let output = self.render_outputs(&demo.outputs);
            if output.is_empty() {
                return Err(RenderError::InvalidDemo {
                    index,
                    message: "demo has no output values".to_string(),
                });
            }
            messages.push(ChatMessage::user_parts(inputs));
            messages.push(ChatMessage::assistant(output));
        }

        messages.push(ChatMessage::user_parts(self.render_inputs(values)?));
        Ok(messages)
    }

    /// Output values written the way the model is asked to write them.
    pub fn render_outputs(&self, values: &FieldValues) -> String {
        self.signature
            .outputs
            .iter()
            .filter_map(|f| {
                let value = values.get(&f.name)?;
                (!is_empty_value(value)).then(|| format_field(f, value))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render_inputs(&self, values: &FieldValues) -> Result<Vec<ContentPart>, RenderError> {
        let mut parts = Vec::new();
        for field in &self.signature.inputs {
            let value = match values.get(&field.name) {
                Some(v) if !is_empty_value(v) => v,
                _ if field.optional => continue,
                _ => {
                    return Err(RenderError::MissingInput {
                        field: field.name.clone(),
                    });
                }
            };
            check_input(field, value).map_err(|message| RenderError::InvalidInput {
                field: field.name.clone(),
                message,
            })?;

            if field.field_type.is_media() {
                push_text(&mut parts, format!("{}: ", field.title()));
                match value {
                    Value::Array(items) => {
                        for item in items {
                            parts.push(media_part(&field.field_type, item));
                        }
                    }
                    item => parts.push(media_part(&field.field_type, item)),
                }
            } else {
                push_text(&mut parts, format_field(field, value));
            }
        }
        Ok(parts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionStyle {
    /// Definitions travel with the request.
    Native,
    /// Calls are written as output fields.
    Prompt,
}

fn compose(
    signature: &Signature,
    functions: &FunctionRegistry,
    style: Option<FunctionStyle>,
) -> String {
    let mut sections = Vec::new();

    let titles = |fields: &[Field]| {
        fields
            .iter()
            .map(|f| format!("`{}`", f.title()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let task = if signature.inputs.is_empty() {
        format!("Your task is to generate new fields: {}.", titles(&signature.outputs))
    } else {
        format!(
            "You will be provided with the following fields: {}. \
             Your task is to generate new fields: {}.",
            titles(&signature.inputs),
            titles(&signature.outputs)
        )
    };
    sections.push(task);

    if let Some(style) = style {
        let list = functions
            .iter()
            .map(|f| match style {
                FunctionStyle::Native => {
                    format!("- `{}`: {}", f.name, format_description(&f.description))
                }
                FunctionStyle::Prompt => format!(
                    "- `{}`: {} Arguments: {}",
                    to_title(&f.name),
                    format_description(&f.description),
                    f.definition().parameters
                ),
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Available Functions\n{list}"));
    }

    if !signature.inputs.is_empty() {
        let rows = signature.inputs.iter().map(|f| {
            let type_desc = f.type_description();
            let note = if f.optional {
                format!("This optional {type_desc} field may be omitted")
            } else {
                format!("A {type_desc} field")
            };
            field_row(f, &note)
        });
        sections.push(format!("## Input Fields\n{}", rows.collect::<Vec<_>>().join("\n")));
    }

    let rows = signature.outputs.iter().map(|f| {
        let type_desc = f.type_description();
        let note = if f.optional {
            format!("Only include this {type_desc} field if its value is available")
        } else {
            format!("This {type_desc} field must be included")
        };
        field_row(f, &note)
    });
    sections.push(format!("## Output Fields\n{}", rows.collect::<Vec<_>>().join("\n")));

    match style {
        Some(FunctionStyle::Native) => sections.push(FUNCTION_CALL_INSTRUCTIONS.to_string()),
        Some(FunctionStyle::Prompt) => sections.push(PROMPT_CALL_INSTRUCTIONS.to_string()),
        None => {}
    }
    sections.push(FORMATTING_RULES.to_string());

    if let Some(desc) = &signature.description {
        sections.push(format_description(desc));
    }

    sections.join("\n\n")
}

fn field_row(field: &Field, note: &str) -> String {
    match &field.description {
        Some(desc) => format!("{}: ({note}) {}", field.title(), format_description(desc)),
        None => format!("{}: ({note})", field.title()),
    }
}

fn push_text(parts: &mut Vec<ContentPart>, text: String) {
    match parts.last_mut() {
        Some(ContentPart::Text { text: last }) => {
            last.push('\n');
            last.push_str(&text);
        }
        _ => parts.push(ContentPart::text(text)),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}

fn format_field(field: &Field, value: &Value) -> String {
    match (field.kind, value) {
        (FieldKind::Array, Value::Array(items)) => {
            let list = items
                .iter()
                .map(|item| format!("- {}", value_text(item)))
                .collect::<Vec<_>>()
                .join("\n");
            format!("{}:\n{list}", field.title())
        }
        _ => format!("{}: {}", field.title(), value_text(value)),
    }
}

fn media_part(field_type: &FieldType, value: &Value) -> ContentPart {
    let data = value["data"].as_str().unwrap_or_default().to_string();
    let mime = value["mimeType"].as_str().map(str::to_string);
    match field_type {
        FieldType::Audio => ContentPart::Audio {
            mime_type: mime.unwrap_or_else(|| "audio/wav".to_string()),
            data,
        },
        _ => ContentPart::Image {
            mime_type: mime.unwrap_or_default(),
            data,
        },
    }
}

fn check_input(field: &Field, value: &Value) -> Result<(), String> {
    match (field.kind, value) {
        (FieldKind::Array, Value::Array(items)) => items
            .iter()
            .try_for_each(|item| check_scalar(&field.field_type, item)),
        (FieldKind::Array, _) => Err(format!("expected a list of {}", field.field_type.describe())),
        (FieldKind::Scalar, value) => check_scalar(&field.field_type, value),
    }
}

fn check_scalar(field_type: &FieldType, value: &Value) -> Result<(), String> {
    let expected = || -> Result<(), String> {
        Err(format!("expected {}, got {value}", field_type.describe()))
    };
    match field_type {
        FieldType::String => match value {
            Value::String(_) => Ok(()),
            _ => expected(),
        },
        FieldType::Number => match value {
            Value::Number(_) => Ok(()),
            _ => expected(),
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => Ok(()),
            _ => expected(),
        },
        FieldType::Json => Ok(()),
        FieldType::Date => match value {
            Value::String(s) => parse_date(s).map(|_| ()),
            _ => expected(),
        },
        FieldType::DateTime => match value {
            Value::String(s) => parse_datetime(s).map(|_| ()),
            _ => expected(),
        },
        FieldType::Class(classes) => match value {
            Value::String(s) if classes.contains(s) => Ok(()),
            _ => Err(format!("expected one of: {}", classes.join(", "))),
        },
        FieldType::Image => match value {
            Value::Object(obj) if obj.get("mimeType").is_some_and(Value::is_string)
                && obj.get("data").is_some_and(Value::is_string) =>
            {
                Ok(())
            }
            _ => Err("image values must be objects with `mimeType` and `data`".to_string()),
        },
        FieldType::Audio => match value {
            Value::Object(obj) if obj.get("data").is_some_and(Value::is_string) => Ok(()),
            _ => Err("audio values must be objects with `data`".to_string()),
        },
    }
}
