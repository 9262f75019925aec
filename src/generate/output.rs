use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::GenerationState;
use crate::ai::Usage;
use crate::error::GenError;
use crate::extract::FieldValues;
use crate::function::FunctionCallRecord;
use crate::signature::Signature;

/// The result of a successful `forward` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateOutput {
    /// Visible output values, in signature order.
    pub values: FieldValues,
    /// Values of internal fields such as reasoning.
    pub internal: FieldValues,
    /// Summed over every model call, retries and function rounds included.
    pub usage: Usage,
    pub model_calls: u32,
    pub retries: u32,
    /// Model turns in the function-call loop; 1 when no function was called.
    pub steps: u32,
    pub function_calls: Vec<FunctionCallRecord>,
    /// The stop function that ended the loop, if one did.
    pub stopped_by: Option<FunctionCallRecord>,
    pub raw_output: String,
    /// Field processor results, keyed by field name.
    pub processed: FieldValues,
}

impl GenerateOutput {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Deserializes the visible values into a caller type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.values.clone()))
    }
}

/// Splits extracted values into visible and internal maps, both in
/// signature order.
fn split(signature: &Signature, values: &FieldValues) -> (FieldValues, FieldValues) {
    let mut visible = FieldValues::new();
    let mut internal = FieldValues::new();
    for field in &signature.outputs {
        if let Some(value) = values.get(&field.name) {
            let target = if field.internal { &mut internal } else { &mut visible };
            target.insert(field.name.clone(), value.clone());
        }
    }
    (visible, internal)
}

pub(crate) fn visible_values(signature: &Signature, values: &FieldValues) -> FieldValues {
    split(signature, values).0
}

/// Builds the caller-facing result. Every required visible field must be
/// present unless a stop function ended the loop.
pub(crate) fn assemble(
    signature: &Signature,
    state: &GenerationState,
    stopped_by: Option<FunctionCallRecord>,
) -> Result<GenerateOutput, GenError> {
    if stopped_by.is_none() {
        if let Some(missing) = signature
            .visible_outputs()
            .find(|f| !f.optional && !state.extracted.contains_key(&f.name))
        {
            return Err(GenError::MissingField {
                field: missing.name.clone(),
            });
        }
    }

    let (values, internal) = split(signature, &state.extracted);
    Ok(GenerateOutput {
        values,
        internal,
        usage: state.usage,
        model_calls: state.model_calls,
        retries: state.attempt,
        steps: state.steps,
        function_calls: state.function_calls.clone(),
        stopped_by,
        raw_output: state.last_output.clone(),
        processed: state.processed.clone(),
    })
}
