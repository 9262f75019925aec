use thiserror::Error;

use crate::ai::AiError;
use crate::function::FunctionError;
use crate::prompt::RenderError;
use crate::signature::SignatureError;
use crate::signature::parser::ParseError;

/// Terminal failures of a generation call.
///
/// Field coercion problems, failed assertions and bad function arguments
/// never show up here directly. They are fed back to the model, and only
/// become [`GenError::Validation`] once the retry budget is spent.
#[derive(Debug, Error)]
pub enum GenError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Invalid signature: {0}")]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Validation failed after {attempts} attempts: {message}")]
    Validation {
        field: Option<String>,
        value: Option<String>,
        message: String,
        attempts: u32,
        raw_output: String,
    },

    #[error("Function '{name}' failed: {message}")]
    FunctionExecution { name: String, message: String },

    #[error("Function call loop did not finish within {max_steps} steps")]
    MaxStepsExceeded { max_steps: u32 },

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Invalid field processor for '{field}': {message}")]
    Processor { field: String, message: String },

    #[error("Required output field missing: {field}")]
    MissingField { field: String },

    #[error("AI service error: {0}")]
    Ai(#[from] AiError),
}

impl From<FunctionError> for GenError {
    fn from(err: FunctionError) -> Self {
        let text = err.to_string();
        match err {
            FunctionError::Execution { name, message } => {
                GenError::FunctionExecution { name, message }
            }
            FunctionError::NotFound(name)
            | FunctionError::Duplicate(name)
            | FunctionError::Argument { name, .. } => GenError::FunctionExecution {
                name,
                message: text,
            },
        }
    }
}

impl GenError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenError::Cancelled)
    }
}
