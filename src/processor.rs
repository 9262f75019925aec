//! Caller hooks that post-process output field values.
//!
//! A plain processor sees a field's value once the whole answer has been
//! accepted. A streaming processor sees the text of a string field while it
//! is still arriving, and once more when the field is finalized. Whatever a
//! processor returns is kept in `GenerateOutput::processed`, and is reported
//! back to the model when the same run calls it again.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::extract::FieldValues;

/// What a processor knows besides the field value.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorContext<'a> {
    /// Values finalized so far in the current answer.
    pub values: &'a FieldValues,
    /// `false` while a streamed field is still growing.
    pub done: bool,
}

type ProcessFn = dyn Fn(&Value, ProcessorContext<'_>) -> Option<Value> + Send + Sync;

#[derive(Clone)]
pub struct FieldProcessor {
    pub field: String,
    pub streaming: bool,
    process: Arc<ProcessFn>,
}

impl fmt::Debug for FieldProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldProcessor")
            .field("field", &self.field)
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}

impl FieldProcessor {
    /// Runs on the field's final value after the answer passed every
    /// assertion. Returning `None` records nothing.
    pub fn new<F>(field: impl Into<String>, process: F) -> Self
    where
        F: Fn(&Value, ProcessorContext<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            field: field.into(),
            streaming: false,
            process: Arc::new(process),
        }
    }

    /// Runs on the raw text of a string field as it streams in.
    pub fn streaming<F>(field: impl Into<String>, process: F) -> Self
    where
        F: Fn(&str, ProcessorContext<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            field: field.into(),
            streaming: true,
            process: Arc::new(move |value: &Value, context: ProcessorContext<'_>| {
                process(value.as_str()?, context)
            }),
        }
    }

    /// Calls the hook. Results that say nothing (`null`, an empty string or
    /// the literal text `null`/`undefined`) are dropped.
    pub fn run(&self, value: &Value, context: ProcessorContext<'_>) -> Option<Value> {
        (self.process)(value, context).filter(|result| !is_empty_result(result))
    }
}

fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("undefined")
        }
        _ => false,
    }
}
