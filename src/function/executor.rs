//! Runs the function calls requested in one model turn.
//!
//! All calls of a turn start together and the caller resumes only once every
//! one of them has finished. Records come back in request order, so each
//! result stays paired with the call id that produced it.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{FunctionError, FunctionRegistry};
use crate::ai::{ChatMessage, FunctionCall};

/// One executed (or rejected) function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRecord {
    pub id: String,
    pub name: String,
    /// Parsed arguments, or `Null` when they could not be parsed.
    pub args: Value,
    /// Stringified result, or the error text shown to the model.
    pub result: Result<String, String>,
}

impl FunctionCallRecord {
    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }

    /// The function-result message fed back to the model.
    pub fn to_message(&self) -> ChatMessage {
        match &self.result {
            Ok(output) => ChatMessage::function_result(&self.id, output.as_str(), false),
            Err(error) => ChatMessage::function_result(&self.id, error.as_str(), true),
        }
    }
}

/// Strings are passed through untouched; everything else is pretty JSON.
pub(crate) fn stringify_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn parse_arguments(name: &str, raw: &str) -> Result<Value, FunctionError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|e| FunctionError::Argument {
        name: name.to_string(),
        message: format!("arguments are not valid JSON: {e}"),
    })
}

/// Fills in missing call ids so every result can be matched to its call.
pub fn assign_call_ids(calls: &mut [FunctionCall]) {
    for call in calls.iter_mut().filter(|c| c.id.is_empty()) {
        call.id = Uuid::new_v4().to_string();
    }
}

async fn execute_one(
    registry: &FunctionRegistry,
    call: FunctionCall,
) -> Result<FunctionCallRecord, FunctionError> {
    let FunctionCall { id, name, arguments } = call;
    let rejected = |args: Value, error: FunctionError| {
        log::warn!("function call {name} ({id}) rejected: {error}");
        Ok::<_, FunctionError>(FunctionCallRecord {
            id: id.clone(),
            name: name.clone(),
            args,
            result: Err(error.to_string()),
        })
    };

    let Some(spec) = registry.get(&name) else {
        return rejected(Value::Null, FunctionError::NotFound(name.clone()));
    };

    let args = match parse_arguments(&name, &arguments) {
        Ok(args) => args,
        Err(e) => return rejected(Value::Null, e),
    };
    if let Err(e) = spec.validate_arguments(&args) {
        return rejected(args, e);
    }

    log::debug!("invoking function {name} ({id})");
    match spec.handler().call(args.clone()).await {
        Ok(value) => Ok(FunctionCallRecord {
            id,
            name,
            args,
            result: Ok(stringify_result(&value)),
        }),
        Err(e) if spec.fatal => Err(FunctionError::Execution {
            name,
            message: e.to_string(),
        }),
        Err(e) => {
            let error = FunctionError::Execution {
                name: name.clone(),
                message: e.to_string(),
            };
            rejected(args, error)
        }
    }
}

/// Executes every call concurrently and waits for all of them.
///
/// Bad arguments, unknown names and handler failures become error records.
/// Only a failure of a function flagged `fatal` is returned as `Err`.
pub async fn execute_calls(
    registry: &FunctionRegistry,
    mut calls: Vec<FunctionCall>,
) -> Result<Vec<FunctionCallRecord>, FunctionError> {
    assign_call_ids(&mut calls);
    let outcomes = join_all(calls.into_iter().map(|call| execute_one(registry, call))).await;
    outcomes.into_iter().collect()
}
