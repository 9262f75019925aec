//! Callable functions the model may request during generation.
//!
//! A [`FunctionSpec`] pairs a name, description and optional JSON schema for
//! the arguments with a [`FunctionHandler`]. Specs live in a
//! [`FunctionRegistry`], an append-only list that is built once and shared
//! read-only across calls.

pub mod executor;

pub use executor::{FunctionCallRecord, assign_call_ids, execute_calls};

use async_trait::async_trait;
use serde_json::{Value, json};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::ai::FunctionDefinition;

/// Failure reported by a handler. The message is shown to the model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError(e.to_string())
    }
}

/// Problems with a function call or the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FunctionError {
    #[error("Function '{0}' is not registered")]
    NotFound(String),

    #[error("Invalid arguments for '{name}': {message}")]
    Argument { name: String, message: String },

    #[error("Function '{name}' failed: {message}")]
    Execution { name: String, message: String },

    #[error("Function '{0}' is already registered")]
    Duplicate(String),
}

/// Implemented by anything that can serve a function call.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value, HandlerError>;
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> FunctionHandler for AsyncFnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, args: Value) -> Result<Value, HandlerError> {
        (self.0)(args).await
    }
}

struct SyncFnHandler<F>(F);

#[async_trait]
impl<F> FunctionHandler for SyncFnHandler<F>
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync,
{
    async fn call(&self, args: Value) -> Result<Value, HandlerError> {
        (self.0)(args)
    }
}

/// Wrap an async closure as a handler.
pub fn function_fn<F, Fut>(f: F) -> impl FunctionHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    AsyncFnHandler(f)
}

/// Wrap a synchronous closure as a handler.
pub fn sync_function_fn<F>(f: F) -> impl FunctionHandler
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    SyncFnHandler(f)
}

/// A function the model may call.
#[derive(Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object. `None` accepts any object.
    pub parameters: Option<Value>,
    /// Handler failures abort generation instead of being reported back to
    /// the model.
    pub fatal: bool,
    handler: Arc<dyn FunctionHandler>,
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("fatal", &self.fatal)
            .finish_non_exhaustive()
    }
}

impl FunctionSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl FunctionHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            fatal: false,
            handler: Arc::new(handler),
        }
    }

    pub fn parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn handler(&self) -> &Arc<dyn FunctionHandler> {
        &self.handler
    }

    /// What the backend is told about this function.
    pub fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        }
    }

    /// Checks `args` against the declared schema.
    pub fn validate_arguments(&self, args: &Value) -> Result<(), FunctionError> {
        let Some(schema) = &self.parameters else {
            return Ok(());
        };
        let validator = jsonschema::validator_for(schema).map_err(|e| FunctionError::Argument {
            name: self.name.clone(),
            message: format!("invalid parameter schema: {e}"),
        })?;
        let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FunctionError::Argument {
                name: self.name.clone(),
                message: errors.join("; "),
            })
        }
    }
}

/// Ordered, append-only collection of functions.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: Vec<FunctionSpec>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a function. Names must be unique.
    pub fn register(&mut self, spec: FunctionSpec) -> Result<(), FunctionError> {
        if self.position(&spec.name).is_some() {
            return Err(FunctionError::Duplicate(spec.name));
        }
        self.functions.push(spec);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, spec: FunctionSpec) -> Result<Self, FunctionError> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSpec> {
        self.position(name).map(|i| &self.functions[i])
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionSpec> {
        self.functions.iter()
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.functions.iter().map(FunctionSpec::definition).collect()
    }
}
