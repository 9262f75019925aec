//! Caller-supplied checks over extracted values.
//!
//! Assertions run in registration order and the first failure wins. A
//! failed assertion does not abort the call: its message is fed back to the
//! model as a correction and the model gets another attempt.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::extract::FieldValues;

/// What a predicate concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionOutcome {
    Pass,
    /// Fail with the assertion's own message.
    Fail,
    /// Fail with a specific message.
    FailWith(String),
    /// Not enough data to judge yet.
    Skip,
}

impl From<bool> for AssertionOutcome {
    fn from(ok: bool) -> Self {
        if ok {
            AssertionOutcome::Pass
        } else {
            AssertionOutcome::Fail
        }
    }
}

impl From<Option<bool>> for AssertionOutcome {
    fn from(ok: Option<bool>) -> Self {
        ok.map_or(AssertionOutcome::Skip, AssertionOutcome::from)
    }
}

impl From<Result<(), String>> for AssertionOutcome {
    fn from(result: Result<(), String>) -> Self {
        match result {
            Ok(()) => AssertionOutcome::Pass,
            Err(message) => AssertionOutcome::FailWith(message),
        }
    }
}

/// When an assertion runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionScope {
    /// Once, on the complete values.
    Final,
    /// After every finalized field while streaming, and on the final values.
    Streaming,
}

type Predicate = dyn Fn(&FieldValues) -> AssertionOutcome + Send + Sync;

#[derive(Clone)]
pub struct Assertion {
    pub message: String,
    pub scope: AssertionScope,
    /// The field this assertion is about, if any.
    pub field: Option<String>,
    /// Whether internal fields are visible to the predicate.
    pub include_internal: bool,
    predicate: Arc<Predicate>,
}

impl fmt::Debug for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assertion")
            .field("message", &self.message)
            .field("scope", &self.scope)
            .field("field", &self.field)
            .field("include_internal", &self.include_internal)
            .finish_non_exhaustive()
    }
}

impl Assertion {
    pub fn new<F, O>(message: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&FieldValues) -> O + Send + Sync + 'static,
        O: Into<AssertionOutcome>,
    {
        Self {
            message: message.into(),
            scope: AssertionScope::Final,
            field: None,
            include_internal: false,
            predicate: Arc::new(move |values| predicate(values).into()),
        }
    }

    /// Assertion on a single field's value. Skips while the field is absent.
    pub fn on_field<F, O>(
        field: impl Into<String>,
        message: impl Into<String>,
        predicate: F,
    ) -> Self
    where
        F: Fn(&Value) -> O + Send + Sync + 'static,
        O: Into<AssertionOutcome>,
    {
        let field = field.into();
        let name = field.clone();
        let mut assertion = Self::new(message, move |values: &FieldValues| match values.get(&name) {
            Some(value) => predicate(value).into(),
            None => AssertionOutcome::Skip,
        });
        assertion.field = Some(field);
        assertion
    }

    pub fn streaming(mut self) -> Self {
        self.scope = AssertionScope::Streaming;
        self
    }

    pub fn with_internal(mut self) -> Self {
        self.include_internal = true;
        self
    }

    pub fn check(&self, values: &FieldValues) -> AssertionOutcome {
        (self.predicate)(values)
    }
}

/// A failed assertion, ready to be turned into a correction.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionFailure {
    pub message: String,
    pub field: Option<String>,
    pub value: Option<Value>,
}

/// Runs `assertions` in order against `values`, stopping at the first
/// failure. `visible` is the view without internal fields.
pub fn evaluate<'a>(
    assertions: impl IntoIterator<Item = &'a Assertion>,
    values: &FieldValues,
    visible: &FieldValues,
) -> Option<AssertionFailure> {
    for assertion in assertions {
        let view = if assertion.include_internal { values } else { visible };
        let message = match assertion.check(view) {
            AssertionOutcome::Pass | AssertionOutcome::Skip => continue,
            AssertionOutcome::Fail => assertion.message.clone(),
            AssertionOutcome::FailWith(message) => message,
        };
        let value = assertion.field.as_ref().and_then(|f| view.get(f).cloned());
        return Some(AssertionFailure {
            message,
            field: assertion.field.clone(),
            value,
        });
    }
    None
}
