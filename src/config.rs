//! Settings for one generator.

use serde::{Deserialize, Serialize};

/// Configuration for a [`Generator`](crate::Generator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    /// Validation retries after the first attempt (default: 10)
    pub max_retries: u32,
    /// Model calls allowed after function results (default: 10)
    pub max_steps: u32,
    /// Use the adapter's streaming path when it supports one
    pub stream: bool,
    /// Function names that end the loop once they succeed. Case-insensitive.
    pub stop_functions: Vec<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Prepends an internal string output of this name for the model's reasoning.
    pub thought_field: Option<String>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            max_steps: 10,
            stream: false,
            stop_functions: Vec::new(),
            model: None,
            temperature: None,
            max_tokens: None,
            thought_field: None,
        }
    }
}

impl GenerateConfig {
    pub fn is_stop_function(&self, name: &str) -> bool {
        self.stop_functions.iter().any(|f| f.eq_ignore_ascii_case(name))
    }
}
