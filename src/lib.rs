//! # Sigforge
//!
//! Signature-driven structured generation for language models.
//!
//! Declare what goes in and what must come out, and sigforge turns that
//! contract into a prompt, decodes the model's answer into typed fields as
//! it streams in, checks the values against your assertions, and drives
//! function calls until the model produces a valid answer.
//!
//! ## Features
//!
//! - **Signatures**: a compact DSL (`question -> answer:string[]`) or a fluent builder
//! - **Streaming Extraction**: fields are finalized as soon as the next header arrives and
//!   are never retracted
//! - **Assertions with Retries**: failed checks become corrections fed back to the model
//! - **Function Calling**: concurrent execution, schema-validated arguments, stop functions
//! - **Backend Agnostic**: anything implementing [`AiService`]; Ollama ships behind the
//!   `ollama` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sigforge::prelude::*;
//! use serde_json::json;
//!
//! # async fn run(ai: &dyn AiService) -> Result<(), GenError> {
//! let generator = Generator::builder(signature!("question -> answer, confidence:number"))
//!     .assert(Assertion::on_field("confidence", "confidence must be between 0 and 1", |v| {
//!         v.as_f64().map(|c| (0.0..=1.0).contains(&c))
//!     }))
//!     .build()?;
//!
//! let output = generator.forward(ai, json!({"question": "Is water wet?"})).await?;
//! println!("{:?}", output.values);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`signature`]: fields, signatures and the DSL parser
//! - [`prompt`]: prompt rendering and demos
//! - [`extract`]: the streaming field extractor
//! - [`assertion`]: caller-supplied checks
//! - [`processor`]: caller hooks over output field values
//! - [`function`]: function specs, registry and execution
//! - [`ai`]: the model backend boundary
//! - [`generate`]: the generation loop
//! - [`prelude`]: commonly used types (import with `use sigforge::prelude::*`)

// ============================================================================
// Modules
// ============================================================================

pub mod ai;
pub mod assertion;
pub mod config;
pub mod error;
pub mod extract;
pub mod function;
pub mod generate;
pub mod processor;
pub mod prompt;
pub mod signature;
pub mod telemetry;

// ============================================================================
// Public Re-exports - Granular Imports
// ============================================================================

// Signatures
pub use signature::{
    Field, FieldKind, FieldType, ParseError, Signature, SignatureError, parse_signature,
};

// Prompting and extraction
pub use extract::{FieldError, FieldValues, FinalizedField, StreamingExtractor, extract_all};
pub use prompt::{Demo, PromptTemplate, RenderError};

// Assertions and functions
pub use assertion::{Assertion, AssertionOutcome, AssertionScope};
pub use processor::{FieldProcessor, ProcessorContext};
pub use function::{
    FunctionCallRecord, FunctionError, FunctionHandler, FunctionRegistry, FunctionSpec,
    HandlerError, function_fn, sync_function_fn,
};

// Model backends
pub use ai::{
    AiError, AiFeatures, AiService, ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream,
    MockAi, Usage,
};

#[cfg(feature = "ollama")]
pub use ai::{Ollama, OllamaConfig};

// Generation
pub use config::GenerateConfig;
pub use error::GenError;
pub use generate::{
    GenerateOutput, GenerationEvent, GenerationState, Generator, GeneratorBuilder, RunOptions,
};
pub use telemetry::{MemoryTelemetry, Telemetry, TraceEntry};

// ============================================================================
// Prelude - Convenient Bulk Import
// ============================================================================

/// Imports everything needed to define and run generators.
///
/// # Example
/// ```rust
/// use sigforge::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        AiService,
        // Assertions
        Assertion,
        AssertionOutcome,
        Demo,
        // Signatures
        Field,
        FieldProcessor,
        FieldType,
        FunctionRegistry,
        // Functions
        FunctionSpec,
        GenError,
        GenerateConfig,
        GenerateOutput,
        GenerationEvent,
        // Generation
        Generator,
        MockAi,
        RunOptions,
        Signature,
        function_fn,
        signature,
        sync_function_fn,
    };
}

// ============================================================================
// Re-export commonly used external types for convenience
// ============================================================================

pub use serde_json::Value as JsonValue;
pub use tokio_util::sync::CancellationToken;

// ============================================================================
// Library Metadata
// ============================================================================

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate.
pub const NAME: &str = env!("CARGO_PKG_NAME");
