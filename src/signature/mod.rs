//! Declarative input/output contracts for one generation call.
//!
//! A [`Signature`] lists typed input fields the caller supplies and typed
//! output fields the model must produce. Signatures are built either with
//! the fluent API or parsed from the compact DSL:
//!
//! ```rust
//! use sigforge::Signature;
//!
//! let sig: Signature = r#""Answer trivia" question:string -> answer:string "short answer""#
//!     .parse()
//!     .unwrap();
//! assert_eq!(sig.outputs[0].name, "answer");
//! ```

pub mod parser;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

pub use parser::{ParseError, parse_signature};

/// The value type carried by a field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "name", content = "classes", rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Json,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    /// Classification label restricted to the listed classes.
    Class(Vec<String>),
    Image,
    Audio,
}

impl FieldType {
    /// The DSL keyword for this type.
    pub fn keyword(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Json => "json",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Class(_) => "class",
            FieldType::Image => "image",
            FieldType::Audio => "audio",
        }
    }

    /// Human-readable description used in prompts and correction messages.
    pub fn describe(&self) -> String {
        match self {
            FieldType::String => "string".to_string(),
            FieldType::Number => "number".to_string(),
            FieldType::Boolean => "boolean (true or false)".to_string(),
            FieldType::Json => "JSON object".to_string(),
            FieldType::Date => "date (\"YYYY-MM-DD\" format)".to_string(),
            FieldType::DateTime => "date time (\"YYYY-MM-DD HH:MM:SS\" format, UTC)".to_string(),
            FieldType::Class(classes) => {
                format!("classification class (allowed classes: {})", classes.join(", "))
            }
            FieldType::Image => "image".to_string(),
            FieldType::Audio => "audio".to_string(),
        }
    }

    /// Binary media types can only be supplied as inputs.
    pub fn is_media(&self) -> bool {
        matches!(self, FieldType::Image | FieldType::Audio)
    }
}

/// Whether a field holds one value or a list of values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Scalar,
    Array,
}

/// A single field in a signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub field_type: FieldType,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub optional: bool,
    /// Produced by the model but hidden from the caller's result.
    #[serde(default)]
    pub internal: bool,
}

impl Field {
    /// A required scalar string field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            field_type: FieldType::String,
            kind: FieldKind::Scalar,
            optional: false,
            internal: false,
        }
    }

    pub fn typed(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn array(mut self) -> Self {
        self.kind = FieldKind::Array;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        let trimmed = description.trim();
        self.description = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn is_array(&self) -> bool {
        self.kind == FieldKind::Array
    }

    /// The header the model writes in front of this field's value.
    pub fn title(&self) -> String {
        to_title(&self.name)
    }

    /// Type description including the array wrapper, for prompts.
    pub fn type_description(&self) -> String {
        match self.kind {
            FieldKind::Scalar => self.field_type.describe(),
            FieldKind::Array => format!("list of {} items", self.field_type.describe()),
        }
    }
}

/// Converts a field name into its rendered header: `user_name` becomes
/// `User name`, `firstName` becomes `First Name`.
pub fn to_title(name: &str) -> String {
    let mut spaced = String::with_capacity(name.len() + 4);
    let mut in_digits = false;
    for ch in name.chars() {
        if ch == '_' {
            spaced.push(' ');
            in_digits = false;
            continue;
        }
        if ch.is_ascii_uppercase() || (ch.is_ascii_digit() && !in_digits) {
            spaced.push(' ');
        }
        in_digits = ch.is_ascii_digit();
        spaced.push(ch);
    }

    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Labels are written comma separated in the DSL, so they can't hold
/// separators themselves.
fn is_class_label(label: &str) -> bool {
    !label.is_empty() && !label.contains(|c: char| c == ',' || c.is_whitespace())
}

/// Structural problems with a signature.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature must declare at least one output field")]
    NoOutputs,

    #[error("duplicate {section} field '{name}'")]
    DuplicateField { section: &'static str, name: String },

    #[error(
        "invalid field name '{0}': names must start with a letter or underscore \
         and contain only letters, digits or underscores"
    )]
    InvalidName(String),

    #[error("input field '{0}' cannot be internal")]
    InternalInput(String),

    #[error("output field '{name}' cannot have type {kind}; media types are input-only")]
    MediaOutput { name: String, kind: &'static str },

    #[error("class field '{0}' needs at least one class label")]
    EmptyClasses(String),

    #[error("class field '{field}' has invalid label '{label}': no commas or whitespace allowed")]
    InvalidClassLabel { field: String, label: String },
}

/// The semantic contract for a generation call, defining inputs and outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub inputs: Vec<Field>,
    pub outputs: Vec<Field>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signature-level task description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        let trimmed = description.trim();
        self.description = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    /// Add a string input field to the signature.
    pub fn input(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.input_field(Field::new(name).describe(description))
    }

    /// Add a string output field to the signature.
    pub fn output(self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.output_field(Field::new(name).describe(description))
    }

    pub fn input_field(mut self, field: Field) -> Self {
        self.inputs.push(field);
        self
    }

    pub fn output_field(mut self, field: Field) -> Self {
        self.outputs.push(field);
        self
    }

    pub fn input_by_name(&self, name: &str) -> Option<&Field> {
        self.inputs.iter().find(|f| f.name == name)
    }

    pub fn output_by_name(&self, name: &str) -> Option<&Field> {
        self.outputs.iter().find(|f| f.name == name)
    }

    /// Output fields the caller gets back (everything not marked internal).
    pub fn visible_outputs(&self) -> impl Iterator<Item = &Field> {
        self.outputs.iter().filter(|f| !f.internal)
    }

    /// Checks the invariants every compiled signature must hold.
    pub fn validate(&self) -> Result<(), SignatureError> {
        if self.outputs.is_empty() {
            return Err(SignatureError::NoOutputs);
        }

        for (section, fields) in [("input", &self.inputs), ("output", &self.outputs)] {
            let mut seen = HashSet::new();
            for field in fields {
                if !is_identifier(&field.name) {
                    return Err(SignatureError::InvalidName(field.name.clone()));
                }
                if !seen.insert(field.name.as_str()) {
                    return Err(SignatureError::DuplicateField {
                        section,
                        name: field.name.clone(),
                    });
                }
                if let FieldType::Class(classes) = &field.field_type {
                    if classes.is_empty() {
                        return Err(SignatureError::EmptyClasses(field.name.clone()));
                    }
                    if let Some(label) = classes.iter().find(|l| !is_class_label(l)) {
                        return Err(SignatureError::InvalidClassLabel {
                            field: field.name.clone(),
                            label: label.clone(),
                        });
                    }
                }
            }
        }

        if let Some(field) = self.inputs.iter().find(|f| f.internal) {
            return Err(SignatureError::InternalInput(field.name.clone()));
        }

        if let Some(field) = self.outputs.iter().find(|f| f.field_type.is_media()) {
            return Err(SignatureError::MediaOutput {
                name: field.name.clone(),
                kind: field.field_type.keyword(),
            });
        }

        Ok(())
    }

    /// Returns a stable, structural hash of the signature.
    /// Descriptions are excluded so that prompt refinement doesn't break
    /// structural identity.
    pub fn structural_hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        for field in &self.inputs {
            hash_field_shape(field, &mut hasher);
        }
        "input_separator".hash(&mut hasher);
        for field in &self.outputs {
            hash_field_shape(field, &mut hasher);
        }
        format!("{:016x}", hasher.finish())
    }
}

fn hash_field_shape(field: &Field, hasher: &mut DefaultHasher) {
    field.name.hash(hasher);
    field.field_type.hash(hasher);
    field.kind.hash(hasher);
    field.optional.hash(hasher);
    field.internal.hash(hasher);
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn write_quoted(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in text.chars() {
        if ch == '"' || ch == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{ch}")?;
    }
    f.write_str("\"")
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.internal {
            f.write_str("!")?;
        }
        if self.optional {
            f.write_str("?")?;
        }
        write!(f, ":{}", self.field_type.keyword())?;
        if self.is_array() {
            f.write_str("[]")?;
        }
        if let FieldType::Class(classes) = &self.field_type {
            f.write_str(" ")?;
            write_quoted(f, &classes.join(", "))?;
        }
        if let Some(desc) = &self.description {
            f.write_str(" ")?;
            write_quoted(f, desc)?;
        }
        Ok(())
    }
}

/// Renders the DSL form; the output re-parses to an equal signature.
impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(desc) = &self.description {
            write_quoted(f, desc)?;
            f.write_str(" ")?;
        }
        let join = |fields: &[Field]| {
            fields
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "{} -> {}", join(&self.inputs), join(&self.outputs))
    }
}

impl FromStr for Signature {
    type Err = ParseError;

    /// Parses the signature DSL: `"desc" input1, input2:number -> output1:string[]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_signature(s)
    }
}

/// Macro for rapid signature creation: `signature!("question -> answer")`
#[macro_export]
macro_rules! signature {
    ($s:expr) => {
        $s.parse::<$crate::signature::Signature>()
            .expect("Invalid signature shorthand")
    };
}
