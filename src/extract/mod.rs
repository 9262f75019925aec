//! Incremental decoding of model output into typed field values.
//!
//! The model writes each output field as `Title: value`, with the header at
//! the start of a line. [`StreamingExtractor`] consumes that text in chunks
//! of any size and finalizes a field as soon as the next header (or the end
//! of the stream) proves its value complete. Finalized values are never
//! revisited, and the final map does not depend on how the text was split.

pub mod coerce;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::signature::{Field, FieldKind, FieldType};

pub use coerce::{coerce_field, parse_markdown_list};

/// Field values keyed by field name, in output-field order.
pub type FieldValues = Map<String, Value>;

/// A field-level problem with the model's output. These never abort a call
/// on their own; they drive a corrective retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("Required field not found: {title}")]
    Missing { field: String, title: String },

    #[error("Invalid value for {title}: {message}")]
    Invalid {
        field: String,
        title: String,
        value: String,
        message: String,
    },
}

impl FieldError {
    pub fn field(&self) -> &str {
        match self {
            FieldError::Missing { field, .. } | FieldError::Invalid { field, .. } => field,
        }
    }

    /// The offending raw text, if there was any.
    pub fn value(&self) -> Option<&str> {
        match self {
            FieldError::Missing { .. } => None,
            FieldError::Invalid { value, .. } => Some(value),
        }
    }

    fn missing(field: &Field) -> Self {
        FieldError::Missing {
            field: field.name.clone(),
            title: field.title(),
        }
    }
}

/// A field whose value is settled. `value` is `None` for an optional field
/// the model left empty.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedField {
    pub name: String,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SeekingHeader,
    InField { index: usize, value_start: usize },
    Done,
}

struct Header {
    index: usize,
    /// Byte offset just past the header's colon.
    value_start: usize,
}

pub struct StreamingExtractor {
    fields: Vec<Field>,
    titles: Vec<String>,
    buffer: String,
    /// Start of the first line not yet classified.
    scan_pos: usize,
    /// `scan_pos` sits inside a header line whose remainder is field text.
    mid_line: bool,
    /// Lowest field index that may still appear as a header.
    next_index: usize,
    phase: Phase,
    values: FieldValues,
}

impl StreamingExtractor {
    pub fn new(fields: &[Field]) -> Self {
        Self {
            fields: fields.to_vec(),
            titles: fields.iter().map(Field::title).collect(),
            buffer: String::new(),
            scan_pos: 0,
            mid_line: false,
            next_index: 0,
            phase: Phase::SeekingHeader,
            values: FieldValues::new(),
        }
    }

    /// Feed the next chunk. Returns fields finalized by this chunk, in order.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<FinalizedField>, FieldError> {
        if self.phase == Phase::Done {
            return Ok(Vec::new());
        }
        self.buffer.push_str(chunk);

        let mut finalized = Vec::new();
        loop {
            let rest = &self.buffer[self.scan_pos..];
            let newline = rest.find('\n');

            if self.mid_line {
                let Some(nl) = newline else { break };
                self.scan_pos += nl + 1;
                self.mid_line = false;
                continue;
            }

            let line = match newline {
                Some(nl) => &rest[..nl],
                None => rest,
            };

            // A header needs its colon, so a partial line can match early;
            // any longer version of the same line would match identically.
            if let Some(header) = self.match_header(line) {
                let header_start = self.scan_pos;
                let value_start = header_start + header.value_start;
                if let Some(field) = self.close_current(header_start)? {
                    finalized.push(field);
                }
                self.check_skipped(header.index)?;
                for skipped in self.next_index..header.index {
                    log::debug!("optional field {} not present", self.fields[skipped].name);
                    finalized.push(FinalizedField {
                        name: self.fields[skipped].name.clone(),
                        value: None,
                    });
                }
                self.phase = Phase::InField {
                    index: header.index,
                    value_start,
                };
                self.next_index = header.index + 1;
                self.scan_pos = value_start;
                self.mid_line = true;
                continue;
            }

            match newline {
                Some(nl) => self.scan_pos += nl + 1,
                None => break,
            }
        }
        Ok(finalized)
    }

    /// Signal end of stream. Finalizes the field in progress from whatever
    /// text it has, then fails if any required field never appeared.
    pub fn finish(&mut self) -> Result<Vec<FinalizedField>, FieldError> {
        let mut finalized = Vec::new();
        match self.phase {
            Phase::Done => return Ok(finalized),
            Phase::InField { .. } => {
                let end = self.buffer.len();
                if let Some(field) = self.close_current(end)? {
                    finalized.push(field);
                }
            }
            Phase::SeekingHeader => {
                if let Some(field) = self.whole_text_fallback() {
                    self.next_index = 1;
                    finalized.push(field);
                }
            }
        }

        self.check_skipped(self.fields.len())?;
        for skipped in self.next_index..self.fields.len() {
            finalized.push(FinalizedField {
                name: self.fields[skipped].name.clone(),
                value: None,
            });
        }
        self.next_index = self.fields.len();
        self.phase = Phase::Done;
        Ok(finalized)
    }

    /// Values finalized so far.
    pub fn values(&self) -> &FieldValues {
        &self.values
    }

    pub fn into_values(self) -> FieldValues {
        self.values
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// The field currently being accumulated, with its best-effort value.
    /// Text that doesn't coerce yet yields `None`.
    pub fn tentative(&self) -> Option<(&str, Value)> {
        let Phase::InField { index, value_start } = self.phase else {
            return None;
        };
        let field = &self.fields[index];
        match coerce_field(field, &self.buffer[value_start..]) {
            Ok(Some(value)) => Some((field.name.as_str(), value)),
            _ => None,
        }
    }

    /// The field currently being accumulated and its raw text so far.
    pub fn partial(&self) -> Option<(&str, &str)> {
        let Phase::InField { index, value_start } = self.phase else {
            return None;
        };
        Some((self.fields[index].name.as_str(), self.buffer[value_start..].trim()))
    }

    /// Names of fields not finalized yet.
    pub fn pending(&self) -> Vec<&str> {
        let current = match self.phase {
            Phase::InField { index, .. } => Some(index),
            _ => None,
        };
        current
            .into_iter()
            .chain(self.next_index..self.fields.len())
            .map(|i| self.fields[i].name.as_str())
            .collect()
    }

    /// Everything received so far.
    pub fn raw(&self) -> &str {
        &self.buffer
    }

    fn match_header(&self, line: &str) -> Option<Header> {
        let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
        let body = &line[indent..];

        let mut best: Option<(usize, usize)> = None;
        for index in self.next_index..self.fields.len() {
            for label in [self.titles[index].as_str(), self.fields[index].name.as_str()] {
                let len = label.len();
                let matches = body.len() > len
                    && body.is_char_boundary(len)
                    && body[..len].eq_ignore_ascii_case(label)
                    && body[len..].starts_with(':');
                if matches && best.is_none_or(|(_, best_len)| len > best_len) {
                    best = Some((index, len));
                }
            }
        }
        best.map(|(index, len)| Header {
            index,
            value_start: indent + len + 1,
        })
    }

    /// Fails if a required field before `upto` was skipped over.
    fn check_skipped(&self, upto: usize) -> Result<(), FieldError> {
        match self.fields[self.next_index..upto].iter().find(|f| !f.optional) {
            Some(field) => Err(FieldError::missing(field)),
            None => Ok(()),
        }
    }

    fn close_current(&mut self, end: usize) -> Result<Option<FinalizedField>, FieldError> {
        let Phase::InField { index, value_start } = self.phase else {
            return Ok(None);
        };
        self.phase = Phase::SeekingHeader;
        let field = &self.fields[index];
        let raw = &self.buffer[value_start..end];

        let value = coerce_field(field, raw).map_err(|message| FieldError::Invalid {
            field: field.name.clone(),
            title: self.titles[index].clone(),
            value: raw.trim().to_string(),
            message,
        })?;

        match &value {
            Some(v) => {
                log::debug!("finalized field {}", field.name);
                self.values.insert(field.name.clone(), v.clone());
            }
            None if !field.optional => return Err(FieldError::missing(field)),
            None => {}
        }
        Ok(Some(FinalizedField {
            name: field.name.clone(),
            value,
        }))
    }

    /// With no header anywhere, a lone plain-string output takes the whole
    /// text.
    fn whole_text_fallback(&mut self) -> Option<FinalizedField> {
        let [field] = self.fields.as_slice() else {
            return None;
        };
        if self.next_index != 0
            || field.kind != FieldKind::Scalar
            || field.field_type != FieldType::String
        {
            return None;
        }
        let text = self.buffer.trim();
        if text.is_empty() {
            return None;
        }
        let value = Value::String(text.to_string());
        self.values.insert(field.name.clone(), value.clone());
        Some(FinalizedField {
            name: field.name.clone(),
            value: Some(value),
        })
    }
}

/// Extracts every output field from a complete response.
pub fn extract_all(fields: &[Field], text: &str) -> Result<FieldValues, FieldError> {
    let mut extractor = StreamingExtractor::new(fields);
    extractor.push(text)?;
    extractor.finish()?;
    Ok(extractor.into_values())
}
