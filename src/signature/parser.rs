//! Recursive-descent parser for the signature DSL.
//!
//! ```text
//! signature := [string] fields "->" fields
//! fields    := field ("," field)*
//! field     := ident ["!"] ["?"] [":" type] [string]
//! type      := base ["[]"] | "class" ["[]"] string
//! ```

use super::{Field, FieldKind, FieldType, Signature, SignatureError, is_identifier};
use thiserror::Error;

/// A malformed signature. `position` is a byte offset into the source text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid signature at position {position}: {reason}")]
pub struct ParseError {
    pub position: usize,
    pub reason: String,
}

impl ParseError {
    fn new(position: usize, reason: impl Into<String>) -> Self {
        Self {
            position,
            reason: reason.into(),
        }
    }
}

/// Parses signature text into a validated [`Signature`].
pub fn parse_signature(text: &str) -> Result<Signature, ParseError> {
    SignatureParser::new(text).parse()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Input,
    Output,
}

impl Section {
    fn label(self) -> &'static str {
        match self {
            Section::Input => "input",
            Section::Output => "output",
        }
    }
}

struct SignatureParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> SignatureParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Result<Signature, ParseError> {
        self.skip_ws();
        if self.input[self.pos..].trim().is_empty() {
            return Err(ParseError::new(self.pos, "signature is empty"));
        }

        let description = if self.peek_quote() {
            Some(self.quoted()?)
        } else {
            None
        };

        let inputs = self.fields(Section::Input)?;

        self.skip_ws();
        if !self.eat("->") {
            return Err(self.unexpected("expected '->' between inputs and outputs"));
        }

        let outputs = self.fields(Section::Output)?;

        self.skip_ws();
        if self.pos < self.input.len() {
            return Err(self.unexpected("unexpected trailing content after output fields"));
        }

        let mut sig = Signature::new();
        if let Some(desc) = description {
            sig = sig.describe(desc);
        }
        sig.inputs = inputs;
        sig.outputs = outputs;

        // Field-level checks already ran with precise positions; this catches
        // anything left over.
        sig.validate()
            .map_err(|e| ParseError::new(self.input.len(), e.to_string()))?;
        Ok(sig)
    }

    fn fields(&mut self, section: Section) -> Result<Vec<Field>, ParseError> {
        let mut fields: Vec<Field> = Vec::new();
        loop {
            self.skip_ws();
            let start = self.pos;
            if !self.peek_ident_start() {
                let reason = if fields.is_empty() {
                    format!("expected at least one {} field", section.label())
                } else {
                    format!("expected {} field name after ','", section.label())
                };
                return Err(self.unexpected(&reason));
            }

            let field = self.field(section)?;
            if fields.iter().any(|f| f.name == field.name) {
                return Err(ParseError::new(
                    start,
                    SignatureError::DuplicateField {
                        section: section.label(),
                        name: field.name,
                    }
                    .to_string(),
                ));
            }
            fields.push(field);

            self.skip_ws();
            if !self.eat(",") {
                return Ok(fields);
            }
        }
    }

    fn field(&mut self, section: Section) -> Result<Field, ParseError> {
        let start = self.pos;
        let name = self.ident();
        if !is_identifier(name) {
            return Err(ParseError::new(
                start,
                SignatureError::InvalidName(name.to_string()).to_string(),
            ));
        }
        let mut field = Field::new(name);

        loop {
            if !field.internal && self.eat("!") {
                if section == Section::Input {
                    return Err(ParseError::new(
                        self.pos - 1,
                        SignatureError::InternalInput(field.name).to_string(),
                    ));
                }
                field.internal = true;
            } else if !field.optional && self.eat("?") {
                field.optional = true;
            } else {
                break;
            }
        }

        self.skip_ws();
        if self.eat(":") {
            self.skip_ws();
            let type_pos = self.pos;
            let (field_type, kind) = self.field_type()?;
            if section == Section::Output && field_type.is_media() {
                return Err(ParseError::new(
                    type_pos,
                    SignatureError::MediaOutput {
                        name: field.name,
                        kind: field_type.keyword(),
                    }
                    .to_string(),
                ));
            }
            field.field_type = field_type;
            field.kind = kind;
        }

        self.skip_ws();
        if self.peek_quote() {
            let desc = self.quoted()?;
            field = field.describe(desc);
        }
        Ok(field)
    }

    fn field_type(&mut self) -> Result<(FieldType, FieldKind), ParseError> {
        let start = self.pos;
        let word = self.ident();
        if word.is_empty() {
            return Err(self.unexpected("expected a type after ':'"));
        }

        let base = match word {
            "string" => FieldType::String,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "json" => FieldType::Json,
            "date" => FieldType::Date,
            "datetime" => FieldType::DateTime,
            "image" => FieldType::Image,
            "audio" => FieldType::Audio,
            "class" => FieldType::Class(Vec::new()),
            other => {
                return Err(ParseError::new(
                    start,
                    format!(
                        "unknown type '{other}'; expected one of string, number, boolean, \
                         json, date, datetime, class, image, audio"
                    ),
                ));
            }
        };

        let kind = if self.eat("[]") {
            FieldKind::Array
        } else {
            FieldKind::Scalar
        };

        if kind == FieldKind::Array && base.is_media() {
            return Err(ParseError::new(
                start,
                format!("type '{word}' cannot be used as an array"),
            ));
        }

        if let FieldType::Class(_) = base {
            self.skip_ws();
            if !self.peek_quote() {
                return Err(self.unexpected("class type requires a quoted list of labels"));
            }
            let labels_pos = self.pos;
            let raw = self.quoted()?;
            let classes: Vec<String> = raw
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if classes.is_empty() {
                return Err(ParseError::new(labels_pos, "class type needs at least one label"));
            }
            return Ok((FieldType::Class(classes), kind));
        }

        Ok((base, kind))
    }

    fn quoted(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let Some(quote) = self.rest().chars().next() else {
            return Err(self.unexpected("expected a quoted string"));
        };
        self.pos += quote.len_utf8();

        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((offset, ch)) = chars.next() {
            match ch {
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c if c == quote => {
                    self.pos += offset + c.len_utf8();
                    return Ok(out);
                }
                c => out.push(c),
            }
        }
        Err(ParseError::new(start, "unterminated quoted string"))
    }

    fn ident(&mut self) -> &'a str {
        let rest = &self.input[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn peek_quote(&self) -> bool {
        matches!(self.rest().chars().next(), Some('"') | Some('\''))
    }

    fn peek_ident_start(&self) -> bool {
        matches!(self.rest().chars().next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
    }

    fn unexpected(&self, reason: &str) -> ParseError {
        match self.rest().chars().next() {
            Some(c) => ParseError::new(self.pos, format!("{reason}, found '{c}'")),
            None => ParseError::new(self.pos, format!("{reason}, found end of input")),
        }
    }
}
