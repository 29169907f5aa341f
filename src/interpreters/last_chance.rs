//! Last chance interpreter
//!
//! Meant to sit at the end of the chain. Whatever no earlier link
//! understood is kept in a catch-all field instead of being dropped. The
//! bytes may not be valid UTF-8, so they are stored with a reversible
//! text encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

use super::{FieldSet, Interpreter};

/// Default catch-all field name
pub const DEFAULT_FIELD: &str = "_other";

/// Reversible byte-to-text encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Escaper {
    /// Lowercase hex, two characters per byte
    #[default]
    Hex,
    /// Standard padded base64
    Base64,
}

impl Escaper {
    pub fn escape(self, data: &[u8]) -> String {
        match self {
            Escaper::Hex => hex::encode(data),
            Escaper::Base64 => STANDARD.encode(data),
        }
    }
}

/// Stores all remaining bytes under one field
#[derive(Debug, Clone)]
pub struct LastChanceInterpreter {
    pub field: String,
    pub escaper: Escaper,
}

impl LastChanceInterpreter {
    pub fn new(field: impl Into<String>, escaper: Escaper) -> Self {
        Self {
            field: field.into(),
            escaper,
        }
    }
}

impl Default for LastChanceInterpreter {
    fn default() -> Self {
        Self::new(DEFAULT_FIELD, Escaper::default())
    }
}

impl Interpreter for LastChanceInterpreter {
    fn interpret<'a>(&self, data: &'a [u8], fields: &mut FieldSet) -> &'a [u8] {
        if data.is_empty() {
            return data;
        }
        fields.insert(self.field.clone(), Value::String(self.escaper.escape(data)));
        &[]
    }
}
