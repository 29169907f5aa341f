//! Diagnostic Records
//!
//! When the filter itself has something to report (a record it could not
//! extract), it does so through the same sink as every other record, as a
//! synthetic field set. Downstream ingestion then sees filter problems
//! inline with the process output they concern.

use log::warn;
use serde::Serialize;
use serde_json::Value;

use crate::interpreters::FieldSet;

/// Source name attached to records produced by the filter engine
pub const ENGINE_SOURCE: &str = "filter engine";

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
}

/// Synthetic record describing a filter-side problem
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Component reporting the problem
    pub source: String,
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
}

impl Diagnostic {
    pub fn new(source: &str, severity: Severity, message: &str) -> Self {
        Self {
            source: source.to_string(),
            severity,
            message: message.to_string(),
        }
    }

    /// Error raised by the engine's own processing loop
    pub fn engine_error(message: &str) -> Self {
        Self::new(ENGINE_SOURCE, Severity::Error, message)
    }

    /// Convert into the field set handed to the sink
    pub fn into_fields(self) -> FieldSet {
        match serde_json::to_value(&self) {
            Ok(Value::Object(fields)) => fields,
            // A struct of strings always serializes to an object
            _ => {
                let mut fields = FieldSet::new();
                fields.insert("source".to_string(), Value::String(self.source));
                fields.insert("message".to_string(), Value::String(self.message));
                fields
            }
        }
    }

    /// Log the diagnostic and convert it for the sink
    pub fn emit(self) -> FieldSet {
        warn!("[{}] {:?}: {}", self.source, self.severity, self.message);
        self.into_fields()
    }
}
