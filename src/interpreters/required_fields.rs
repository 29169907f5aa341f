//! Required fields interpreter
//!
//! Stamps a fixed set of fields onto every record, e.g. the service name
//! or environment of the process being wrapped.

use super::{FieldSet, Interpreter};

/// Writes every default into the field set, replacing earlier values
#[derive(Debug, Clone, Default)]
pub struct RequiredFieldsInterpreter {
    pub defaults: FieldSet,
}

impl RequiredFieldsInterpreter {
    pub fn new(defaults: FieldSet) -> Self {
        Self { defaults }
    }
}

impl Interpreter for RequiredFieldsInterpreter {
    fn interpret<'a>(&self, data: &'a [u8], fields: &mut FieldSet) -> &'a [u8] {
        for (key, value) in &self.defaults {
            fields.insert(key.clone(), value.clone());
        }
        data
    }
}
