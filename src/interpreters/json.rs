//! JSON object interpreter
//!
//! Merges the members of a record that is exactly one JSON object into the
//! field set. Anything else is left for the next link.

use serde_json::Value;

use super::{FieldSet, Interpreter};

/// Parses a whole record as a JSON object
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonInterpreter;

impl Interpreter for JsonInterpreter {
    fn interpret<'a>(&self, data: &'a [u8], fields: &mut FieldSet) -> &'a [u8] {
        match serde_json::from_slice::<Value>(data) {
            Ok(Value::Object(object)) => {
                // Last writer wins
                fields.extend(object);
                &[]
            }
            _ => data,
        }
    }
}
