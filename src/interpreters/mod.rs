//! Record Interpreters
//!
//! An interpreter is one link in a chain that turns a record's bytes into
//! fields. Each link:
//! - Consumes as much of its input as it understands
//! - Adds, replaces, or removes fields in the shared field set
//! - Hands whatever it did not consume to the next link
//!
//! Generic links live in the submodules; format-specific ones are expected
//! to be supplied by the caller.

pub mod json;
pub mod last_chance;
pub mod required_fields;

pub use json::JsonInterpreter;
pub use last_chance::{Escaper, LastChanceInterpreter};
pub use required_fields::RequiredFieldsInterpreter;

use serde_json::{Map, Value};

/// Structured output for one record
pub type FieldSet = Map<String, Value>;

/// One link of the interpreter chain
pub trait Interpreter: Send + Sync {
    /// Inspect `data`, update `fields`, and return the unconsumed remainder.
    fn interpret<'a>(&self, data: &'a [u8], fields: &mut FieldSet) -> &'a [u8];
}

/// Interpreter that consumes nothing and leaves the fields alone
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Interpreter for Passthrough {
    fn interpret<'a>(&self, data: &'a [u8], _fields: &mut FieldSet) -> &'a [u8] {
        data
    }
}

/// Ordered, fixed list of interpreters applied to every record
#[derive(Default)]
pub struct InterpreterChain {
    links: Vec<Box<dyn Interpreter>>,
}

impl InterpreterChain {
    pub fn new(links: Vec<Box<dyn Interpreter>>) -> Self {
        Self { links }
    }

    /// Fold `token` through every link in order, starting from an empty
    /// field set.
    pub fn interpret(&self, token: &[u8]) -> FieldSet {
        let mut fields = FieldSet::new();
        let mut data = token;
        for link in &self.links {
            data = link.interpret(data, &mut fields);
        }
        fields
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl From<Vec<Box<dyn Interpreter>>> for InterpreterChain {
    fn from(links: Vec<Box<dyn Interpreter>>) -> Self {
        Self::new(links)
    }
}
