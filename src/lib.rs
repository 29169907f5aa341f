//! Stdio Record Filter
//!
//! This crate sits between a child process's stdout/stderr and a log
//! pipeline. The process writes raw bytes into a [`Filter`]; the filter
//! rebuilds discrete records from the stream as it arrives and turns each
//! one into a structured field set for the sink.
//!
//! ```no_run
//! use std::io::Write;
//! use stdio_filter::{Filter, JsonInterpreter, LastChanceInterpreter};
//!
//! let mut filter = Filter::json(
//!     |fields| println!("{}", serde_json::Value::Object(fields)),
//!     vec![
//!         Box::new(JsonInterpreter),
//!         Box::new(LastChanceInterpreter::default()),
//!     ],
//! )?;
//! filter.write_all(br#"{"level":"info","msg":"ready"}"#)?;
//! filter.shutdown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod filter;
pub mod interpreters;
pub mod streaming;
pub mod telemetry;

pub use config::{ConfigError, FilterConfig};
pub use filter::{Filter, FilterError};
pub use interpreters::{
    Escaper, FieldSet, Interpreter, InterpreterChain, JsonInterpreter, LastChanceInterpreter,
    Passthrough, RequiredFieldsInterpreter,
};
pub use streaming::{GrowthPolicy, RingBuffer, RingBufferError, Split, TokenizeError, Tokenizer};
pub use telemetry::{Diagnostic, Severity};
