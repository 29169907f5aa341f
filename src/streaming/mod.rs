//! Streaming module for record extraction
//!
//! This module provides the primitives between a process's raw output and
//! the interpreter chain:
//! - A concurrent ring buffer that stages bytes as they are written
//! - Tokenizers that find where each record ends within the buffered bytes

pub mod ring_buffer;
pub mod tokenizer;

pub use ring_buffer::{GrowthPolicy, RingBuffer, RingBufferError};
pub use tokenizer::{split_lines, split_object, Split, SplitResult, TokenizeError, Tokenizer};
