//! Record Tokenizers
//!
//! A tokenizer looks at the bytes buffered so far and decides where the
//! first complete record ends. Writes arrive in arbitrary chunks, so a
//! record may be split across any number of them; the tokenizer only ever
//! sees the window and whether the stream has ended.
//!
//! Two strategies:
//! - Line: one record per `\n`-terminated line
//! - Object: one record per brace-matched `{...}` object, skipping noise

use serde::Deserialize;
use thiserror::Error;

/// Outcome of one split attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split<'a> {
    /// No complete record yet; wait for more bytes
    Incomplete,
    /// A complete record. `consumed` covers any skipped prefix plus the
    /// record and its terminator.
    Token { consumed: usize, token: &'a [u8] },
    /// Leading bytes that can never be part of a record
    Skip(usize),
}

/// Tokenizer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenizeError {
    /// The stream ended inside the object opened at `start`
    #[error("incomplete object")]
    IncompleteObject { start: usize },
}

pub type SplitResult<'a> = Result<Split<'a>, TokenizeError>;

/// Tokenizer strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tokenizer {
    /// Newline-terminated text records
    Line,
    /// Brace-delimited objects (JSON and JSON-like output)
    #[default]
    Object,
}

impl Tokenizer {
    /// Find the first record in `window`
    pub fn split(self, window: &[u8], at_end: bool) -> SplitResult<'_> {
        match self {
            Tokenizer::Line => split_lines(window, at_end),
            Tokenizer::Object => split_object(window, at_end),
        }
    }
}

/// Split on `\n`, stripping the terminator and a `\r` right before it.
///
/// At the end of the stream, a final line without a terminator is still a
/// record.
pub fn split_lines(window: &[u8], at_end: bool) -> SplitResult<'_> {
    if let Some(pos) = window.iter().position(|&b| b == b'\n') {
        return Ok(Split::Token {
            consumed: pos + 1,
            token: strip_cr(&window[..pos]),
        });
    }

    if at_end && !window.is_empty() {
        return Ok(Split::Token {
            consumed: window.len(),
            token: strip_cr(window),
        });
    }

    Ok(Split::Incomplete)
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

/// Extract the first brace-matched object.
///
/// Anything before the first `{` is discarded. Braces inside double-quoted
/// strings do not count, and a backslash inside a string escapes the next
/// byte. The error is only reported at the end of the stream; before that
/// an unmatched object just needs more bytes. Skipping past the reported
/// `start` brace and splitting again recovers any later complete object.
pub fn split_object(window: &[u8], at_end: bool) -> SplitResult<'_> {
    let start = match window.iter().position(|&b| b == b'{') {
        Some(start) => start,
        None if window.is_empty() => return Ok(Split::Incomplete),
        None => return Ok(Split::Skip(window.len())),
    };

    match match_brace(window, start) {
        Some(end) => Ok(Split::Token {
            consumed: end + 1,
            token: &window[start..=end],
        }),
        None if at_end => Err(TokenizeError::IncompleteObject { start }),
        None => Ok(Split::Incomplete),
    }
}

/// Index of the `}` closing the `{` at `open`, if the window contains it.
fn match_brace(data: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &byte) in data.iter().enumerate().skip(open) {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}
