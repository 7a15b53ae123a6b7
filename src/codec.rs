//! One structured message per text line.
//!
//! Records are compact JSON objects. JSON escapes control characters inside
//! strings, so an encoded record never contains a raw newline and the line
//! terminator alone delimits it.

use std::io::Write;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::message::Args;

/// Encodes `message` as a single newline-terminated record.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one record back into a mapping. Trailing line terminators are
/// ignored; blank input and non-object JSON are errors.
pub fn decode(line: &str) -> Result<Args> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Err(Error::Protocol("empty line".to_string()));
    }
    match serde_json::from_str::<Value>(line)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Protocol(format!("expected an object, got {other}"))),
    }
}

/// Writes one record and flushes so the peer sees it immediately.
pub fn write_record<W: Write + ?Sized, T: Serialize + ?Sized>(writer: &mut W, message: &T) -> Result<String> {
    let line = encode(message)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(line)
}
