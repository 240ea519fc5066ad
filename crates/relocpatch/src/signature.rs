//! Expected-code signatures for patch windows.
//!
//! A signature lists the bytes a patch expects to overwrite, with `??` for
//! bytes that vary between host versions (relocated displacements and such).

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

pub type Pattern = Vec<Option<u8>>;

/// Parse a pattern such as `"48 8D 0D ?? ?? ?? ??"`.
///
/// Errors are returned as plain strings so the caller can attach the
/// descriptor they belong to.
pub fn parse_pattern(pattern: &str) -> std::result::Result<Pattern, String> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        let value = u8::from_str_radix(token, 16)
            .map_err(|e| format!("invalid signature token '{}': {}", token, e))?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err("signature pattern is empty".to_string());
    }

    Ok(bytes)
}

pub fn format_pattern(bytes: &[Option<u8>]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            Some(value) => format!("{:02X}", value),
            None => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether `code` matches `pattern` byte for byte, wildcards aside.
pub fn matches(pattern: &[Option<u8>], code: &[u8]) -> bool {
    pattern.len() == code.len()
        && pattern
            .iter()
            .zip(code)
            .all(|(expected, actual)| expected.is_none_or(|b| b == *actual))
}

/// Compare the live bytes at `address` against `pattern`.
pub fn check<R: ReadMemory + ?Sized>(
    reader: &R,
    name: &str,
    address: usize,
    pattern: &[Option<u8>],
) -> Result<()> {
    let code = reader.read_bytes(address, pattern.len())?;
    if matches(pattern, &code) {
        return Ok(());
    }

    Err(Error::SignatureMismatch {
        name: name.to_string(),
        expected: format_pattern(pattern),
        found: format_bytes(&code),
    })
}
