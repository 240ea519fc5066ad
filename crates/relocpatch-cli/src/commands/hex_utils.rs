//! Hex address parsing and formatting utilities.

use anyhow::{Result, anyhow};

/// Parse a hex address string (with or without 0x prefix).
pub fn parse_hex_address(s: &str) -> Result<usize> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    usize::from_str_radix(digits, 16).map_err(|e| anyhow!("Invalid hex address {:?}: {}", s, e))
}

/// Format an address as a hex string with 0x prefix.
pub fn format_hex_address(addr: usize) -> String {
    format!("0x{:X}", addr)
}
