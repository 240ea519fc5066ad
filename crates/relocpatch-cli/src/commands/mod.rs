//! CLI command implementations.

pub mod apply;
pub mod check;
pub mod hex_utils;
pub mod lookup;
