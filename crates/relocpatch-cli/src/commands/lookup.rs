//! Lookup command implementation.

use std::path::Path;

use anyhow::{Context, Result, bail};
use relocpatch::{AddressResolver, load_database};

use super::hex_utils::{format_hex_address, parse_hex_address};

/// Run the lookup command
pub fn run(db_path: &Path, id: u64, base: &str) -> Result<()> {
    let base = parse_hex_address(base)?;
    let db = load_database(db_path, base)
        .with_context(|| format!("Failed to load offset database {}", db_path.display()))?;

    let (Some(offset), Some(address)) = (db.offset_of(id), db.lookup(id)) else {
        bail!("ID {} not found in database {}", id, db.version());
    };

    println!("Version: {}", db.version());
    println!("ID:      {}", id);
    println!("Offset:  {}", format_hex_address(offset));
    println!("Address: {}", format_hex_address(address));

    Ok(())
}
