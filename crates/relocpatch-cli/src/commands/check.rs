//! Check command implementation.
//!
//! Validates every descriptor of a table and, given a database, runs the
//! same pre-write checks as `apply`: resolution, cross-check and overlapping
//! windows. Nothing is written.

use std::path::Path;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use relocpatch::{OffsetDatabase, PatchDescriptor, PatcherConfig, Preflight, load_database};

use crate::table::TableFile;

/// Run the check command
pub fn run(table_path: &Path, db_path: Option<&Path>) -> Result<()> {
    let table = TableFile::load(table_path)?;
    let slots = table.slots();
    let descriptors = table.descriptors(&slots)?;
    let db = db_path
        .map(|path| {
            load_database(path, 0)
                .with_context(|| format!("Failed to load offset database {}", path.display()))
        })
        .transpose()?;

    let failures = check_all(&descriptors, db, table.config());
    if failures > 0 {
        bail!("{} of {} descriptors failed", failures, descriptors.len());
    }

    println!("{} {} descriptors", "OK".green().bold(), descriptors.len());
    Ok(())
}

fn check_all(
    descriptors: &[PatchDescriptor<'_>],
    db: Option<OffsetDatabase>,
    config: PatcherConfig,
) -> usize {
    let mut preflight = db.map(|db| Preflight::new(db, config));
    let mut failures = 0;
    for descriptor in descriptors {
        match check_one(descriptor, preflight.as_mut()) {
            Ok(Some(rva)) => println!("{} {} at {:#x}", "ok  ".green(), descriptor, rva),
            Ok(None) => println!("{} {}", "ok  ".green(), descriptor),
            Err(e) => {
                failures += 1;
                println!("{} {}: {}", "FAIL".red().bold(), descriptor, e);
            }
        }
    }
    failures
}

/// The site's module offset, when a database was given.
fn check_one(
    descriptor: &PatchDescriptor<'_>,
    preflight: Option<&mut Preflight<OffsetDatabase>>,
) -> relocpatch::Result<Option<usize>> {
    let Some(preflight) = preflight else {
        descriptor.validate()?;
        return Ok(None);
    };

    let slot = preflight.check(descriptor)?;
    // a second row for the same site fails as it would when applied
    preflight.mark_applied(descriptor);
    Ok(slot.address().map(|address| preflight.rva(address)))
}
