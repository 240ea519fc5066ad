//! Apply command implementation.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use relocpatch::{MemoryImage, PatchReport, Patcher, TrampolineArena, X86Writer, load_database};
use tracing::info;

use super::hex_utils::{format_hex_address, parse_hex_address};
use crate::table::{SlotSet, TableFile};

const PAGE_SIZE: usize = 0x1000;

pub struct ApplyOptions {
    pub image: PathBuf,
    pub base: String,
    pub db: PathBuf,
    pub table: PathBuf,
    pub trampoline_size: usize,
    pub out: Option<PathBuf>,
    pub trampoline_out: Option<PathBuf>,
    pub report: Option<PathBuf>,
}

/// Run the apply command
pub fn run(opts: &ApplyOptions) -> Result<()> {
    let base = parse_hex_address(&opts.base)?;
    let image = fs::read(&opts.image)
        .with_context(|| format!("Failed to read image {}", opts.image.display()))?;
    if image.is_empty() {
        bail!("Image {} is empty", opts.image.display());
    }

    let db = load_database(&opts.db, base)
        .with_context(|| format!("Failed to load offset database {}", opts.db.display()))?;
    let table = TableFile::load(&opts.table)?;
    let slots = table.slots();
    let descriptors = table.descriptors(&slots)?;

    let trampoline_base = base
        .checked_add(image.len())
        .and_then(|end| end.checked_next_multiple_of(PAGE_SIZE))
        .context("Image does not fit in the address space")?;
    let memory = MemoryImage::new()
        .with_region(base, image)?
        .with_region(trampoline_base, vec![0; opts.trampoline_size])?;
    let writer = X86Writer::new(
        memory,
        TrampolineArena::new(trampoline_base, opts.trampoline_size),
    );

    let mut patcher = Patcher::with_config(db, writer, table.config());
    let report = patcher
        .apply_all(&descriptors)
        .context("Patch table could not be applied")?;
    report.verify(patcher.writer())?;

    let writer = patcher.into_writer();
    let trampoline_used = writer.trampoline().used();
    let memory = writer.into_inner();
    info!(
        "{} bytes written, {} of {} trampoline bytes used",
        memory.bytes_written(),
        trampoline_used,
        opts.trampoline_size
    );

    for region in memory.into_regions() {
        let dest = if region.base == base {
            opts.out.as_ref()
        } else {
            opts.trampoline_out.as_ref()
        };
        if let Some(path) = dest {
            fs::write(path, &region.bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Wrote {} bytes at {} to {}",
                region.bytes.len(),
                format_hex_address(region.base),
                path.display()
            );
        }
    }

    if let Some(path) = &opts.report {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    print_summary(&report, &slots, trampoline_base);
    Ok(())
}

fn print_summary(report: &PatchReport, slots: &SlotSet, trampoline_base: usize) {
    println!();
    println!(
        "{} {} patches (trampoline at {})",
        "Applied".green().bold(),
        report.patches.len(),
        format_hex_address(trampoline_base)
    );
    for patch in &report.patches {
        println!(
            "  {:<40} {:>12}  {}",
            patch.name,
            format_hex_address(patch.rva),
            patch.kind.dimmed()
        );
    }

    if slots.is_empty() {
        return;
    }
    println!();
    println!("{}", "Slots".bold());
    for (name, slot) in slots.iter() {
        match slot.get() {
            Some(address) => println!("  {:<40} {}", name.cyan(), format_hex_address(address)),
            None => println!("  {:<40} {}", name.cyan(), "unset".yellow()),
        }
    }
}
