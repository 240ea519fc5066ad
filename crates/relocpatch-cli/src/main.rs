//! Offline driver for relocpatch.
//!
//! Applies a patch table to a raw image file, so tables can be checked
//! against a new host version without loading into it.

mod commands;
mod table;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use relocpatch::memory::layout::trampoline::DEFAULT_REGION_SIZE;
use tracing_subscriber::EnvFilter;

use commands::apply::ApplyOptions;

#[derive(Parser)]
#[command(name = "relocpatch")]
#[command(author, version, about = "Relocatable code patcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a patch table to an image file
    Apply {
        /// Raw image, mapped as one region at --base
        #[arg(short, long)]
        image: PathBuf,

        /// Load address of the image (hex)
        #[arg(short, long, default_value = "0x140000000")]
        base: String,

        /// Offset database (JSON)
        #[arg(short, long)]
        db: PathBuf,

        /// Patch table (TOML)
        #[arg(short, long)]
        table: PathBuf,

        /// Size of the trampoline region appended after the image
        #[arg(long, default_value_t = DEFAULT_REGION_SIZE)]
        trampoline_size: usize,

        /// Where to write the patched image
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Where to write the trampoline region
        #[arg(long)]
        trampoline_out: Option<PathBuf>,

        /// Where to write the JSON patch report
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Look up an identifier in an offset database
    Lookup {
        /// Offset database (JSON)
        #[arg(short, long)]
        db: PathBuf,

        /// Identifier to look up
        #[arg(short, long)]
        id: u64,

        /// Module base to add to the offset (hex)
        #[arg(short, long, default_value = "0x140000000")]
        base: String,
    },

    /// Validate a patch table without applying it
    Check {
        /// Patch table (TOML)
        #[arg(short, long)]
        table: PathBuf,

        /// Also resolve every identifier against this database
        #[arg(short, long)]
        db: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("relocpatch=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Apply {
            image,
            base,
            db,
            table,
            trampoline_size,
            out,
            trampoline_out,
            report,
        } => commands::apply::run(&ApplyOptions {
            image,
            base,
            db,
            table,
            trampoline_size,
            out,
            trampoline_out,
            report,
        }),
        Commands::Lookup { db, id, base } => commands::lookup::run(&db, id, &base),
        Commands::Check { table, db } => commands::check::run(&table, db.as_deref()),
    }
}
