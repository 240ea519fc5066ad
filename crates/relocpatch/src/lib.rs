//! # relocpatch
//!
//! Applies a fixed table of code patches to a host binary whose layout moves
//! between versions.
//!
//! This crate provides:
//! - Patch descriptors and their validation
//! - Identifier → address resolution through an offset database
//! - x86-64 branch, call and no-op installers with a trampoline arena
//! - A fail-fast driver that applies a table and reports what it wrote
//!
//! ## Feature Flags
//!
//! - `debug-tools`: Turns on offset cross-checking by default. Intended for
//!   CLI tools and development builds.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod hook;
pub mod install;
pub mod memory;
pub mod patcher;
pub mod resolver;
pub mod signature;
pub mod slot;

pub use config::{PatcherConfig, PatcherConfigBuilder};
pub use descriptor::{Action, DescriptorFault, HookTarget, PatchDescriptor};
pub use error::{Error, ErrorCategory, Result};
pub use hook::HookKind;
pub use install::{CodeWriter, Redirect, TrampolineArena, WriteError, X86Writer};
#[cfg(target_os = "windows")]
pub use memory::ProcessMemory;
pub use memory::{MemoryImage, ReadMemory, Region, WriteMemory, WriteRecord};
pub use patcher::{AppliedPatch, PatchReport, Patcher, Preflight};
pub use resolver::{
    AddressResolver, DatabaseEntry, DatabaseFile, OffsetDatabase, load_database, save_database,
};
pub use slot::{Location, OutputSlot, RelocatableSlot};
