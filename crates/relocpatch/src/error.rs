use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::descriptor::DescriptorFault;
use crate::install::WriteError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid descriptor {name}: {reason}")]
    InvalidDescriptor { name: String, reason: DescriptorFault },

    #[error("Invalid hook kind tag: {0}")]
    InvalidHookTag(u8),

    #[error("Output slot for {name} was already set to {existing:#x}")]
    SlotAlreadySet { name: String, existing: usize },

    #[error("Patch window of {name} at {start:#x}..{end:#x} overlaps {other}")]
    OverlappingWindow {
        name: String,
        other: String,
        start: usize,
        end: usize,
    },

    #[error("Invalid offset database: {0}")]
    InvalidDatabase(String),

    #[error("{name} [ID: {id}] was not in the offset database")]
    IdNotFound { name: String, id: u64 },

    #[error("{name}: known offset {known_offset:#x} does not map back to [ID: {id}]")]
    CrossCheckMismatch {
        name: String,
        id: u64,
        known_offset: usize,
    },

    #[error("{name} did not match its code signature: expected {{ {expected} }}, found {{ {found} }}")]
    SignatureMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("Address of {name} overflows: {base:#x} + {offset:#x}")]
    AddressOverflow {
        name: String,
        base: usize,
        offset: isize,
    },

    #[error("{name} resolved to the null address")]
    NullAddress { name: String },

    #[error("Failed to install {name} at {address:#x}: {source}")]
    WriteFailed {
        name: String,
        address: usize,
        #[source]
        source: WriteError,
    },

    #[error("Memory access failed at {address:#x} (size: {size})")]
    MemoryAccess { address: usize, size: usize },

    #[error("Patch {name} at {address:#x} has been clobbered")]
    Clobbered { name: String, address: usize },

    #[error("{name} was already applied")]
    AlreadyApplied { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure classes. Every class is fatal to the patching sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ErrorCategory {
    Configuration,
    Resolution,
    Installation,
    DoubleApply,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidDescriptor { .. }
            | Error::InvalidHookTag(_)
            | Error::SlotAlreadySet { .. }
            | Error::OverlappingWindow { .. }
            | Error::InvalidDatabase(_) => ErrorCategory::Configuration,
            Error::IdNotFound { .. }
            | Error::CrossCheckMismatch { .. }
            | Error::SignatureMismatch { .. }
            | Error::AddressOverflow { .. }
            | Error::NullAddress { .. } => ErrorCategory::Resolution,
            Error::WriteFailed { .. }
            | Error::MemoryAccess { .. }
            | Error::Clobbered { .. }
            | Error::Io(_)
            | Error::Json(_) => ErrorCategory::Installation,
            Error::AlreadyApplied { .. } => ErrorCategory::DoubleApply,
        }
    }
}
