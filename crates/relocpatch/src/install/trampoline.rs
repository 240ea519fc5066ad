use tracing::debug;

use super::{WriteError, WriteResult};
use crate::memory::layout::trampoline::ALIGN;

/// Bump allocator over an executable region handed to us by the host.
///
/// Allocating the region itself (near enough to the image for rel32 reach)
/// is the host's job; this only hands out aligned chunks of it.
#[derive(Debug, Clone)]
pub struct TrampolineArena {
    base: usize,
    size: usize,
    used: usize,
}

impl TrampolineArena {
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            used: 0,
        }
    }

    /// An arena with no space; every allocation fails.
    ///
    /// Enough for tables that only use direct hooks.
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.size - self.used
    }

    pub fn alloc(&mut self, len: usize) -> WriteResult<usize> {
        let start = self.used.next_multiple_of(ALIGN);
        let end = start.checked_add(len).filter(|&end| end <= self.size).ok_or(
            WriteError::TrampolineFull {
                requested: len,
                remaining: self.remaining(),
            },
        )?;

        self.used = end;
        let address = self.base + start;
        debug!("Trampoline alloc: {} bytes at {:#x}", len, address);
        Ok(address)
    }
}
