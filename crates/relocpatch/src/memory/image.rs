//! In-memory host image.
//!
//! Backs the offline tool and the tests: a set of byte regions mapped at
//! fixed addresses, with every write recorded.

use serde::Serialize;

use super::{ReadMemory, WriteMemory};
use crate::error::{Error, Result};

/// A contiguous block of bytes mapped at `base`.
#[derive(Debug, Clone)]
pub struct Region {
    pub base: usize,
    pub bytes: Vec<u8>,
}

impl Region {
    pub fn end(&self) -> usize {
        self.base + self.bytes.len()
    }

    fn contains(&self, address: usize, size: usize) -> bool {
        address >= self.base
            && address
                .checked_add(size)
                .is_some_and(|end| end <= self.end())
    }
}

/// One call to [`WriteMemory::write_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteRecord {
    pub address: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    regions: Vec<Region>,
    writes: Vec<WriteRecord>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base`. Fails if the block overlaps an existing region.
    pub fn map(&mut self, base: usize, bytes: Vec<u8>) -> Result<()> {
        let end = base
            .checked_add(bytes.len())
            .ok_or(Error::MemoryAccess {
                address: base,
                size: bytes.len(),
            })?;

        if self
            .regions
            .iter()
            .any(|r| base < r.end() && r.base < end)
        {
            return Err(Error::MemoryAccess {
                address: base,
                size: bytes.len(),
            });
        }

        self.regions.push(Region { base, bytes });
        self.regions.sort_by_key(|r| r.base);
        Ok(())
    }

    /// Builder form of [`map`](Self::map) for tests and tools.
    pub fn with_region(mut self, base: usize, bytes: Vec<u8>) -> Result<Self> {
        self.map(base, bytes)?;
        Ok(self)
    }

    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    /// Total number of bytes written so far.
    pub fn bytes_written(&self) -> usize {
        self.writes.iter().map(|w| w.len).sum()
    }

    pub fn into_regions(self) -> Vec<Region> {
        self.regions
    }

    fn find(&self, address: usize, size: usize) -> Result<(usize, usize)> {
        self.regions
            .iter()
            .enumerate()
            .find(|(_, r)| r.contains(address, size))
            .map(|(i, r)| (i, address - r.base))
            .ok_or(Error::MemoryAccess { address, size })
    }
}

impl ReadMemory for MemoryImage {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        let (index, start) = self.find(address, size)?;
        Ok(self.regions[index].bytes[start..start + size].to_vec())
    }
}

impl WriteMemory for MemoryImage {
    fn write_bytes(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        let (index, start) = self.find(address, bytes.len())?;
        self.regions[index].bytes[start..start + bytes.len()].copy_from_slice(bytes);
        self.writes.push(WriteRecord {
            address,
            len: bytes.len(),
        });
        Ok(())
    }
}
