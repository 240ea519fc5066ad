pub mod layout;
mod image;
#[cfg(target_os = "windows")]
mod process;

use crate::error::Result;

pub use image::{MemoryImage, Region, WriteRecord};
#[cfg(target_os = "windows")]
pub use process::ProcessMemory;

/// Read access to the host image
pub trait ReadMemory {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>>;

    fn read_u64(&self, address: usize) -> Result<u64> {
        let bytes = self.read_bytes(address, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Write access to the host image, including code pages.
///
/// Implementations handle page protection themselves and must write `bytes`
/// as one unit.
pub trait WriteMemory: ReadMemory {
    fn write_bytes(&mut self, address: usize, bytes: &[u8]) -> Result<()>;
}

impl<T: ReadMemory + ?Sized> ReadMemory for &T {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        (**self).read_bytes(address, size)
    }
}

impl<T: ReadMemory + ?Sized> ReadMemory for &mut T {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        (**self).read_bytes(address, size)
    }
}

impl<T: WriteMemory + ?Sized> WriteMemory for &mut T {
    fn write_bytes(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        (**self).write_bytes(address, bytes)
    }
}
