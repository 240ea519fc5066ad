//! Patching the current process's own image.

use std::ffi::c_void;

use tracing::debug;
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::{
    PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
};
use windows::Win32::System::Threading::GetCurrentProcess;

use super::{ReadMemory, WriteMemory};
use crate::error::{Error, Result};

/// Writer for the executable image of the calling process.
///
/// Only valid during single-threaded initialization, before any other thread
/// can execute the patched code.
#[derive(Debug, Default)]
pub struct ProcessMemory {
    _private: (),
}

impl ProcessMemory {
    /// # Safety
    ///
    /// Every address later passed to this writer must lie inside memory
    /// mapped into the current process.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    /// Temporarily marks the region read/write/execute, then runs `f`.
    unsafe fn with_region<T>(
        &self,
        address: usize,
        size: usize,
        f: impl FnOnce() -> T,
    ) -> Result<T> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        unsafe {
            VirtualProtect(
                address as *const c_void,
                size,
                PAGE_EXECUTE_READWRITE,
                &mut old,
            )
        }
        .map_err(|e| {
            debug!("VirtualProtect failed at {:#x}: {}", address, e);
            Error::MemoryAccess { address, size }
        })?;

        let value = f();

        let mut ignored = PAGE_PROTECTION_FLAGS(0);
        unsafe { VirtualProtect(address as *const c_void, size, old, &mut ignored) }
            .map_err(|_| Error::MemoryAccess { address, size })?;
        Ok(value)
    }
}

impl ReadMemory for ProcessMemory {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        // SAFETY: the constructor's contract covers every address we are given.
        unsafe {
            self.with_region(address, size, || {
                std::slice::from_raw_parts(address as *const u8, size).to_vec()
            })
        }
    }
}

impl WriteMemory for ProcessMemory {
    fn write_bytes(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        // SAFETY: the constructor's contract covers every address we are given.
        unsafe {
            self.with_region(address, bytes.len(), || {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
            })?;
            FlushInstructionCache(
                GetCurrentProcess(),
                Some(address as *const c_void),
                bytes.len(),
            )
            .map_err(|_| Error::MemoryAccess {
                address,
                size: bytes.len(),
            })?;
        }
        Ok(())
    }
}
