//! Low-level code writers.
//!
//! [`CodeWriter`] is the boundary the patcher installs through. [`X86Writer`]
//! is the x86-64 implementation over any [`WriteMemory`](crate::memory::WriteMemory).

mod trampoline;
mod x86;

use thiserror::Error;

use crate::memory::ReadMemory;

pub use trampoline::TrampolineArena;
pub use x86::{X86Writer, encode_abs_stub, encode_indirect, encode_rel32};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("target {target:#x} is out of rel32 range from {from:#x}")]
    OutOfRange { from: usize, target: usize },

    #[error("trampoline region exhausted: requested {requested} bytes, {remaining} remaining")]
    TrampolineFull { requested: usize, remaining: usize },

    #[error("memory write failed: {0}")]
    Memory(#[source] Box<crate::error::Error>),
}

pub type WriteResult<T = ()> = std::result::Result<T, WriteError>;

impl From<crate::error::Error> for WriteError {
    fn from(err: crate::error::Error) -> Self {
        WriteError::Memory(Box::new(err))
    }
}

/// Primitive writes used to install hooks.
///
/// Each method writes exactly [`HookKind::size`](crate::HookKind::size) bytes
/// at `at` for its kind and nothing else inside the patch window.
pub trait CodeWriter: ReadMemory {
    /// 5 byte `jmp rel32` through a trampoline stub.
    fn write_short_branch(&mut self, at: usize, target: usize) -> WriteResult;
    /// 6 byte `jmp [rip + disp32]` through a trampoline cell.
    fn write_near_branch(&mut self, at: usize, target: usize) -> WriteResult;
    /// 5 byte `call rel32` through a trampoline stub.
    fn write_short_call(&mut self, at: usize, target: usize) -> WriteResult;
    /// 6 byte `call [rip + disp32]` through a trampoline cell.
    fn write_near_call(&mut self, at: usize, target: usize) -> WriteResult;
    /// 5 byte `call rel32` straight to `target`.
    fn write_direct_call(&mut self, at: usize, target: usize) -> WriteResult;
    /// 5 byte `jmp rel32` straight to `target`.
    fn write_direct_jump(&mut self, at: usize, target: usize) -> WriteResult;
    fn fill(&mut self, at: usize, value: u8, count: usize) -> WriteResult;
}

/// The redirecting hook forms, one per write primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    ShortBranch,
    NearBranch,
    ShortCall,
    NearCall,
    DirectCall,
    DirectJump,
}

impl Redirect {
    pub fn install<W: CodeWriter + ?Sized>(
        self,
        writer: &mut W,
        at: usize,
        target: usize,
    ) -> WriteResult {
        match self {
            Redirect::ShortBranch => writer.write_short_branch(at, target),
            Redirect::NearBranch => writer.write_near_branch(at, target),
            Redirect::ShortCall => writer.write_short_call(at, target),
            Redirect::NearCall => writer.write_near_call(at, target),
            Redirect::DirectCall => writer.write_direct_call(at, target),
            Redirect::DirectJump => writer.write_direct_jump(at, target),
        }
    }
}
