//! x86-64 encodings for the hook kinds.

use tracing::debug;

use super::{CodeWriter, TrampolineArena, WriteError, WriteResult};
use crate::error::Result;
use crate::memory::layout::x86::{
    ABS_STUB_SIZE, CALL_INDIRECT_MODRM, CALL_REL32, CELL_SIZE, INDIRECT_PREFIX, INDIRECT_SIZE,
    JMP_INDIRECT_MODRM, JMP_REL32, REL32_SIZE,
};
use crate::memory::{ReadMemory, WriteMemory};

/// Displacement from the end of an instruction at `at` of length `len` to `target`.
fn rel32(at: usize, len: usize, target: usize) -> WriteResult<i32> {
    let next = at.wrapping_add(len) as i64;
    i32::try_from((target as i64).wrapping_sub(next))
        .map_err(|_| WriteError::OutOfRange { from: at, target })
}

/// `opcode rel32`, e.g. `E8` (call) or `E9` (jmp).
pub fn encode_rel32(opcode: u8, at: usize, target: usize) -> WriteResult<[u8; REL32_SIZE]> {
    let disp = rel32(at, REL32_SIZE, target)?.to_le_bytes();
    Ok([opcode, disp[0], disp[1], disp[2], disp[3]])
}

/// `FF modrm disp32`: an indirect transfer through the cell at `cell`.
pub fn encode_indirect(modrm: u8, at: usize, cell: usize) -> WriteResult<[u8; INDIRECT_SIZE]> {
    let disp = rel32(at, INDIRECT_SIZE, cell)?.to_le_bytes();
    Ok([INDIRECT_PREFIX, modrm, disp[0], disp[1], disp[2], disp[3]])
}

/// `jmp [rip + 0]` followed by the absolute target.
pub fn encode_abs_stub(target: usize) -> [u8; ABS_STUB_SIZE] {
    let mut stub = [0u8; ABS_STUB_SIZE];
    stub[0] = INDIRECT_PREFIX;
    stub[1] = JMP_INDIRECT_MODRM;
    stub[INDIRECT_SIZE..].copy_from_slice(&(target as u64).to_le_bytes());
    stub
}

/// Installs hooks into `M`, placing stubs and cells in a trampoline arena.
#[derive(Debug)]
pub struct X86Writer<M> {
    memory: M,
    trampoline: TrampolineArena,
}

impl<M: WriteMemory> X86Writer<M> {
    pub fn new(memory: M, trampoline: TrampolineArena) -> Self {
        Self { memory, trampoline }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn trampoline(&self) -> &TrampolineArena {
        &self.trampoline
    }

    pub fn into_inner(self) -> M {
        self.memory
    }

    fn put(&mut self, at: usize, bytes: &[u8]) -> WriteResult {
        self.memory.write_bytes(at, bytes)?;
        Ok(())
    }

    /// rel32 transfer to a freshly written absolute stub for `target`.
    fn via_stub(&mut self, opcode: u8, at: usize, target: usize) -> WriteResult {
        let stub = self.trampoline.alloc(ABS_STUB_SIZE)?;
        let code = encode_rel32(opcode, at, stub)?;
        self.put(stub, &encode_abs_stub(target))?;
        debug!("Stub for {:#x} at {:#x}", target, stub);
        self.put(at, &code)
    }

    /// Indirect transfer through a freshly written cell holding `target`.
    fn via_cell(&mut self, modrm: u8, at: usize, target: usize) -> WriteResult {
        let cell = self.trampoline.alloc(CELL_SIZE)?;
        let code = encode_indirect(modrm, at, cell)?;
        self.put(cell, &(target as u64).to_le_bytes())?;
        debug!("Cell for {:#x} at {:#x}", target, cell);
        self.put(at, &code)
    }
}

impl<M: WriteMemory> ReadMemory for X86Writer<M> {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        self.memory.read_bytes(address, size)
    }
}

impl<M: WriteMemory> CodeWriter for X86Writer<M> {
    fn write_short_branch(&mut self, at: usize, target: usize) -> WriteResult {
        self.via_stub(JMP_REL32, at, target)
    }

    fn write_near_branch(&mut self, at: usize, target: usize) -> WriteResult {
        self.via_cell(JMP_INDIRECT_MODRM, at, target)
    }

    fn write_short_call(&mut self, at: usize, target: usize) -> WriteResult {
        self.via_stub(CALL_REL32, at, target)
    }

    fn write_near_call(&mut self, at: usize, target: usize) -> WriteResult {
        self.via_cell(CALL_INDIRECT_MODRM, at, target)
    }

    fn write_direct_call(&mut self, at: usize, target: usize) -> WriteResult {
        let code = encode_rel32(CALL_REL32, at, target)?;
        self.put(at, &code)
    }

    fn write_direct_jump(&mut self, at: usize, target: usize) -> WriteResult {
        let code = encode_rel32(JMP_REL32, at, target)?;
        self.put(at, &code)
    }

    fn fill(&mut self, at: usize, value: u8, count: usize) -> WriteResult {
        if count == 0 {
            return Ok(());
        }
        self.put(at, &vec![value; count])
    }
}
