//! Instruction layout constants for x86-64 patch sites
//!
//! Constants are organized by encoding family.

/// x86-64 encodings written by the installer
pub mod x86 {
    /// Single-byte no-op used to pad patch windows
    pub const NOP: u8 = 0x90;

    // rel32 transfers: opcode + 4 byte displacement
    pub const CALL_REL32: u8 = 0xE8;
    pub const JMP_REL32: u8 = 0xE9;
    pub const REL32_SIZE: usize = 5;

    // Indirect transfers through [rip + disp32]: FF /2 (call), FF /4 (jmp)
    pub const INDIRECT_PREFIX: u8 = 0xFF;
    pub const CALL_INDIRECT_MODRM: u8 = 0x15;
    pub const JMP_INDIRECT_MODRM: u8 = 0x25;
    pub const INDIRECT_SIZE: usize = 6;

    /// `jmp [rip + 0]` followed by the absolute 64-bit target
    pub const ABS_STUB_SIZE: usize = INDIRECT_SIZE + 8;

    /// Absolute target cell read by an indirect transfer
    pub const CELL_SIZE: usize = 8;
}

/// Defaults for trampoline regions
pub mod trampoline {
    /// Region size used when a tool has to append one to an image
    pub const DEFAULT_REGION_SIZE: usize = 0x1000;

    /// Alignment of every allocation in the region
    pub const ALIGN: usize = 8;
}
