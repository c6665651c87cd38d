//! Architecture-neutral register identifiers and accessors.

use crate::{Error, Result};

/// Architecture-scoped register identifier.
///
/// The numbering is defined per architecture by [`crate::arch::x86::X86Reg`]
/// and [`crate::arch::riscv::RiscvReg`]; `0` is never a valid register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegId(pub i32);

impl RegId {
    /// Raw numeric identifier.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl From<i32> for RegId {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

/// Aggregate value of a descriptor-table style register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Mmr {
    /// Segment selector (unused by `GDTR`/`IDTR`).
    pub selector: u16,
    /// Linear base address.
    pub base: u64,
    /// Segment or table limit.
    pub limit: u32,
    /// Access flags (unused by `GDTR`/`IDTR`).
    pub flags: u32,
}

/// Register access shared by every backend and exposed to hooks.
pub(crate) trait RegisterFile {
    /// Reads a scalar register, zero-extended to 64 bits.
    fn reg_read(&self, reg: RegId) -> Result<u64>;

    /// Writes a scalar register, truncating to its width.
    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<()>;

    /// Reads an aggregate register.
    fn reg_read_mmr(&self, reg: RegId) -> Result<Mmr> {
        let _ = reg;
        Err(Error::RegisterInvalid)
    }

    /// Writes an aggregate register.
    fn reg_write_mmr(&mut self, reg: RegId, value: Mmr) -> Result<()> {
        let _ = (reg, value);
        Err(Error::RegisterInvalid)
    }

    /// Current program counter.
    fn pc(&self) -> u64;

    /// Moves the program counter.
    fn set_pc(&mut self, pc: u64);
}
