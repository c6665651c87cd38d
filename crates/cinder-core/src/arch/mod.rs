//! Guest architectures, modes and the executor/bus contract between the run
//! loop and a backend.

/// RISC-V RV32/RV64 integer backend.
pub mod riscv;
/// 32-bit flat x86 backend.
pub mod x86;

use bitflags::bitflags;

use crate::registers::RegisterFile;
use crate::{Error, Result};

/// Guest processor architecture with its stable numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u32)]
pub enum Arch {
    /// Intel x86.
    X86 = 4,
    /// RISC-V.
    Riscv = 8,
}

impl Arch {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Decodes a stable numeric code.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            4 => Some(Self::X86),
            8 => Some(Self::Riscv),
            _ => None,
        }
    }
}

impl TryFrom<u32> for Arch {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        Self::from_code(code).ok_or(Error::Arch)
    }
}

/// Returns `true` when this build can emulate the architecture with `code`.
#[must_use]
pub const fn arch_supported(code: u32) -> bool {
    Arch::from_code(code).is_some()
}

bitflags! {
    /// Processor mode flags. RISC-V flags reuse the width bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct Mode: u32 {
        /// 16-bit mode.
        const MODE_16 = 1 << 1;
        /// 32-bit mode.
        const MODE_32 = 1 << 2;
        /// 64-bit mode.
        const MODE_64 = 1 << 3;
        /// RV32 base ISA.
        const RISCV32 = 1 << 2;
        /// RV64 base ISA.
        const RISCV64 = 1 << 3;
    }
}

impl Mode {
    /// Mask applied to guest addresses in this mode.
    #[must_use]
    pub const fn address_mask(self) -> u64 {
        if self.contains(Self::MODE_64) {
            u64::MAX
        } else if self.contains(Self::MODE_32) {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }
}

/// Instruction families an `INSN` hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum InsnHookKind {
    PortIn,
    PortOut,
    Cpuid,
}

/// Outcome of one executor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// The instruction retired and execution falls through.
    Next,
    /// The instruction retired and transferred control.
    Branch,
    /// The instruction retired and ends the run successfully.
    Halt,
    /// Nothing retired: a hook moved the program counter or absorbed an
    /// invalid instruction.
    Skipped,
}

impl Flow {
    /// Whether the step counts as an executed instruction.
    pub(crate) const fn retired(self) -> bool {
        !matches!(self, Self::Skipped)
    }

    /// Whether the next instruction starts a new block.
    pub(crate) const fn ends_block(self) -> bool {
        !matches!(self, Self::Next)
    }
}

/// Guest-visible side of the run loop: memory routed through hooks plus the
/// architecture events a backend can raise.
///
/// Every hook-firing call takes the backend's registers so callbacks can
/// inspect and modify them.
pub(crate) trait Bus {
    /// Instruction fetch with fault hooks.
    fn fetch(&mut self, regs: &mut dyn RegisterFile, addr: u64, dst: &mut [u8]) -> Result<()>;

    /// Little-endian data load of `size` bytes (1, 2, 4 or 8).
    fn load(&mut self, regs: &mut dyn RegisterFile, addr: u64, size: usize) -> Result<u64>;

    /// Little-endian data store of the low `size` bytes of `value`.
    fn store(
        &mut self,
        regs: &mut dyn RegisterFile,
        addr: u64,
        size: usize,
        value: u64,
    ) -> Result<()>;

    /// Side-effect free read of executable memory; `false` when the bytes
    /// cannot be fetched.
    fn peek(&self, addr: u64, dst: &mut [u8]) -> bool;

    /// Fires `CODE` hooks for the instruction about to execute.
    fn code(&mut self, regs: &mut dyn RegisterFile, addr: u64, size: u32) -> Result<()>;

    /// Raises interrupt `intno` after the trapping instruction retired.
    fn interrupt(&mut self, regs: &mut dyn RegisterFile, intno: u32) -> Result<()>;

    /// Offers an undecodable instruction to `INSN_INVALID` hooks.
    fn invalid_insn(&mut self, regs: &mut dyn RegisterFile) -> Result<()>;

    /// Port input; `0` without hooks.
    fn port_in(&mut self, regs: &mut dyn RegisterFile, port: u16, size: u8) -> u32;

    /// Port output; discarded without hooks.
    fn port_out(&mut self, regs: &mut dyn RegisterFile, port: u16, size: u8, value: u32);

    /// Returns `true` when a hook emulated `CPUID` itself.
    fn cpuid(&mut self, regs: &mut dyn RegisterFile) -> bool;
}

/// One guest processor: its register file and executor.
pub(crate) trait Cpu: RegisterFile {
    /// The register file as a trait object for hook contexts.
    fn registers(&mut self) -> &mut dyn RegisterFile;

    /// Validates a run entry address.
    fn check_entry(&self, begin: u64) -> Result<()>;

    /// Instruction family for an `INSN` hook id, if the backend supports it.
    fn insn_hook(&self, id: i32) -> Option<InsnHookKind>;

    /// Executes one instruction at the program counter.
    fn step(&mut self, bus: &mut dyn Bus) -> Result<Flow>;

    /// Byte length of the block starting at `pc`, scanning at most
    /// `max_insns` instructions without side effects.
    fn block_size(&self, bus: &dyn Bus, pc: u64, max_insns: u32) -> u32;
}

/// Builds the backend for an architecture/mode pair.
pub(crate) fn new_cpu(arch: Arch, mode: Mode) -> Result<Box<dyn Cpu>> {
    match arch {
        Arch::X86 if mode == Mode::MODE_32 => Ok(Box::new(x86::X86Cpu::new())),
        Arch::Riscv if mode == Mode::RISCV32 => {
            Ok(Box::new(riscv::RiscvCpu::new(riscv::Xlen::Rv32)))
        }
        Arch::Riscv if mode == Mode::RISCV64 => {
            Ok(Box::new(riscv::RiscvCpu::new(riscv::Xlen::Rv64)))
        }
        _ => Err(Error::ModeInvalid),
    }
}

#[cfg(test)]
mod tests {
    use super::{arch_supported, new_cpu, Arch, Flow, Mode};
    use crate::Error;

    #[test]
    fn arch_codes_are_stable() {
        assert_eq!(Arch::X86.code(), 4);
        assert_eq!(Arch::Riscv.code(), 8);
        assert_eq!(Arch::try_from(8), Ok(Arch::Riscv));
        assert_eq!(Arch::try_from(1), Err(Error::Arch));
        assert!(arch_supported(4));
        assert!(!arch_supported(0));
    }

    #[test]
    fn only_documented_mode_pairs_open() {
        assert!(new_cpu(Arch::X86, Mode::MODE_32).is_ok());
        assert!(new_cpu(Arch::Riscv, Mode::RISCV32).is_ok());
        assert!(new_cpu(Arch::Riscv, Mode::RISCV64).is_ok());
        assert!(matches!(
            new_cpu(Arch::X86, Mode::MODE_64),
            Err(Error::ModeInvalid)
        ));
        assert!(matches!(
            new_cpu(Arch::X86, Mode::MODE_16),
            Err(Error::ModeInvalid)
        ));
        assert!(matches!(
            new_cpu(Arch::Riscv, Mode::RISCV32 | Mode::RISCV64),
            Err(Error::ModeInvalid)
        ));
    }

    #[test]
    fn address_mask_follows_width() {
        assert_eq!(Mode::MODE_32.address_mask(), 0xFFFF_FFFF);
        assert_eq!(Mode::RISCV64.address_mask(), u64::MAX);
        assert_eq!(Mode::MODE_16.address_mask(), 0xFFFF);
    }

    #[test]
    fn skipped_steps_neither_retire_nor_continue_the_block() {
        assert!(Flow::Next.retired());
        assert!(!Flow::Next.ends_block());
        assert!(Flow::Branch.ends_block());
        assert!(!Flow::Skipped.retired());
        assert!(Flow::Skipped.ends_block());
    }
}
