//! RISC-V integer backend: register file, executor and block scanner.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

mod alu;
mod decode;

use tracing::trace;

use self::alu::{alu32, alu64};
use self::decode::{decode, AluOp, BranchCond, Insn};
use super::{Bus, Cpu, Flow, InsnHookKind};
use crate::registers::{RegId, RegisterFile};
use crate::{Error, Result};

/// Interrupt number raised by `ECALL` (environment call from M-mode).
pub const INTNO_ECALL: u32 = 11;
/// Interrupt number raised by `EBREAK`.
pub const INTNO_EBREAK: u32 = 3;

const INSN_BYTES: u64 = 4;

/// Base integer register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Xlen {
    /// 32-bit registers and addresses.
    Rv32,
    /// 64-bit registers and addresses.
    Rv64,
}

impl Xlen {
    const fn mask(self) -> u64 {
        match self {
            Self::Rv32 => 0xFFFF_FFFF,
            Self::Rv64 => u64::MAX,
        }
    }
}

/// RISC-V register identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum RiscvReg {
    X0 = 1,
    X1,
    X2,
    X3,
    X4,
    X5,
    X6,
    X7,
    X8,
    X9,
    X10,
    X11,
    X12,
    X13,
    X14,
    X15,
    X16,
    X17,
    X18,
    X19,
    X20,
    X21,
    X22,
    X23,
    X24,
    X25,
    X26,
    X27,
    X28,
    X29,
    X30,
    X31,
    Pc,
}

impl RiscvReg {
    /// Hard-wired zero (`X0`).
    pub const ZERO: Self = Self::X0;
    /// Return address (`X1`).
    pub const RA: Self = Self::X1;
    /// Stack pointer (`X2`).
    pub const SP: Self = Self::X2;
    /// First argument / return value (`X10`).
    pub const A0: Self = Self::X10;
    /// Second argument / return value (`X11`).
    pub const A1: Self = Self::X11;
    /// Syscall number register by convention (`X17`).
    pub const A7: Self = Self::X17;

    /// Register for a raw `x` index `0..=31`.
    #[must_use]
    pub fn x(index: u8) -> Option<Self> {
        if index < 32 {
            Self::from_raw(i32::from(index) + 1)
        } else {
            None
        }
    }

    const fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => Self::X0,
            2 => Self::X1,
            3 => Self::X2,
            4 => Self::X3,
            5 => Self::X4,
            6 => Self::X5,
            7 => Self::X6,
            8 => Self::X7,
            9 => Self::X8,
            10 => Self::X9,
            11 => Self::X10,
            12 => Self::X11,
            13 => Self::X12,
            14 => Self::X13,
            15 => Self::X14,
            16 => Self::X15,
            17 => Self::X16,
            18 => Self::X17,
            19 => Self::X18,
            20 => Self::X19,
            21 => Self::X20,
            22 => Self::X21,
            23 => Self::X22,
            24 => Self::X23,
            25 => Self::X24,
            26 => Self::X25,
            27 => Self::X26,
            28 => Self::X27,
            29 => Self::X28,
            30 => Self::X29,
            31 => Self::X30,
            32 => Self::X31,
            33 => Self::Pc,
            _ => return None,
        })
    }
}

impl From<RiscvReg> for RegId {
    fn from(reg: RiscvReg) -> Self {
        Self(reg as i32)
    }
}

impl TryFrom<RegId> for RiscvReg {
    type Error = Error;

    fn try_from(reg: RegId) -> Result<Self> {
        Self::from_raw(reg.raw()).ok_or(Error::RegisterInvalid)
    }
}

/// RISC-V hart state.
#[derive(Debug, Clone)]
pub(crate) struct RiscvCpu {
    xlen: Xlen,
    x: [u64; 32],
    pc: u64,
}

impl RiscvCpu {
    pub(crate) const fn new(xlen: Xlen) -> Self {
        Self {
            xlen,
            x: [0; 32],
            pc: 0,
        }
    }

    const fn x(&self, index: u8) -> u64 {
        self.x[index as usize]
    }

    fn set_x(&mut self, index: u8, value: u64) {
        if index != 0 {
            self.x[usize::from(index)] = value & self.xlen.mask();
        }
    }

    /// Sign-extends a value computed at register width into storage form.
    const fn from_signed(&self, value: i64) -> u64 {
        value as u64 & self.xlen.mask()
    }

    fn alu(&self, op: AluOp, a: u64, b: u64, word: bool) -> u64 {
        match (self.xlen, word) {
            (Xlen::Rv32, _) => u64::from(alu32(op, a as u32, b as u32)),
            (Xlen::Rv64, true) => alu32(op, a as u32, b as u32) as i32 as i64 as u64,
            (Xlen::Rv64, false) => alu64(op, a, b),
        }
    }

    fn branch_taken(&self, cond: BranchCond, a: u64, b: u64) -> bool {
        let (sa, sb) = match self.xlen {
            Xlen::Rv32 => (i64::from(a as u32 as i32), i64::from(b as u32 as i32)),
            Xlen::Rv64 => (a as i64, b as i64),
        };
        match cond {
            BranchCond::Eq => a == b,
            BranchCond::Ne => a != b,
            BranchCond::Lt => sa < sb,
            BranchCond::Ge => sa >= sb,
            BranchCond::Ltu => a < b,
            BranchCond::Geu => a >= b,
        }
    }

    fn address(&self, base: u8, offset: i64) -> u64 {
        self.x(base).wrapping_add(offset as u64) & self.xlen.mask()
    }

    fn fetch(&mut self, bus: &mut dyn Bus) -> Result<u32> {
        let pc = self.pc;
        if pc % INSN_BYTES != 0 {
            return Err(Error::FetchUnaligned);
        }
        let mut raw = [0; 4];
        bus.fetch(self, pc, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn execute(&mut self, insn: Insn, bus: &mut dyn Bus) -> Result<Flow> {
        let pc = self.pc;
        let next = pc.wrapping_add(INSN_BYTES) & self.xlen.mask();
        let mut flow = Flow::Next;
        let mut target = next;

        match insn {
            Insn::Lui { rd, imm } => self.set_x(rd, self.from_signed(imm)),
            Insn::Auipc { rd, imm } => self.set_x(rd, pc.wrapping_add(imm as u64)),
            Insn::Jal { rd, offset } => {
                target = pc.wrapping_add(offset as u64) & self.xlen.mask();
                self.set_x(rd, next);
                flow = Flow::Branch;
            }
            Insn::Jalr { rd, rs1, offset } => {
                target = self.address(rs1, offset) & !1;
                self.set_x(rd, next);
                flow = Flow::Branch;
            }
            Insn::Branch {
                cond,
                rs1,
                rs2,
                offset,
            } => {
                if self.branch_taken(cond, self.x(rs1), self.x(rs2)) {
                    target = pc.wrapping_add(offset as u64) & self.xlen.mask();
                }
                flow = Flow::Branch;
            }
            Insn::Load {
                rd,
                rs1,
                offset,
                size,
                signed,
            } => {
                let addr = self.address(rs1, offset);
                let raw = bus.load(self, addr, size)?;
                let value = if signed {
                    let shift = 64 - size * 8;
                    self.from_signed(((raw << shift) as i64) >> shift)
                } else {
                    raw
                };
                self.set_x(rd, value);
            }
            Insn::Store {
                rs1,
                rs2,
                offset,
                size,
            } => {
                let addr = self.address(rs1, offset);
                let value = self.x(rs2);
                bus.store(self, addr, size, value)?;
            }
            Insn::OpImm {
                op,
                rd,
                rs1,
                imm,
                word,
            } => {
                let value = self.alu(op, self.x(rs1), self.from_signed(imm), word);
                self.set_x(rd, value);
            }
            Insn::Op {
                op,
                rd,
                rs1,
                rs2,
                word,
            } => {
                let value = self.alu(op, self.x(rs1), self.x(rs2), word);
                self.set_x(rd, value);
            }
            Insn::Fence => {}
            Insn::Ecall | Insn::Ebreak => {
                self.pc = next;
                let intno = if insn == Insn::Ecall {
                    INTNO_ECALL
                } else {
                    INTNO_EBREAK
                };
                bus.interrupt(self, intno)?;
                return Ok(Flow::Branch);
            }
            Insn::Wfi => flow = Flow::Halt,
        }

        self.pc = target;
        Ok(flow)
    }
}

impl RegisterFile for RiscvCpu {
    fn reg_read(&self, reg: RegId) -> Result<u64> {
        match RiscvReg::try_from(reg)? {
            RiscvReg::Pc => Ok(self.pc),
            other => Ok(self.x[(other as usize) - 1]),
        }
    }

    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<()> {
        match RiscvReg::try_from(reg)? {
            RiscvReg::Pc => self.pc = value & self.xlen.mask(),
            other => {
                let index = u8::try_from(other as i32 - 1).map_err(|_| Error::RegisterInvalid)?;
                self.set_x(index, value);
            }
        }
        Ok(())
    }

    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc & self.xlen.mask();
    }
}

impl Cpu for RiscvCpu {
    fn registers(&mut self) -> &mut dyn RegisterFile {
        self
    }

    fn check_entry(&self, begin: u64) -> Result<()> {
        if begin & !self.xlen.mask() != 0 || begin % INSN_BYTES != 0 {
            return Err(Error::ArchMismatch);
        }
        Ok(())
    }

    fn insn_hook(&self, _id: i32) -> Option<InsnHookKind> {
        None
    }

    fn step(&mut self, bus: &mut dyn Bus) -> Result<Flow> {
        let pc = self.pc;
        let word = self.fetch(bus)?;
        let insn = match decode(word, self.xlen) {
            Ok(insn) => insn,
            Err(Error::InsnInvalid) => {
                trace!(pc, word, "undecodable riscv instruction");
                bus.invalid_insn(self)?;
                return Ok(Flow::Skipped);
            }
            Err(error) => return Err(error),
        };

        bus.code(self, pc, 4)?;
        if self.pc != pc {
            return Ok(Flow::Skipped);
        }
        self.execute(insn, bus)
    }

    fn block_size(&self, bus: &dyn Bus, pc: u64, max_insns: u32) -> u32 {
        let mut size = 0;
        let mut addr = pc;
        for _ in 0..max_insns {
            let mut raw = [0; 4];
            if addr % INSN_BYTES != 0 || !bus.peek(addr, &mut raw) {
                break;
            }
            let Ok(insn) = decode(u32::from_le_bytes(raw), self.xlen) else {
                break;
            };
            size += 4;
            if insn.ends_block() {
                break;
            }
            addr = addr.wrapping_add(INSN_BYTES) & self.xlen.mask();
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::{RiscvCpu, RiscvReg, Xlen};
    use crate::arch::Cpu;
    use crate::registers::{RegId, RegisterFile};
    use crate::Error;

    #[test]
    fn x0_ignores_writes() {
        let mut cpu = RiscvCpu::new(Xlen::Rv64);
        cpu.reg_write(RiscvReg::X0.into(), 0xDEAD).expect("valid register");
        assert_eq!(cpu.reg_read(RiscvReg::ZERO.into()), Ok(0));
    }

    #[test]
    fn rv32_registers_truncate_to_32_bits() {
        let mut cpu = RiscvCpu::new(Xlen::Rv32);
        cpu.reg_write(RiscvReg::A0.into(), 0x1_2345_6789).expect("valid register");
        assert_eq!(cpu.reg_read(RiscvReg::X10.into()), Ok(0x2345_6789));
        cpu.reg_write(RiscvReg::Pc.into(), 0x1_0000_1000).expect("valid register");
        assert_eq!(cpu.pc(), 0x1000);
    }

    #[test]
    fn register_ids_outside_the_file_are_rejected() {
        let cpu = RiscvCpu::new(Xlen::Rv32);
        assert_eq!(cpu.reg_read(RegId(0)), Err(Error::RegisterInvalid));
        assert_eq!(cpu.reg_read(RegId(34)), Err(Error::RegisterInvalid));
        assert_eq!(RiscvReg::x(31), Some(RiscvReg::X31));
        assert_eq!(RiscvReg::x(32), None);
    }

    #[test]
    fn entry_must_be_aligned_and_in_range() {
        let rv32 = RiscvCpu::new(Xlen::Rv32);
        assert!(rv32.check_entry(0x1000).is_ok());
        assert_eq!(rv32.check_entry(0x1002), Err(Error::ArchMismatch));
        assert_eq!(rv32.check_entry(0x1_0000_0000), Err(Error::ArchMismatch));
        assert!(RiscvCpu::new(Xlen::Rv64).check_entry(0x1_0000_0000).is_ok());
    }
}
