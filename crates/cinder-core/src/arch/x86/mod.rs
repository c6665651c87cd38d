//! 32-bit protected-mode x86 backend over a flat address space.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

mod decode;
mod flags;

use tracing::trace;

use self::decode::{
    decode, AluOp, ByteSource, Insn, MemOperand, Op, Port, Rm, Size, Src, REG_EAX, REG_ECX,
    REG_EDX, REG_ESP,
};
use self::flags::FlagsResult;
use super::{Bus, Cpu, Flow, InsnHookKind};
use crate::registers::{Mmr, RegId, RegisterFile};
use crate::{Error, Result};

pub use self::flags::{AF, CF, EFLAGS_RESET, OF, PF, SF, ZF};

/// Interrupt number raised by `INT3`.
pub const INTNO_BREAKPOINT: u32 = 3;

/// Vendor string reported by the built-in `CPUID` leaf 0.
pub const CPUID_VENDOR: &[u8; 12] = b"CinderCoreVM";

const ADDRESS_MASK: u64 = 0xFFFF_FFFF;

/// x86 register identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum X86Reg {
    Eax = 1,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    Al,
    Cl,
    Dl,
    Bl,
    Ah,
    Ch,
    Dh,
    Bh,
    Eip,
    Eflags,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Gdtr,
    Idtr,
    Ldtr,
    Tr,
}

impl X86Reg {
    /// Every register in numbering order.
    pub const ALL: [Self; 36] = [
        Self::Eax,
        Self::Ecx,
        Self::Edx,
        Self::Ebx,
        Self::Esp,
        Self::Ebp,
        Self::Esi,
        Self::Edi,
        Self::Ax,
        Self::Cx,
        Self::Dx,
        Self::Bx,
        Self::Sp,
        Self::Bp,
        Self::Si,
        Self::Di,
        Self::Al,
        Self::Cl,
        Self::Dl,
        Self::Bl,
        Self::Ah,
        Self::Ch,
        Self::Dh,
        Self::Bh,
        Self::Eip,
        Self::Eflags,
        Self::Cs,
        Self::Ds,
        Self::Es,
        Self::Fs,
        Self::Gs,
        Self::Ss,
        Self::Gdtr,
        Self::Idtr,
        Self::Ldtr,
        Self::Tr,
    ];

    /// Returns `true` for the descriptor-table registers read through [`Mmr`].
    #[must_use]
    pub const fn is_mmr(self) -> bool {
        matches!(self, Self::Gdtr | Self::Idtr | Self::Ldtr | Self::Tr)
    }
}

impl From<X86Reg> for RegId {
    fn from(reg: X86Reg) -> Self {
        Self(reg as i32)
    }
}

impl TryFrom<RegId> for X86Reg {
    type Error = Error;

    fn try_from(reg: RegId) -> Result<Self> {
        reg.raw()
            .checked_sub(1)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or(Error::RegisterInvalid)
    }
}

/// Instructions that accept an `INSN` hook; the value is the hook's extra id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum X86Insn {
    /// `IN`: the hook returns the value read from the port.
    In = 1,
    /// `OUT`: the hook receives the value written to the port.
    Out = 2,
    /// `CPUID`: the hook returns `true` when it produced the result itself.
    Cpuid = 3,
}

impl X86Insn {
    /// Instruction for a raw hook id.
    #[must_use]
    pub const fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Self::In),
            2 => Some(Self::Out),
            3 => Some(Self::Cpuid),
            _ => None,
        }
    }

    /// Raw hook id.
    #[must_use]
    pub const fn id(self) -> i32 {
        self as i32
    }
}

/// Processor state of a 32-bit x86 guest.
#[derive(Debug, Clone)]
pub(crate) struct X86Cpu {
    gpr: [u32; 8],
    eip: u32,
    eflags: u32,
    segments: [u16; 6],
    gdtr: Mmr,
    idtr: Mmr,
    ldtr: Mmr,
    tr: Mmr,
}

struct Fetcher<'a> {
    bus: &'a mut dyn Bus,
    regs: &'a mut dyn RegisterFile,
}

impl ByteSource for Fetcher<'_> {
    fn byte(&mut self, addr: u64) -> Result<u8> {
        let mut byte = [0];
        self.bus.fetch(self.regs, addr, &mut byte)?;
        Ok(byte[0])
    }
}

struct Peeker<'a> {
    bus: &'a dyn Bus,
}

impl ByteSource for Peeker<'_> {
    fn byte(&mut self, addr: u64) -> Result<u8> {
        let mut byte = [0];
        if self.bus.peek(addr, &mut byte) {
            Ok(byte[0])
        } else {
            Err(Error::FetchUnmapped)
        }
    }
}

impl X86Cpu {
    pub(crate) const fn new() -> Self {
        Self {
            gpr: [0; 8],
            eip: 0,
            eflags: EFLAGS_RESET,
            segments: [0; 6],
            gdtr: Mmr { selector: 0, base: 0, limit: 0, flags: 0 },
            idtr: Mmr { selector: 0, base: 0, limit: 0, flags: 0 },
            ldtr: Mmr { selector: 0, base: 0, limit: 0, flags: 0 },
            tr: Mmr { selector: 0, base: 0, limit: 0, flags: 0 },
        }
    }

    const fn reg32(&self, index: u8) -> u32 {
        self.gpr[(index & 7) as usize]
    }

    fn set_reg32(&mut self, index: u8, value: u32) {
        self.gpr[(index & 7) as usize] = value;
    }

    /// `AL CL DL BL AH CH DH BH` in encoding order.
    const fn reg8(&self, index: u8) -> u8 {
        let full = self.gpr[(index & 3) as usize];
        if index & 4 == 0 {
            full as u8
        } else {
            (full >> 8) as u8
        }
    }

    fn set_reg8(&mut self, index: u8, value: u8) {
        let slot = &mut self.gpr[(index & 3) as usize];
        if index & 4 == 0 {
            *slot = (*slot & !0xFF) | u32::from(value);
        } else {
            *slot = (*slot & !0xFF00) | (u32::from(value) << 8);
        }
    }

    fn reg(&self, size: Size, index: u8) -> u32 {
        match size {
            Size::Byte => u32::from(self.reg8(index)),
            Size::Dword => self.reg32(index),
        }
    }

    fn set_reg(&mut self, size: Size, index: u8, value: u32) {
        match size {
            Size::Byte => self.set_reg8(index, value as u8),
            Size::Dword => self.set_reg32(index, value),
        }
    }

    fn effective_address(&self, mem: MemOperand) -> u64 {
        let mut addr = mem.disp as u32;
        if let Some(base) = mem.base {
            addr = addr.wrapping_add(self.reg32(base));
        }
        if let Some((index, scale)) = mem.index {
            addr = addr.wrapping_add(self.reg32(index).wrapping_mul(u32::from(scale)));
        }
        u64::from(addr)
    }

    fn read_rm(&mut self, bus: &mut dyn Bus, size: Size, rm: Rm) -> Result<u32> {
        match rm {
            Rm::Reg(index) => Ok(self.reg(size, index)),
            Rm::Mem(mem) => {
                let addr = self.effective_address(mem);
                Ok(bus.load(self, addr, size.bytes())? as u32)
            }
        }
    }

    fn write_rm(&mut self, bus: &mut dyn Bus, size: Size, rm: Rm, value: u32) -> Result<()> {
        match rm {
            Rm::Reg(index) => {
                self.set_reg(size, index, value);
                Ok(())
            }
            Rm::Mem(mem) => {
                let addr = self.effective_address(mem);
                bus.store(self, addr, size.bytes(), u64::from(value))
            }
        }
    }

    fn read_src(&mut self, bus: &mut dyn Bus, size: Size, src: Src) -> Result<u32> {
        match src {
            Src::Rm(rm) => self.read_rm(bus, size, rm),
            Src::Imm(value) => Ok(value & size.mask()),
        }
    }

    fn push(&mut self, bus: &mut dyn Bus, value: u32) -> Result<()> {
        let esp = self.reg32(REG_ESP).wrapping_sub(4);
        bus.store(self, u64::from(esp), 4, u64::from(value))?;
        self.set_reg32(REG_ESP, esp);
        Ok(())
    }

    fn pop(&mut self, bus: &mut dyn Bus) -> Result<u32> {
        let esp = self.reg32(REG_ESP);
        let value = bus.load(self, u64::from(esp), 4)? as u32;
        self.set_reg32(REG_ESP, esp.wrapping_add(4));
        Ok(value)
    }

    fn set_status(&mut self, result: FlagsResult, keep: u32) {
        let preserved = self.eflags & !(flags::STATUS_MASK & !keep);
        self.eflags = preserved | (result.flags & !keep);
    }

    /// Computes an ALU result without touching `EFLAGS`.
    fn alu(&self, op: AluOp, size: Size, a: u32, b: u32) -> FlagsResult {
        let carry = self.eflags & CF != 0;
        match op {
            AluOp::Add => flags::add(size, a, b, false),
            AluOp::Adc => flags::add(size, a, b, carry),
            AluOp::Sub | AluOp::Cmp => flags::sub(size, a, b, false),
            AluOp::Sbb => flags::sub(size, a, b, carry),
            AluOp::Or => flags::logic(size, a | b),
            AluOp::And | AluOp::Test => flags::logic(size, a & b),
            AluOp::Xor => flags::logic(size, a ^ b),
        }
    }

    fn port(&self, port: Port) -> u16 {
        match port {
            Port::Imm(port) => u16::from(port),
            Port::Dx => self.reg32(REG_EDX) as u16,
        }
    }

    fn builtin_cpuid(&mut self) {
        let leaf = self.reg32(REG_EAX);
        let word = |chunk: usize| {
            let bytes = &CPUID_VENDOR[chunk * 4..chunk * 4 + 4];
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        };
        let (eax, ebx, ecx, edx) = match leaf {
            0 => (1, word(0), word(2), word(1)),
            1 => (0x0000_0600, 0, 0, 0),
            _ => (0, 0, 0, 0),
        };
        self.gpr[0] = eax;
        self.gpr[3] = ebx;
        self.gpr[1] = ecx;
        self.gpr[2] = edx;
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, insn: Insn, bus: &mut dyn Bus) -> Result<Flow> {
        let next = self.eip.wrapping_add(u32::from(insn.len));
        let relative = |rel: i32| next.wrapping_add(rel as u32);
        let mut target = next;
        let mut flow = Flow::Next;

        match insn.op {
            Op::Alu { op, size, dst, src } => {
                let a = self.read_rm(bus, size, dst)?;
                let b = self.read_src(bus, size, src)?;
                let result = self.alu(op, size, a, b);
                if op.writes_back() {
                    self.write_rm(bus, size, dst, result.value)?;
                }
                self.set_status(result, 0);
            }
            Op::Inc { size, dst } | Op::Dec { size, dst } => {
                let a = self.read_rm(bus, size, dst)?;
                let result = if matches!(insn.op, Op::Inc { .. }) {
                    flags::add(size, a, 1, false)
                } else {
                    flags::sub(size, a, 1, false)
                };
                self.write_rm(bus, size, dst, result.value)?;
                self.set_status(result, CF);
            }
            Op::Mov { size, dst, src } => {
                let value = self.read_src(bus, size, src)?;
                self.write_rm(bus, size, dst, value)?;
            }
            Op::Lea { reg, mem } => {
                let addr = self.effective_address(mem) as u32;
                self.set_reg32(reg, addr);
            }
            Op::Push { src } => {
                let value = self.read_src(bus, Size::Dword, src)?;
                self.push(bus, value)?;
            }
            Op::Pop { dst } => {
                let value = self.pop(bus)?;
                self.write_rm(bus, Size::Dword, dst, value)?;
            }
            Op::Jcc { cond, rel } => {
                if flags::condition(cond, self.eflags) {
                    target = relative(rel);
                }
                flow = Flow::Branch;
            }
            Op::Jmp { rel } => {
                target = relative(rel);
                flow = Flow::Branch;
            }
            Op::JmpIndirect { target: rm } => {
                target = self.read_rm(bus, Size::Dword, rm)?;
                flow = Flow::Branch;
            }
            Op::Call { rel } => {
                self.push(bus, next)?;
                target = relative(rel);
                flow = Flow::Branch;
            }
            Op::CallIndirect { target: rm } => {
                let destination = self.read_rm(bus, Size::Dword, rm)?;
                self.push(bus, next)?;
                target = destination;
                flow = Flow::Branch;
            }
            Op::Ret { release } => {
                target = self.pop(bus)?;
                let esp = self.reg32(REG_ESP).wrapping_add(u32::from(release));
                self.set_reg32(REG_ESP, esp);
                flow = Flow::Branch;
            }
            Op::Loop { rel } => {
                let ecx = self.reg32(REG_ECX).wrapping_sub(1);
                self.set_reg32(REG_ECX, ecx);
                if ecx != 0 {
                    target = relative(rel);
                }
                flow = Flow::Branch;
            }
            Op::Int { vector } => {
                self.eip = next;
                bus.interrupt(self, u32::from(vector))?;
                return Ok(Flow::Branch);
            }
            Op::Hlt => flow = Flow::Halt,
            Op::Nop => {}
            Op::In { size, port } => {
                let port = self.port(port);
                let value = bus.port_in(self, port, size.bytes() as u8);
                self.set_reg(size, REG_EAX, value);
            }
            Op::Out { size, port } => {
                let port = self.port(port);
                let value = self.reg(size, REG_EAX);
                bus.port_out(self, port, size.bytes() as u8, value);
            }
            Op::Cpuid => {
                if !bus.cpuid(self) {
                    self.builtin_cpuid();
                }
            }
        }

        self.eip = target;
        Ok(flow)
    }
}

impl RegisterFile for X86Cpu {
    fn reg_read(&self, reg: RegId) -> Result<u64> {
        let reg = X86Reg::try_from(reg)?;
        let raw = reg as i32;
        let value = match reg {
            X86Reg::Eax
            | X86Reg::Ecx
            | X86Reg::Edx
            | X86Reg::Ebx
            | X86Reg::Esp
            | X86Reg::Ebp
            | X86Reg::Esi
            | X86Reg::Edi => self.reg32((raw - 1) as u8),
            X86Reg::Ax
            | X86Reg::Cx
            | X86Reg::Dx
            | X86Reg::Bx
            | X86Reg::Sp
            | X86Reg::Bp
            | X86Reg::Si
            | X86Reg::Di => self.reg32((raw - 9) as u8) & 0xFFFF,
            X86Reg::Al
            | X86Reg::Cl
            | X86Reg::Dl
            | X86Reg::Bl
            | X86Reg::Ah
            | X86Reg::Ch
            | X86Reg::Dh
            | X86Reg::Bh => u32::from(self.reg8((raw - 17) as u8)),
            X86Reg::Eip => self.eip,
            X86Reg::Eflags => self.eflags,
            X86Reg::Cs | X86Reg::Ds | X86Reg::Es | X86Reg::Fs | X86Reg::Gs | X86Reg::Ss => {
                u32::from(self.segments[(raw - 27) as usize])
            }
            X86Reg::Gdtr | X86Reg::Idtr | X86Reg::Ldtr | X86Reg::Tr => {
                return Err(Error::RegisterInvalid)
            }
        };
        Ok(u64::from(value))
    }

    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<()> {
        let reg = X86Reg::try_from(reg)?;
        let raw = reg as i32;
        let value = value as u32;
        match reg {
            X86Reg::Eax
            | X86Reg::Ecx
            | X86Reg::Edx
            | X86Reg::Ebx
            | X86Reg::Esp
            | X86Reg::Ebp
            | X86Reg::Esi
            | X86Reg::Edi => self.set_reg32((raw - 1) as u8, value),
            X86Reg::Ax
            | X86Reg::Cx
            | X86Reg::Dx
            | X86Reg::Bx
            | X86Reg::Sp
            | X86Reg::Bp
            | X86Reg::Si
            | X86Reg::Di => {
                let index = (raw - 9) as u8;
                let merged = (self.reg32(index) & 0xFFFF_0000) | (value & 0xFFFF);
                self.set_reg32(index, merged);
            }
            X86Reg::Al
            | X86Reg::Cl
            | X86Reg::Dl
            | X86Reg::Bl
            | X86Reg::Ah
            | X86Reg::Ch
            | X86Reg::Dh
            | X86Reg::Bh => self.set_reg8((raw - 17) as u8, value as u8),
            X86Reg::Eip => self.eip = value,
            X86Reg::Eflags => self.eflags = value | flags::RESERVED_ONE,
            X86Reg::Cs | X86Reg::Ds | X86Reg::Es | X86Reg::Fs | X86Reg::Gs | X86Reg::Ss => {
                self.segments[(raw - 27) as usize] = value as u16;
            }
            X86Reg::Gdtr | X86Reg::Idtr | X86Reg::Ldtr | X86Reg::Tr => {
                return Err(Error::RegisterInvalid)
            }
        }
        Ok(())
    }

    fn reg_read_mmr(&self, reg: RegId) -> Result<Mmr> {
        match X86Reg::try_from(reg)? {
            X86Reg::Gdtr => Ok(self.gdtr),
            X86Reg::Idtr => Ok(self.idtr),
            X86Reg::Ldtr => Ok(self.ldtr),
            X86Reg::Tr => Ok(self.tr),
            _ => Err(Error::RegisterInvalid),
        }
    }

    fn reg_write_mmr(&mut self, reg: RegId, value: Mmr) -> Result<()> {
        // GDTR and IDTR hold only a base and a 16-bit limit.
        let table = Mmr {
            selector: 0,
            base: value.base & ADDRESS_MASK,
            limit: value.limit & 0xFFFF,
            flags: 0,
        };
        let segment = Mmr {
            base: value.base & ADDRESS_MASK,
            ..value
        };
        match X86Reg::try_from(reg)? {
            X86Reg::Gdtr => self.gdtr = table,
            X86Reg::Idtr => self.idtr = table,
            X86Reg::Ldtr => self.ldtr = segment,
            X86Reg::Tr => self.tr = segment,
            _ => return Err(Error::RegisterInvalid),
        }
        Ok(())
    }

    fn pc(&self) -> u64 {
        u64::from(self.eip)
    }

    fn set_pc(&mut self, pc: u64) {
        self.eip = pc as u32;
    }
}

impl Cpu for X86Cpu {
    fn registers(&mut self) -> &mut dyn RegisterFile {
        self
    }

    fn check_entry(&self, begin: u64) -> Result<()> {
        if begin & !ADDRESS_MASK != 0 {
            return Err(Error::ArchMismatch);
        }
        Ok(())
    }

    fn insn_hook(&self, id: i32) -> Option<InsnHookKind> {
        X86Insn::from_id(id).map(|insn| match insn {
            X86Insn::In => InsnHookKind::PortIn,
            X86Insn::Out => InsnHookKind::PortOut,
            X86Insn::Cpuid => InsnHookKind::Cpuid,
        })
    }

    fn step(&mut self, bus: &mut dyn Bus) -> Result<Flow> {
        let pc = u64::from(self.eip);
        let decoded = decode(&mut Fetcher { bus: &mut *bus, regs: &mut *self }, pc);
        let insn = match decoded {
            Ok(insn) => insn,
            Err(Error::InsnInvalid) => {
                trace!(pc, "undecodable x86 instruction");
                bus.invalid_insn(self)?;
                return Ok(Flow::Skipped);
            }
            Err(error) => return Err(error),
        };

        bus.code(self, pc, u32::from(insn.len))?;
        if u64::from(self.eip) != pc {
            return Ok(Flow::Skipped);
        }
        self.execute(insn, bus)
    }

    fn block_size(&self, bus: &dyn Bus, pc: u64, max_insns: u32) -> u32 {
        let mut peeker = Peeker { bus };
        let mut size = 0;
        let mut addr = pc;
        for _ in 0..max_insns {
            let Ok(insn) = decode(&mut peeker, addr) else {
                break;
            };
            size += u32::from(insn.len);
            if insn.op.ends_block() {
                break;
            }
            addr = addr.wrapping_add(u64::from(insn.len)) & ADDRESS_MASK;
        }
        size
    }
}
