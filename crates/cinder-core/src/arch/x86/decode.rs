//! Decoder for the supported 32-bit x86 subset.
//!
//! Bytes are pulled one at a time from a [`ByteSource`] so a fetch fault is
//! reported at the exact byte that could not be read.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

use crate::{Error, Result};

/// Architectural upper bound on instruction length.
pub const MAX_INSN_LEN: u8 = 15;

/// Index of `EAX` in the general register file.
pub const REG_EAX: u8 = 0;
/// Index of `ECX`.
pub const REG_ECX: u8 = 1;
/// Index of `EDX`.
pub const REG_EDX: u8 = 2;
/// Index of `ESP`.
pub const REG_ESP: u8 = 4;

/// Supplies instruction bytes by linear address.
pub trait ByteSource {
    /// Reads the byte at `addr`.
    fn byte(&mut self, addr: u64) -> Result<u8>;
}

/// Operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /// 8-bit operand.
    Byte,
    /// 32-bit operand.
    Dword,
}

impl Size {
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Dword => 4,
        }
    }

    /// Mask covering the operand.
    #[must_use]
    pub const fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Dword => u32::MAX,
        }
    }

    /// Most significant bit of the operand.
    #[must_use]
    pub const fn sign_bit(self) -> u32 {
        match self {
            Self::Byte => 0x80,
            Self::Dword => 0x8000_0000,
        }
    }
}

/// `[base + index * scale + disp]` memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    /// Base register index.
    pub base: Option<u8>,
    /// Index register index and scale factor.
    pub index: Option<(u8, u8)>,
    /// Signed displacement.
    pub disp: i32,
}

/// Register or memory operand selected by a ModRM byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rm {
    /// Register index (interpretation depends on operand size).
    Reg(u8),
    /// Memory operand.
    Mem(MemOperand),
}

/// Source operand of two-operand instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src {
    /// Register or memory.
    Rm(Rm),
    /// Immediate, already extended to operand width.
    Imm(u32),
}

/// Two-operand arithmetic and logic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
}

impl AluOp {
    /// Operation selected by a 3-bit group index (`/0`..`/7`).
    #[must_use]
    pub const fn from_group(index: u8) -> Self {
        match index & 7 {
            0 => Self::Add,
            1 => Self::Or,
            2 => Self::Adc,
            3 => Self::Sbb,
            4 => Self::And,
            5 => Self::Sub,
            6 => Self::Xor,
            _ => Self::Cmp,
        }
    }

    /// Whether the result is written back to the destination.
    #[must_use]
    pub const fn writes_back(self) -> bool {
        !matches!(self, Self::Cmp | Self::Test)
    }
}

/// I/O port operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Immediate 8-bit port.
    Imm(u8),
    /// Port held in `DX`.
    Dx,
}

/// Decoded operation. Relative branch displacements are measured from the
/// end of the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Op {
    Alu { op: AluOp, size: Size, dst: Rm, src: Src },
    Inc { size: Size, dst: Rm },
    Dec { size: Size, dst: Rm },
    Mov { size: Size, dst: Rm, src: Src },
    Lea { reg: u8, mem: MemOperand },
    Push { src: Src },
    Pop { dst: Rm },
    Jcc { cond: u8, rel: i32 },
    Jmp { rel: i32 },
    JmpIndirect { target: Rm },
    Call { rel: i32 },
    CallIndirect { target: Rm },
    Ret { release: u16 },
    Loop { rel: i32 },
    Int { vector: u8 },
    Hlt,
    Nop,
    In { size: Size, port: Port },
    Out { size: Size, port: Port },
    Cpuid,
}

impl Op {
    /// Returns `true` for instructions that end a basic block.
    #[must_use]
    pub const fn ends_block(self) -> bool {
        matches!(
            self,
            Self::Jcc { .. }
                | Self::Jmp { .. }
                | Self::JmpIndirect { .. }
                | Self::Call { .. }
                | Self::CallIndirect { .. }
                | Self::Ret { .. }
                | Self::Loop { .. }
                | Self::Int { .. }
                | Self::Hlt
        )
    }
}

/// A decoded instruction and its encoded length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    /// Operation.
    pub op: Op,
    /// Encoded length in bytes.
    pub len: u8,
}

struct Cursor<'s> {
    src: &'s mut dyn ByteSource,
    pc: u64,
    len: u8,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Result<u8> {
        if self.len >= MAX_INSN_LEN {
            return Err(Error::InsnInvalid);
        }
        let addr = self.pc.wrapping_add(u64::from(self.len)) & 0xFFFF_FFFF;
        let byte = self.src.byte(addr)?;
        self.len += 1;
        Ok(byte)
    }

    fn i8(&mut self) -> Result<i32> {
        Ok(i32::from(self.u8()? as i8))
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn imm(&mut self, size: Size) -> Result<u32> {
        match size {
            Size::Byte => self.u8().map(u32::from),
            Size::Dword => self.u32(),
        }
    }

    /// Reads a ModRM byte (plus SIB and displacement) and returns the `reg`
    /// field with the decoded `r/m` operand.
    fn modrm(&mut self) -> Result<(u8, Rm)> {
        let byte = self.u8()?;
        let mode = byte >> 6;
        let reg = (byte >> 3) & 7;
        let rm = byte & 7;
        if mode == 3 {
            return Ok((reg, Rm::Reg(rm)));
        }

        let mut index = None;
        let base = if rm == 4 {
            let sib = self.u8()?;
            let scale = 1 << (sib >> 6);
            let idx = (sib >> 3) & 7;
            if idx != 4 {
                index = Some((idx, scale));
            }
            let base = sib & 7;
            (base != 5 || mode != 0).then_some(base)
        } else if rm == 5 && mode == 0 {
            None
        } else {
            Some(rm)
        };

        let disp = match mode {
            1 => self.i8()?,
            2 => self.i32()?,
            _ if base.is_none() => self.i32()?,
            _ => 0,
        };
        Ok((reg, Rm::Mem(MemOperand { base, index, disp })))
    }
}

const fn size_of(opcode: u8) -> Size {
    if opcode & 1 == 0 {
        Size::Byte
    } else {
        Size::Dword
    }
}

/// Decodes the instruction at `pc`.
///
/// # Errors
///
/// Returns [`Error::InsnInvalid`] for prefixes and opcodes outside the
/// supported subset, or the fetch error reported by `src`.
pub fn decode(src: &mut dyn ByteSource, pc: u64) -> Result<Insn> {
    let mut cur = Cursor { src, pc, len: 0 };
    let opcode = cur.u8()?;

    let op = match opcode {
        // ALU group: r/m,r / r,r/m / acc,imm in byte and dword widths.
        0x00..=0x3D if opcode & 7 <= 5 => {
            let op = AluOp::from_group(opcode >> 3);
            let size = size_of(opcode);
            match opcode & 7 {
                0 | 1 => {
                    let (reg, rm) = cur.modrm()?;
                    Op::Alu { op, size, dst: rm, src: Src::Rm(Rm::Reg(reg)) }
                }
                2 | 3 => {
                    let (reg, rm) = cur.modrm()?;
                    Op::Alu { op, size, dst: Rm::Reg(reg), src: Src::Rm(rm) }
                }
                _ => Op::Alu {
                    op,
                    size,
                    dst: Rm::Reg(REG_EAX),
                    src: Src::Imm(cur.imm(size)?),
                },
            }
        }
        0x0F => decode_two_byte(&mut cur)?,
        0x40..=0x47 => Op::Inc { size: Size::Dword, dst: Rm::Reg(opcode & 7) },
        0x48..=0x4F => Op::Dec { size: Size::Dword, dst: Rm::Reg(opcode & 7) },
        0x50..=0x57 => Op::Push { src: Src::Rm(Rm::Reg(opcode & 7)) },
        0x58..=0x5F => Op::Pop { dst: Rm::Reg(opcode & 7) },
        0x68 => Op::Push { src: Src::Imm(cur.u32()?) },
        0x6A => Op::Push { src: Src::Imm(cur.i8()? as u32) },
        0x70..=0x7F => Op::Jcc { cond: opcode & 0xF, rel: cur.i8()? },
        0x80 | 0x81 | 0x83 => {
            let (group, dst) = cur.modrm()?;
            let size = if opcode == 0x80 { Size::Byte } else { Size::Dword };
            let imm = match opcode {
                0x81 => cur.u32()?,
                0x83 => cur.i8()? as u32,
                _ => cur.u8().map(u32::from)?,
            };
            Op::Alu { op: AluOp::from_group(group), size, dst, src: Src::Imm(imm) }
        }
        0x84 | 0x85 => {
            let (reg, rm) = cur.modrm()?;
            Op::Alu { op: AluOp::Test, size: size_of(opcode), dst: rm, src: Src::Rm(Rm::Reg(reg)) }
        }
        0x88 | 0x89 => {
            let (reg, rm) = cur.modrm()?;
            Op::Mov { size: size_of(opcode), dst: rm, src: Src::Rm(Rm::Reg(reg)) }
        }
        0x8A | 0x8B => {
            let (reg, rm) = cur.modrm()?;
            Op::Mov { size: size_of(opcode), dst: Rm::Reg(reg), src: Src::Rm(rm) }
        }
        0x8D => match cur.modrm()? {
            (reg, Rm::Mem(mem)) => Op::Lea { reg, mem },
            (_, Rm::Reg(_)) => return Err(Error::InsnInvalid),
        },
        0x90 => Op::Nop,
        0xA8 | 0xA9 => {
            let size = size_of(opcode);
            Op::Alu { op: AluOp::Test, size, dst: Rm::Reg(REG_EAX), src: Src::Imm(cur.imm(size)?) }
        }
        0xB0..=0xB7 => Op::Mov { size: Size::Byte, dst: Rm::Reg(opcode & 7), src: Src::Imm(cur.imm(Size::Byte)?) },
        0xB8..=0xBF => Op::Mov { size: Size::Dword, dst: Rm::Reg(opcode & 7), src: Src::Imm(cur.u32()?) },
        0xC2 => Op::Ret { release: cur.u16()? },
        0xC3 => Op::Ret { release: 0 },
        0xC6 | 0xC7 => {
            let size = size_of(opcode);
            match cur.modrm()? {
                (0, dst) => Op::Mov { size, dst, src: Src::Imm(cur.imm(size)?) },
                _ => return Err(Error::InsnInvalid),
            }
        }
        0xCC => Op::Int { vector: 3 },
        0xCD => Op::Int { vector: cur.u8()? },
        0xE2 => Op::Loop { rel: cur.i8()? },
        0xE4 | 0xE5 => Op::In { size: size_of(opcode), port: Port::Imm(cur.u8()?) },
        0xE6 | 0xE7 => Op::Out { size: size_of(opcode), port: Port::Imm(cur.u8()?) },
        0xE8 => Op::Call { rel: cur.i32()? },
        0xE9 => Op::Jmp { rel: cur.i32()? },
        0xEB => Op::Jmp { rel: cur.i8()? },
        0xEC | 0xED => Op::In { size: size_of(opcode), port: Port::Dx },
        0xEE | 0xEF => Op::Out { size: size_of(opcode), port: Port::Dx },
        0xF4 => Op::Hlt,
        0xFE | 0xFF => {
            let size = size_of(opcode);
            match (cur.modrm()?, size) {
                ((0, dst), _) => Op::Inc { size, dst },
                ((1, dst), _) => Op::Dec { size, dst },
                ((2, target), Size::Dword) => Op::CallIndirect { target },
                ((4, target), Size::Dword) => Op::JmpIndirect { target },
                ((6, src), Size::Dword) => Op::Push { src: Src::Rm(src) },
                _ => return Err(Error::InsnInvalid),
            }
        }
        _ => return Err(Error::InsnInvalid),
    };

    Ok(Insn { op, len: cur.len })
}

fn decode_two_byte(cur: &mut Cursor<'_>) -> Result<Op> {
    let opcode = cur.u8()?;
    match opcode {
        0x80..=0x8F => Ok(Op::Jcc { cond: opcode & 0xF, rel: cur.i32()? }),
        0xA2 => Ok(Op::Cpuid),
        _ => Err(Error::InsnInvalid),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{decode, AluOp, ByteSource, Insn, MemOperand, Op, Port, Rm, Size, Src};
    use crate::{Error, Result};

    struct Bytes(&'static [u8]);

    impl ByteSource for Bytes {
        fn byte(&mut self, addr: u64) -> Result<u8> {
            usize::try_from(addr)
                .ok()
                .and_then(|index| self.0.get(index).copied())
                .ok_or(Error::FetchUnmapped)
        }
    }

    fn decode_bytes(bytes: &'static [u8]) -> Result<Insn> {
        decode(&mut Bytes(bytes), 0)
    }

    #[rstest]
    // add eax, ebx
    #[case(&[0x01, 0xD8], Op::Alu { op: AluOp::Add, size: Size::Dword, dst: Rm::Reg(0), src: Src::Rm(Rm::Reg(3)) }, 2)]
    // sub ecx, 0x10
    #[case(&[0x83, 0xE9, 0x10], Op::Alu { op: AluOp::Sub, size: Size::Dword, dst: Rm::Reg(1), src: Src::Imm(0x10) }, 3)]
    // cmp eax, -1 (sign-extended imm8)
    #[case(&[0x83, 0xF8, 0xFF], Op::Alu { op: AluOp::Cmp, size: Size::Dword, dst: Rm::Reg(0), src: Src::Imm(u32::MAX) }, 3)]
    // xor eax, 0x12345678
    #[case(&[0x35, 0x78, 0x56, 0x34, 0x12], Op::Alu { op: AluOp::Xor, size: Size::Dword, dst: Rm::Reg(0), src: Src::Imm(0x1234_5678) }, 5)]
    // mov ecx, 0x1000
    #[case(&[0xB9, 0x00, 0x10, 0x00, 0x00], Op::Mov { size: Size::Dword, dst: Rm::Reg(1), src: Src::Imm(0x1000) }, 5)]
    // mov ah, 7
    #[case(&[0xB4, 0x07], Op::Mov { size: Size::Byte, dst: Rm::Reg(4), src: Src::Imm(7) }, 2)]
    // inc ecx
    #[case(&[0x41], Op::Inc { size: Size::Dword, dst: Rm::Reg(1) }, 1)]
    // jnz -2
    #[case(&[0x75, 0xFE], Op::Jcc { cond: 5, rel: -2 }, 2)]
    // je rel32 +0x100
    #[case(&[0x0F, 0x84, 0x00, 0x01, 0x00, 0x00], Op::Jcc { cond: 4, rel: 0x100 }, 6)]
    // out dx, al
    #[case(&[0xEE], Op::Out { size: Size::Byte, port: Port::Dx }, 1)]
    // in eax, 0x60
    #[case(&[0xE5, 0x60], Op::In { size: Size::Dword, port: Port::Imm(0x60) }, 2)]
    #[case(&[0x0F, 0xA2], Op::Cpuid, 2)]
    #[case(&[0xCD, 0x80], Op::Int { vector: 0x80 }, 2)]
    #[case(&[0xF4], Op::Hlt, 1)]
    fn decodes_register_and_immediate_forms(
        #[case] bytes: &'static [u8],
        #[case] op: Op,
        #[case] len: u8,
    ) {
        assert_eq!(decode_bytes(bytes), Ok(Insn { op, len }));
    }

    #[test]
    fn sib_with_scaled_index_and_disp8() {
        // mov eax, [ebx + esi*4 + 8]
        let insn = decode_bytes(&[0x8B, 0x44, 0xB3, 0x08]).expect("decodes");
        assert_eq!(insn.len, 4);
        assert_eq!(
            insn.op,
            Op::Mov {
                size: Size::Dword,
                dst: Rm::Reg(0),
                src: Src::Rm(Rm::Mem(MemOperand { base: Some(3), index: Some((6, 4)), disp: 8 })),
            }
        );
    }

    #[test]
    fn absolute_disp32_without_base() {
        // mov [0x2000], eax
        let insn = decode_bytes(&[0x89, 0x05, 0x00, 0x20, 0x00, 0x00]).expect("decodes");
        assert_eq!(
            insn.op,
            Op::Mov {
                size: Size::Dword,
                dst: Rm::Mem(MemOperand { base: None, index: None, disp: 0x2000 }),
                src: Src::Rm(Rm::Reg(0)),
            }
        );
        // lea eax, [esp + 4] needs a SIB byte with no index
        let insn = decode_bytes(&[0x8D, 0x44, 0x24, 0x04]).expect("decodes");
        assert_eq!(
            insn.op,
            Op::Lea { reg: 0, mem: MemOperand { base: Some(4), index: None, disp: 4 } }
        );
    }

    #[rstest]
    // operand-size prefix
    #[case(&[0x66, 0x90])]
    // lea with register operand
    #[case(&[0x8D, 0xC0])]
    // 0xFF /7
    #[case(&[0xFF, 0xF8])]
    // two-byte opcode outside the subset
    #[case(&[0x0F, 0x0B])]
    fn unsupported_encodings_are_invalid(#[case] bytes: &'static [u8]) {
        assert_eq!(decode_bytes(bytes), Err(Error::InsnInvalid));
    }

    #[test]
    fn truncated_instruction_reports_fetch_fault() {
        assert_eq!(decode_bytes(&[0xB8, 0x01]), Err(Error::FetchUnmapped));
    }

    #[test]
    fn block_terminators() {
        assert!(Op::Ret { release: 0 }.ends_block());
        assert!(Op::Int { vector: 3 }.ends_block());
        assert!(!Op::Cpuid.ends_block());
        assert!(!Op::Nop.ends_block());
    }
}
