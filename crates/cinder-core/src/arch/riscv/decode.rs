//! RV32I/RV64I + M instruction decoding.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

use super::Xlen;
use crate::{Error, Result};

const OPCODE_LOAD: u32 = 0b000_0011;
const OPCODE_MISC_MEM: u32 = 0b000_1111;
const OPCODE_OP_IMM: u32 = 0b001_0011;
const OPCODE_AUIPC: u32 = 0b001_0111;
const OPCODE_OP_IMM_32: u32 = 0b001_1011;
const OPCODE_STORE: u32 = 0b010_0011;
const OPCODE_OP: u32 = 0b011_0011;
const OPCODE_LUI: u32 = 0b011_0111;
const OPCODE_OP_32: u32 = 0b011_1011;
const OPCODE_BRANCH: u32 = 0b110_0011;
const OPCODE_JALR: u32 = 0b110_0111;
const OPCODE_JAL: u32 = 0b110_1111;
const OPCODE_SYSTEM: u32 = 0b111_0011;

const WORD_ECALL: u32 = 0x0000_0073;
const WORD_EBREAK: u32 = 0x0010_0073;
const WORD_WFI: u32 = 0x1050_0073;

/// Register-register and register-immediate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AluOp {
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

/// Conditional branch comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

/// A decoded instruction. Register fields are raw indices `0..=31`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Insn {
    Lui {
        rd: u8,
        imm: i64,
    },
    Auipc {
        rd: u8,
        imm: i64,
    },
    Jal {
        rd: u8,
        offset: i64,
    },
    Jalr {
        rd: u8,
        rs1: u8,
        offset: i64,
    },
    Branch {
        cond: BranchCond,
        rs1: u8,
        rs2: u8,
        offset: i64,
    },
    Load {
        rd: u8,
        rs1: u8,
        offset: i64,
        size: usize,
        signed: bool,
    },
    Store {
        rs1: u8,
        rs2: u8,
        offset: i64,
        size: usize,
    },
    OpImm {
        op: AluOp,
        rd: u8,
        rs1: u8,
        imm: i64,
        word: bool,
    },
    Op {
        op: AluOp,
        rd: u8,
        rs1: u8,
        rs2: u8,
        word: bool,
    },
    Fence,
    Ecall,
    Ebreak,
    Wfi,
}

impl Insn {
    /// Returns `true` for instructions that end a basic block.
    #[must_use]
    pub const fn ends_block(self) -> bool {
        matches!(
            self,
            Self::Jal { .. }
                | Self::Jalr { .. }
                | Self::Branch { .. }
                | Self::Ecall
                | Self::Ebreak
                | Self::Wfi
        )
    }
}

#[inline]
const fn extract_opcode(word: u32) -> u32 {
    word & 0x7F
}

#[inline]
const fn extract_rd(word: u32) -> u8 {
    ((word >> 7) & 0x1F) as u8
}

#[inline]
const fn extract_fn3(word: u32) -> u32 {
    (word >> 12) & 0x7
}

#[inline]
const fn extract_rs1(word: u32) -> u8 {
    ((word >> 15) & 0x1F) as u8
}

#[inline]
const fn extract_rs2(word: u32) -> u8 {
    ((word >> 20) & 0x1F) as u8
}

#[inline]
const fn extract_fn7(word: u32) -> u32 {
    word >> 25
}

#[inline]
const fn imm_i(word: u32) -> i64 {
    (word as i32 >> 20) as i64
}

#[inline]
const fn imm_s(word: u32) -> i64 {
    (((word & 0xFE00_0000) as i32 >> 20) | ((word >> 7) & 0x1F) as i32) as i64
}

#[inline]
const fn imm_b(word: u32) -> i64 {
    let sign = (word & 0x8000_0000) as i32 >> 19;
    let bit11 = ((word & 0x80) << 4) as i32;
    let bits10_5 = ((word >> 20) & 0x7E0) as i32;
    let bits4_1 = ((word >> 7) & 0x1E) as i32;
    (sign | bit11 | bits10_5 | bits4_1) as i64
}

#[inline]
const fn imm_u(word: u32) -> i64 {
    (word & 0xFFFF_F000) as i32 as i64
}

#[inline]
const fn imm_j(word: u32) -> i64 {
    let sign = (word & 0x8000_0000) as i32 >> 11;
    let bits19_12 = (word & 0x000F_F000) as i32;
    let bit11 = ((word >> 9) & 0x800) as i32;
    let bits10_1 = ((word >> 20) & 0x7FE) as i32;
    (sign | bits19_12 | bit11 | bits10_1) as i64
}

/// Decodes one 32-bit instruction word for the given register width.
///
/// # Errors
///
/// Returns [`Error::InsnInvalid`] for encodings outside RV32I/RV64I + M,
/// `FENCE` and the `ECALL`/`EBREAK`/`WFI` system instructions.
pub fn decode(word: u32, xlen: Xlen) -> Result<Insn> {
    let rd = extract_rd(word);
    let rs1 = extract_rs1(word);
    let rs2 = extract_rs2(word);
    let fn3 = extract_fn3(word);
    let fn7 = extract_fn7(word);
    let rv64 = xlen == Xlen::Rv64;

    let insn = match extract_opcode(word) {
        OPCODE_LUI => Insn::Lui {
            rd,
            imm: imm_u(word),
        },
        OPCODE_AUIPC => Insn::Auipc {
            rd,
            imm: imm_u(word),
        },
        OPCODE_JAL => Insn::Jal {
            rd,
            offset: imm_j(word),
        },
        OPCODE_JALR if fn3 == 0 => Insn::Jalr {
            rd,
            rs1,
            offset: imm_i(word),
        },
        OPCODE_BRANCH => Insn::Branch {
            cond: match fn3 {
                0 => BranchCond::Eq,
                1 => BranchCond::Ne,
                4 => BranchCond::Lt,
                5 => BranchCond::Ge,
                6 => BranchCond::Ltu,
                7 => BranchCond::Geu,
                _ => return Err(Error::InsnInvalid),
            },
            rs1,
            rs2,
            offset: imm_b(word),
        },
        OPCODE_LOAD => {
            let (size, signed) = match fn3 {
                0 => (1, true),
                1 => (2, true),
                2 => (4, true),
                3 if rv64 => (8, true),
                4 => (1, false),
                5 => (2, false),
                6 if rv64 => (4, false),
                _ => return Err(Error::InsnInvalid),
            };
            Insn::Load {
                rd,
                rs1,
                offset: imm_i(word),
                size,
                signed,
            }
        }
        OPCODE_STORE => {
            let size = match fn3 {
                0 => 1,
                1 => 2,
                2 => 4,
                3 if rv64 => 8,
                _ => return Err(Error::InsnInvalid),
            };
            Insn::Store {
                rs1,
                rs2,
                offset: imm_s(word),
                size,
            }
        }
        OPCODE_OP_IMM => decode_op_imm(word, rd, rs1, fn3, rv64)?,
        OPCODE_OP_IMM_32 if rv64 => decode_op_imm_32(word, rd, rs1, fn3, fn7)?,
        OPCODE_OP => Insn::Op {
            op: decode_op(fn3, fn7, false)?,
            rd,
            rs1,
            rs2,
            word: false,
        },
        OPCODE_OP_32 if rv64 => Insn::Op {
            op: decode_op(fn3, fn7, true)?,
            rd,
            rs1,
            rs2,
            word: true,
        },
        OPCODE_MISC_MEM if fn3 <= 1 => Insn::Fence,
        OPCODE_SYSTEM => match word {
            WORD_ECALL => Insn::Ecall,
            WORD_EBREAK => Insn::Ebreak,
            WORD_WFI => Insn::Wfi,
            _ => return Err(Error::InsnInvalid),
        },
        _ => return Err(Error::InsnInvalid),
    };
    Ok(insn)
}

fn decode_op_imm(word: u32, rd: u8, rs1: u8, fn3: u32, rv64: bool) -> Result<Insn> {
    let imm = imm_i(word);
    let op = match fn3 {
        0 => AluOp::Add,
        2 => AluOp::Slt,
        3 => AluOp::Sltu,
        4 => AluOp::Xor,
        6 => AluOp::Or,
        7 => AluOp::And,
        1 | 5 => {
            // RV64 shifts take a 6-bit shamt, leaving six function bits.
            let (shamt, funct) = if rv64 {
                ((word >> 20) & 0x3F, word >> 26)
            } else {
                ((word >> 20) & 0x1F, word >> 25)
            };
            let arithmetic = if rv64 { 0x10 } else { 0x20 };
            let op = match (fn3, funct) {
                (1, 0) => AluOp::Sll,
                (5, 0) => AluOp::Srl,
                (5, f) if f == arithmetic => AluOp::Sra,
                _ => return Err(Error::InsnInvalid),
            };
            return Ok(Insn::OpImm {
                op,
                rd,
                rs1,
                imm: i64::from(shamt),
                word: false,
            });
        }
        _ => return Err(Error::InsnInvalid),
    };
    Ok(Insn::OpImm {
        op,
        rd,
        rs1,
        imm,
        word: false,
    })
}

fn decode_op_imm_32(word: u32, rd: u8, rs1: u8, fn3: u32, fn7: u32) -> Result<Insn> {
    let shamt = i64::from((word >> 20) & 0x1F);
    let (op, imm) = match (fn3, fn7) {
        (0, _) => (AluOp::Add, imm_i(word)),
        (1, 0) => (AluOp::Sll, shamt),
        (5, 0) => (AluOp::Srl, shamt),
        (5, 0x20) => (AluOp::Sra, shamt),
        _ => return Err(Error::InsnInvalid),
    };
    Ok(Insn::OpImm {
        op,
        rd,
        rs1,
        imm,
        word: true,
    })
}

fn decode_op(fn3: u32, fn7: u32, word: bool) -> Result<AluOp> {
    let op = match (fn7, fn3) {
        (0, 0) => AluOp::Add,
        (0x20, 0) => AluOp::Sub,
        (0, 1) => AluOp::Sll,
        (0, 5) => AluOp::Srl,
        (0x20, 5) => AluOp::Sra,
        (1, 0) => AluOp::Mul,
        (1, 4) => AluOp::Div,
        (1, 5) => AluOp::Divu,
        (1, 6) => AluOp::Rem,
        (1, 7) => AluOp::Remu,
        _ if word => return Err(Error::InsnInvalid),
        (0, 2) => AluOp::Slt,
        (0, 3) => AluOp::Sltu,
        (0, 4) => AluOp::Xor,
        (0, 6) => AluOp::Or,
        (0, 7) => AluOp::And,
        (1, 1) => AluOp::Mulh,
        (1, 2) => AluOp::Mulhsu,
        (1, 3) => AluOp::Mulhu,
        _ => return Err(Error::InsnInvalid),
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{decode, AluOp, BranchCond, Insn};
    use crate::arch::riscv::Xlen;
    use crate::Error;

    #[rstest]
    // addi a0, zero, 5
    #[case(0x0050_0513, Insn::OpImm { op: AluOp::Add, rd: 10, rs1: 0, imm: 5, word: false })]
    // addi a0, a0, -1
    #[case(0xFFF5_0513, Insn::OpImm { op: AluOp::Add, rd: 10, rs1: 10, imm: -1, word: false })]
    // lui t0, 0x12345
    #[case(0x1234_52B7, Insn::Lui { rd: 5, imm: 0x1234_5000 })]
    // sub a2, a0, a1
    #[case(0x40B5_0633, Insn::Op { op: AluOp::Sub, rd: 12, rs1: 10, rs2: 11, word: false })]
    // mul a0, a0, a1
    #[case(0x02B5_0533, Insn::Op { op: AluOp::Mul, rd: 10, rs1: 10, rs2: 11, word: false })]
    // sw a1, 8(sp)
    #[case(0x00B1_2423, Insn::Store { rs1: 2, rs2: 11, offset: 8, size: 4 })]
    // lbu a0, -4(a1)
    #[case(0xFFC5_C503, Insn::Load { rd: 10, rs1: 11, offset: -4, size: 1, signed: false })]
    // bne a0, zero, -8
    #[case(0xFE05_1CE3, Insn::Branch { cond: BranchCond::Ne, rs1: 10, rs2: 0, offset: -8 })]
    // jal ra, 16
    #[case(0x0100_00EF, Insn::Jal { rd: 1, offset: 16 })]
    // jalr zero, 0(ra)
    #[case(0x0000_8067, Insn::Jalr { rd: 0, rs1: 1, offset: 0 })]
    #[case(0x0000_0073, Insn::Ecall)]
    #[case(0x0010_0073, Insn::Ebreak)]
    #[case(0x1050_0073, Insn::Wfi)]
    #[case(0x0FF0_000F, Insn::Fence)]
    fn decodes_rv32_encodings(#[case] word: u32, #[case] expected: Insn) {
        assert_eq!(decode(word, Xlen::Rv32), Ok(expected));
    }

    #[test]
    fn srai_uses_width_specific_shamt() {
        // srai a0, a0, 3
        assert_eq!(
            decode(0x4035_5513, Xlen::Rv32),
            Ok(Insn::OpImm { op: AluOp::Sra, rd: 10, rs1: 10, imm: 3, word: false })
        );
        // srai a0, a0, 33 is only encodable on RV64
        assert_eq!(
            decode(0x4215_5513, Xlen::Rv64),
            Ok(Insn::OpImm { op: AluOp::Sra, rd: 10, rs1: 10, imm: 33, word: false })
        );
        assert_eq!(decode(0x4215_5513, Xlen::Rv32), Err(Error::InsnInvalid));
    }

    #[rstest]
    // ld a0, 0(a1)
    #[case(0x0005_B503)]
    // sd a0, 0(a1)
    #[case(0x00A5_B023)]
    // addiw a0, a0, 1
    #[case(0x0015_051B)]
    // subw a0, a0, a1
    #[case(0x40B5_053B)]
    fn rv64_only_encodings_are_invalid_on_rv32(#[case] word: u32) {
        assert!(decode(word, Xlen::Rv64).is_ok());
        assert_eq!(decode(word, Xlen::Rv32), Err(Error::InsnInvalid));
    }

    #[rstest]
    #[case(0x0000_0000)]
    #[case(0xFFFF_FFFF)]
    // csrrw zero, mstatus, a0
    #[case(0x3005_1073)]
    fn rejects_unsupported_words(#[case] word: u32) {
        assert_eq!(decode(word, Xlen::Rv64), Err(Error::InsnInvalid));
    }

    #[test]
    fn only_control_transfers_end_blocks() {
        assert!(Insn::Ecall.ends_block());
        assert!(Insn::Jal { rd: 0, offset: 0 }.ends_block());
        assert!(!Insn::Fence.ends_block());
        assert!(!Insn::Lui { rd: 1, imm: 0 }.ends_block());
    }
}
