//! Integer ALU for both register widths.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

use super::decode::AluOp;

/// Evaluates `op` on 32-bit operands (RV32, and the RV64 `*W` forms).
#[must_use]
pub fn alu32(op: AluOp, a: u32, b: u32) -> u32 {
    let (sa, sb) = (a as i32, b as i32);
    let shamt = b & 0x1F;
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a << shamt,
        AluOp::Slt => u32::from(sa < sb),
        AluOp::Sltu => u32::from(a < b),
        AluOp::Xor => a ^ b,
        AluOp::Srl => a >> shamt,
        AluOp::Sra => (sa >> shamt) as u32,
        AluOp::Or => a | b,
        AluOp::And => a & b,
        AluOp::Mul => a.wrapping_mul(b),
        AluOp::Mulh => ((i64::from(sa) * i64::from(sb)) >> 32) as u32,
        AluOp::Mulhsu => ((i64::from(sa) * i64::from(b)) >> 32) as u32,
        AluOp::Mulhu => ((u64::from(a) * u64::from(b)) >> 32) as u32,
        AluOp::Div if b == 0 => u32::MAX,
        AluOp::Div => sa.wrapping_div(sb) as u32,
        AluOp::Divu if b == 0 => u32::MAX,
        AluOp::Divu => a / b,
        AluOp::Rem if b == 0 => a,
        AluOp::Rem => sa.wrapping_rem(sb) as u32,
        AluOp::Remu if b == 0 => a,
        AluOp::Remu => a % b,
    }
}

/// Evaluates `op` on 64-bit operands (RV64).
#[must_use]
pub fn alu64(op: AluOp, a: u64, b: u64) -> u64 {
    let (sa, sb) = (a as i64, b as i64);
    let shamt = (b & 0x3F) as u32;
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a << shamt,
        AluOp::Slt => u64::from(sa < sb),
        AluOp::Sltu => u64::from(a < b),
        AluOp::Xor => a ^ b,
        AluOp::Srl => a >> shamt,
        AluOp::Sra => (sa >> shamt) as u64,
        AluOp::Or => a | b,
        AluOp::And => a & b,
        AluOp::Mul => a.wrapping_mul(b),
        AluOp::Mulh => ((i128::from(sa) * i128::from(sb)) >> 64) as u64,
        AluOp::Mulhsu => ((i128::from(sa) * i128::from(b)) >> 64) as u64,
        AluOp::Mulhu => ((u128::from(a) * u128::from(b)) >> 64) as u64,
        AluOp::Div if b == 0 => u64::MAX,
        AluOp::Div => sa.wrapping_div(sb) as u64,
        AluOp::Divu if b == 0 => u64::MAX,
        AluOp::Divu => a / b,
        AluOp::Rem if b == 0 => a,
        AluOp::Rem => sa.wrapping_rem(sb) as u64,
        AluOp::Remu if b == 0 => a,
        AluOp::Remu => a % b,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::{alu32, alu64};
    use crate::arch::riscv::decode::AluOp;

    #[rstest]
    #[case(AluOp::Div, 7, 0, u32::MAX)]
    #[case(AluOp::Divu, 7, 0, u32::MAX)]
    #[case(AluOp::Rem, 7, 0, 7)]
    #[case(AluOp::Remu, 7, 0, 7)]
    #[case(AluOp::Div, 0x8000_0000, u32::MAX, 0x8000_0000)]
    #[case(AluOp::Rem, 0x8000_0000, u32::MAX, 0)]
    #[case(AluOp::Div, (-7_i32) as u32, 2, (-3_i32) as u32)]
    #[case(AluOp::Rem, (-7_i32) as u32, 2, (-1_i32) as u32)]
    fn division_edge_cases_follow_the_isa(
        #[case] op: AluOp,
        #[case] a: u32,
        #[case] b: u32,
        #[case] expected: u32,
    ) {
        assert_eq!(alu32(op, a, b), expected);
    }

    #[rstest]
    #[case(AluOp::Mulh, u32::MAX, u32::MAX, 0)]
    #[case(AluOp::Mulhu, u32::MAX, u32::MAX, 0xFFFF_FFFE)]
    #[case(AluOp::Mulhsu, u32::MAX, u32::MAX, u32::MAX)]
    #[case(AluOp::Sra, 0x8000_0000, 4, 0xF800_0000)]
    #[case(AluOp::Srl, 0x8000_0000, 36, 0x0800_0000)]
    #[case(AluOp::Slt, u32::MAX, 0, 1)]
    #[case(AluOp::Sltu, u32::MAX, 0, 0)]
    fn high_multiply_and_shift_semantics(
        #[case] op: AluOp,
        #[case] a: u32,
        #[case] b: u32,
        #[case] expected: u32,
    ) {
        assert_eq!(alu32(op, a, b), expected);
    }

    #[test]
    fn rv64_signed_overflow_division_is_defined() {
        let min = i64::MIN as u64;
        assert_eq!(alu64(AluOp::Div, min, u64::MAX), min);
        assert_eq!(alu64(AluOp::Rem, min, u64::MAX), 0);
        assert_eq!(alu64(AluOp::Mulhu, u64::MAX, 2), 1);
        assert_eq!(alu64(AluOp::Sll, 1, 63), 1 << 63);
    }

    proptest! {
        #[test]
        fn low_word_of_wide_ops_matches_narrow_ops(a in any::<u32>(), b in any::<u32>()) {
            for op in [AluOp::Add, AluOp::Sub, AluOp::Xor, AluOp::Or, AluOp::And, AluOp::Mul] {
                let wide = alu64(op, u64::from(a), u64::from(b)) as u32;
                prop_assert_eq!(wide, alu32(op, a, b));
            }
        }
    }
}
