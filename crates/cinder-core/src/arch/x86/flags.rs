//! EFLAGS bits and the arithmetic flag computations.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

use super::decode::Size;

/// Carry flag.
pub const CF: u32 = 1 << 0;
/// Reserved bit that always reads as one.
pub const RESERVED_ONE: u32 = 1 << 1;
/// Parity flag (even parity of the low result byte).
pub const PF: u32 = 1 << 2;
/// Auxiliary carry out of bit 3.
pub const AF: u32 = 1 << 4;
/// Zero flag.
pub const ZF: u32 = 1 << 6;
/// Sign flag.
pub const SF: u32 = 1 << 7;
/// Overflow flag.
pub const OF: u32 = 1 << 11;
/// Status flags written by arithmetic instructions.
pub const STATUS_MASK: u32 = CF | PF | AF | ZF | SF | OF;
/// Value of `EFLAGS` after reset.
pub const EFLAGS_RESET: u32 = RESERVED_ONE;

/// Result of an arithmetic operation together with its status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagsResult {
    /// Result truncated to the operand size.
    pub value: u32,
    /// Status flag bits (subset of [`STATUS_MASK`]).
    pub flags: u32,
}

const fn result_flags(value: u32, size: Size) -> u32 {
    let mut flags = 0;
    if value & size.mask() == 0 {
        flags |= ZF;
    }
    if value & size.sign_bit() != 0 {
        flags |= SF;
    }
    if (value as u8).count_ones() % 2 == 0 {
        flags |= PF;
    }
    flags
}

/// `a + b + carry_in`.
#[must_use]
pub fn add(size: Size, a: u32, b: u32, carry_in: bool) -> FlagsResult {
    let mask = size.mask();
    let (a, b) = (a & mask, b & mask);
    let wide = u64::from(a) + u64::from(b) + u64::from(carry_in);
    let value = (wide as u32) & mask;
    let mut flags = result_flags(value, size);
    if wide > u64::from(mask) {
        flags |= CF;
    }
    if (a ^ b ^ value) & 0x10 != 0 {
        flags |= AF;
    }
    if (a ^ value) & (b ^ value) & size.sign_bit() != 0 {
        flags |= OF;
    }
    FlagsResult { value, flags }
}

/// `a - b - borrow_in`.
#[must_use]
pub fn sub(size: Size, a: u32, b: u32, borrow_in: bool) -> FlagsResult {
    let mask = size.mask();
    let (a, b) = (a & mask, b & mask);
    let subtrahend = u64::from(b) + u64::from(borrow_in);
    let value = (u64::from(a).wrapping_sub(subtrahend) as u32) & mask;
    let mut flags = result_flags(value, size);
    if subtrahend > u64::from(a) {
        flags |= CF;
    }
    if (a ^ b ^ value) & 0x10 != 0 {
        flags |= AF;
    }
    if (a ^ b) & (a ^ value) & size.sign_bit() != 0 {
        flags |= OF;
    }
    FlagsResult { value, flags }
}

/// Bitwise result: clears CF, OF and AF.
#[must_use]
pub const fn logic(size: Size, value: u32) -> FlagsResult {
    let value = value & size.mask();
    FlagsResult {
        value,
        flags: result_flags(value, size),
    }
}

/// Evaluates a `Jcc` condition code against `eflags`.
#[must_use]
pub const fn condition(cond: u8, eflags: u32) -> bool {
    let cf = eflags & CF != 0;
    let zf = eflags & ZF != 0;
    let sf = eflags & SF != 0;
    let of = eflags & OF != 0;
    let pf = eflags & PF != 0;
    let base = match cond >> 1 {
        0 => of,
        1 => cf,
        2 => zf,
        3 => cf || zf,
        4 => sf,
        5 => pf,
        6 => sf != of,
        _ => zf || sf != of,
    };
    // Odd condition codes negate their even partner.
    base != (cond & 1 != 0)
}
