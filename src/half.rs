//! Reduced-precision scalar used by the half-precision kernels.

use half::f16;
use lazy_static::lazy_static;

use std::{cmp::Ordering, fmt, ops};

lazy_static! {
    /// Decoding table for all 2^16 bit patterns.
    static ref DECODE_TABLE: Vec<f32> = (0..=u16::MAX)
        .map(|bits| f16::from_bits(bits).to_f32())
        .collect();
}

/// IEEE 754 binary16 scalar with the arithmetic of the hardware adders and multipliers.
///
/// Every addition and multiplication is computed exactly and then rounded once
/// to the nearest representable value (ties to even). Since the product of two
/// binary16 values has at most 22 significant bits, an `f64` intermediate
/// is exact for both operations.
///
/// Equality follows IEEE semantics; in particular, `-0 == +0`, which is what
/// the activation mask relies on.
#[derive(Clone, Copy, Default, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Half(f16);

impl Half {
    /// Positive zero.
    pub const ZERO: Self = Self(f16::ZERO);
    /// One.
    pub const ONE: Self = Self(f16::ONE);
    /// Most negative finite value (`-65504`). Used to seed max-reductions
    /// over window positions that fall outside of the signal.
    pub const POOL_SENTINEL: Self = Self(f16::MIN);

    /// Rounds an `f32` value to the nearest representable half-precision value.
    pub fn from_f32(value: f32) -> Self {
        Self(f16::from_f32(value))
    }

    /// Widens the value to `f32`. This conversion is exact.
    pub fn to_f32(self) -> f32 {
        DECODE_TABLE[usize::from(self.0.to_bits())]
    }

    /// Creates a value from its binary16 bit pattern.
    pub fn from_bits(bits: u16) -> Self {
        Self(f16::from_bits(bits))
    }

    /// Returns the binary16 bit pattern of the value.
    pub fn to_bits(self) -> u16 {
        self.0.to_bits()
    }

    /// Checks whether the value is zero of either sign.
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    /// Returns `max(0, self)`. Negative values (including `-0`) map to positive zero.
    pub fn relu(self) -> Self {
        if self > Self::ZERO {
            self
        } else {
            Self::ZERO
        }
    }

    fn to_f64(self) -> f64 {
        f64::from(self.to_f32())
    }

    fn round_f64(value: f64) -> Self {
        Self(f16::from_f64(value))
    }
}

impl From<f32> for Half {
    fn from(value: f32) -> Self {
        Self::from_f32(value)
    }
}

impl From<Half> for f32 {
    fn from(value: Half) -> Self {
        value.to_f32()
    }
}

impl From<f16> for Half {
    fn from(value: f16) -> Self {
        Self(value)
    }
}

impl ops::Add for Half {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::round_f64(self.to_f64() + rhs.to_f64())
    }
}

impl ops::AddAssign for Half {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl ops::Mul for Half {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self::round_f64(self.to_f64() * rhs.to_f64())
    }
}

impl ops::Neg for Half {
    type Output = Self;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl fmt::Debug for Half {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_f32(), formatter)
    }
}

impl fmt::Display for Half {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_f32(), formatter)
    }
}

/// Maximum used by the pooling trees. The left operand wins ties.
pub(crate) fn max_with_index(left: (Half, u8), right: (Half, u8)) -> (Half, u8) {
    match right.0.partial_cmp(&left.0) {
        Some(Ordering::Greater) => right,
        _ => left,
    }
}
