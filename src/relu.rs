//! ReLU fused into the kernels, together with the activation masks it produces.
//!
//! The channel-major kernels store one byte per element (`0` or `1`); the HWCN kernel
//! stores one bit per image in a 16-bit word per vector unit.

use crate::{buffers::Lanes, KernelElement};

/// Clamps the tile in place and records which elements stayed non-zero.
pub(crate) fn relu_forward<T: KernelElement>(tile: &mut [Lanes<T>], mask: &mut [Lanes<u8>]) {
    for (unit, flags) in tile.iter_mut().zip(mask) {
        for (value, flag) in unit.iter_mut().zip(flags) {
            *value = value.relu();
            *flag = u8::from(!value.is_zero());
        }
    }
}

/// Zeroes tile elements whose activation was clamped in the forward pass.
pub(crate) fn relu_backward<T: KernelElement>(tile: &mut [Lanes<T>], mask: &[Lanes<u8>]) {
    for (unit, flags) in tile.iter_mut().zip(mask) {
        for (value, &flag) in unit.iter_mut().zip(flags) {
            if flag == 0 {
                *value = T::ZERO;
            }
        }
    }
}

/// Clamps a vector unit and returns its bit mask.
pub(crate) fn relu_forward_bits<T: KernelElement>(unit: &mut Lanes<T>) -> u16 {
    let mut bits = 0;
    for (lane, value) in unit.iter_mut().enumerate() {
        *value = value.relu();
        if !value.is_zero() {
            bits |= 1 << lane;
        }
    }
    bits
}

/// Zeroes the lanes of a vector unit whose mask bits are cleared.
pub(crate) fn relu_backward_bits<T: KernelElement>(unit: &mut Lanes<T>, bits: u16) {
    for (lane, value) in unit.iter_mut().enumerate() {
        if bits & (1 << lane) == 0 {
            *value = T::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffers::splat, Half};

    #[test]
    fn byte_mask_round_trip() {
        let mut tile = vec![splat(Half::from_f32(-1.0)), splat(Half::from_f32(0.5))];
        tile[0][3] = Half::from_f32(2.0);
        tile[1][4] = -Half::ZERO;
        let mut mask = vec![[0_u8; 16]; 2];
        relu_forward(&mut tile, &mut mask);

        assert_eq!(tile[0][0], Half::ZERO);
        assert_eq!(tile[0][3].to_f32(), 2.0);
        assert_eq!(mask[0][3], 1);
        assert_eq!(mask[0][2], 0);
        assert_eq!(mask[1][4], 0);
        assert_eq!(mask[1][5], 1);

        let mut gradient = vec![splat(Half::ONE); 2];
        relu_backward(&mut gradient, &mask);
        assert_eq!(gradient[0][0], Half::ZERO);
        assert_eq!(gradient[0][3], Half::ONE);
        assert_eq!(gradient[1][4], Half::ZERO);
    }

    #[test]
    fn bit_mask_round_trip() {
        let mut unit = splat(-1.0_f32);
        unit[0] = 1.0;
        unit[15] = 3.0;
        let bits = relu_forward_bits(&mut unit);
        assert_eq!(bits, 0x8001);
        assert_eq!(unit[1], 0.0);

        let mut gradient = splat(1.0_f32);
        relu_backward_bits(&mut gradient, bits);
        assert_eq!(gradient[0], 1.0);
        assert_eq!(gradient[7], 0.0);
        assert_eq!(gradient[15], 1.0);
    }
}
