//! Multiply-accumulate stage: lane products and the fixed-shape adder trees.
//!
//! The order of additions is part of the kernel contract, since reduced-precision
//! addition is not associative. All trees below are evaluated exactly as the hardware
//! evaluates them.

use crate::{
    buffers::{zero_lanes, Lanes},
    params::VEC_WIDTH,
    staging::{Window, TAPS},
    KernelElement,
};

/// Forward reduction: `(x0 * w0 + x1 * w1) + x2 * w2` per lane.
pub(crate) fn window_products<T: KernelElement>(window: &Window<T>, taps: [T; TAPS]) -> Lanes<T> {
    let mut sums = zero_lanes();
    for (sum, inputs) in sums.iter_mut().zip(window) {
        *sum = (inputs[0] * taps[0] + inputs[1] * taps[1]) + inputs[2] * taps[2];
    }
    sums
}

/// Pairwise tree over 16 lanes: 16 -> 8 -> 4 -> 2 -> 1, adjacent lanes first.
pub(crate) fn pairwise_sum<T: KernelElement>(values: &Lanes<T>) -> T {
    let mut level = *values;
    let mut len = VEC_WIDTH;
    while len > 1 {
        len /= 2;
        for i in 0..len {
            level[i] = level[2 * i] + level[2 * i + 1];
        }
    }
    level[0]
}

/// Weight-gradient reduction: for each tap, the pairwise sum over lanes of
/// `window[lane][tap] * gradient[lane]`.
pub(crate) fn tap_sums<T: KernelElement>(window: &Window<T>, gradient: &Lanes<T>) -> [T; TAPS] {
    let mut sums = [T::ZERO; TAPS];
    for (tap, sum) in sums.iter_mut().enumerate() {
        let mut products = zero_lanes();
        for (lane, product) in products.iter_mut().enumerate() {
            *product = window[lane][tap] * gradient[lane];
        }
        *sum = pairwise_sum(&products);
    }
    sums
}

/// Reduction over the 4 channel sub-lanes of the HWCN kernel: `(m0 + m1) + (m2 + m3)`.
pub(crate) fn sublane_sum<T: KernelElement>(products: &[Lanes<T>; 4]) -> Lanes<T> {
    let mut sums = zero_lanes();
    for (lane, sum) in sums.iter_mut().enumerate() {
        *sum = (products[0][lane] + products[1][lane]) + (products[2][lane] + products[3][lane]);
    }
    sums
}

/// Lane-wise `acc += values`.
pub(crate) fn accumulate<T: KernelElement>(acc: &mut Lanes<T>, values: &Lanes<T>) {
    for (acc, &value) in acc.iter_mut().zip(values) {
        *acc += value;
    }
}

/// Accumulate-enable: partial sums are committed only on the last sub-step of each
/// group of `period` sub-steps.
pub(crate) fn accumulate_enabled(sub_step: usize, period: usize) -> bool {
    sub_step + 1 == period
}

/// 16-lane register collecting partial sums until they are committed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StagingRegister<T> {
    lanes: Lanes<T>,
}

impl<T: KernelElement> StagingRegister<T> {
    pub fn new() -> Self {
        Self {
            lanes: zero_lanes(),
        }
    }

    pub fn park(&mut self, start: usize, values: &[T]) {
        self.lanes[start..start + values.len()].copy_from_slice(values);
    }

    pub fn lanes(&self) -> &Lanes<T> {
        &self.lanes
    }

    /// Returns the register contents rearranged into the packed filter layout.
    ///
    /// Row taps are parked at lanes `3 * row_tap..3 * row_tap + 3`. For 1x1 filters, only
    /// the centre tap is meaningful, and it is moved to lane 0. For the second unit of
    /// a 5x5 filter, the third tap of each row falls outside of the filter and is dropped.
    pub fn packed(&self, kernel_size: usize, second_unit: bool) -> Lanes<T> {
        let mut packed = self.lanes;
        match kernel_size {
            1 => {
                packed = zero_lanes();
                packed[0] = self.lanes[1];
            }
            3 => packed[TAPS * 3..].iter_mut().for_each(|x| *x = T::ZERO),
            5 if second_unit => {
                for row in 0..5 {
                    packed[row * TAPS + 2] = T::ZERO;
                }
                packed[15] = T::ZERO;
            }
            _ => packed[15] = T::ZERO,
        }
        packed
    }
}
