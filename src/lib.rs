//! Host-side model of tiled FPGA kernels for convolutional neural networks.
//!
//! The kernels modeled by this crate compute [convolutions] in the context of
//! [deep learning], with ReLU activation optionally fused into the layer. Each kernel
//! invocation streams its operands through small on-chip tiles, multiplies 16 lanes
//! at a time using fixed reduction trees, and writes the results back to flat external
//! buffers. This crate reproduces that dataflow on the CPU, including the rounding behavior
//! of the half-precision arithmetic, so that the results of the hardware can be checked
//! and training workloads can be prototyped before synthesis.
//!
//! # Features
//!
//! - [`cr_layer_fb_half`](kernels::cr_layer_fb_half): half-precision convolutions with 1x1,
//!   3x3 or 5x5 filters over a channel-major tiled layout, and fully-connected layers.
//!   Supports the forward pass and both backward passes (w.r.t. weights and w.r.t. inputs).
//! - [`conv_layer_direct`](kernels::conv_layer_direct): single-precision forward convolution
//!   over the same layout.
//! - [`cr_layer_hwcn_half`](kernels::cr_layer_hwcn_half): half-precision convolutions
//!   with arbitrary strides and padding over the HWCN layout, with images packed
//!   into lanes.
//! - [`pool_layer_hwcn_half`](kernels::pool_layer_hwcn_half): 2x2 or 3x3 max-pooling
//!   with stride 2 over the HWCN layout.
//!
//! Grouped convolutions are supported by all convolution kernels. Kernels are exposed both
//! at the level of a single invocation over packed [`buffers`], and via layers
//! ([`Convolution`], [`FullyConnected`], [`HwcnConvolution`], [`MaxPool`]) that pack
//! `ndarray` tensors, dispatch invocations and unpack the results.
//!
//! # Implementation details
//!
//! All configuration and buffer checks are performed before a kernel writes anything;
//! a failing invocation leaves its outputs untouched. Activation masks recorded by forward
//! passes are returned as a part of [`ForwardPass`] and must be borrowed by the backward
//! passes that read them.
//!
//! [convolutions]: https://en.wikipedia.org/wiki/Convolution
//! [deep learning]: https://en.wikipedia.org/wiki/Deep_learning
//!
//! # Examples
//!
//! ```
//! use ndarray::Array4;
//! use rand::{Rng, thread_rng};
//! use fpga_convolution::{Convolution, FeatureMap, KernelConfig};
//!
//! # fn main() -> Result<(), fpga_convolution::ConfigError> {
//! // 3x3 convolution of 8x8 maps with 3 input channels and 4 output channels,
//! // followed by ReLU.
//! let config = KernelConfig {
//!     relu: true,
//!     ..KernelConfig::conv(3, 4, 8, 8, 3)
//! };
//! let convolution = Convolution::new(config)?;
//!
//! let mut rng = thread_rng();
//! let signal = Array4::from_shape_fn([2, 8, 8, 3], |_| rng.gen_range(-1.0..1.0));
//! let filters = Array4::from_shape_fn([4, 3, 3, 3], |_| rng.gen_range(-1.0..1.0));
//! // The output layout is the same as in the signal ("channels-last" in this case).
//! let pass = convolution.forward(FeatureMap::nhwc(&signal), filters.view(), &[0.0; 4])?;
//! assert_eq!(pass.output().shape(), [2, 8, 8, 4]);
//! assert!(pass.output().iter().all(|&x| x >= 0.0));
//! # Ok(())
//! # }
//! ```

#![doc(html_root_url = "https://docs.rs/fpga-convolution/0.1.0")]
#![deny(missing_docs, missing_debug_implementations)]

use std::{
    fmt,
    ops::{Add, AddAssign, Mul},
};

mod base;
pub mod buffers;
mod half;
pub mod kernels;
mod layers;
mod mac;
mod params;
mod relu;
mod schedule;
mod staging;
mod tile;

pub use crate::{
    base::{Completion, Dispatcher, ForwardPass, Invocation, MaskKey, MaskLayout},
    buffers::{FeatureMap, FeatureMapShape, Lanes, Layout},
    half::Half,
    kernels::KernelArgs,
    layers::{Convolution, DirectConvolution, FullyConnected, HwcnConvolution, MaxPool},
    params::{
        output_extent, ConfigError, HwcnConfig, KernelConfig, Mode, PoolConfig, BIAS_CAPACITY,
        DIRECT_INPUT_TILE_UNITS, HWCN_INPUT_TILE_UNITS, HWCN_LANE_TILE_UNITS, INPUT_TILE_UNITS,
        LANE_TILE_UNITS, POOL_TILE_UNITS, VEC_WIDTH,
    },
};

/// Scalar types processed by the kernels.
pub trait KernelElement:
    Copy
    + Default
    + PartialEq
    + PartialOrd
    + fmt::Debug
    + Add<Output = Self>
    + Mul<Output = Self>
    + AddAssign
    + Send
    + Sync
    + 'static
{
    /// Additive identity.
    const ZERO: Self;

    /// Converts an `f32` value, rounding if necessary.
    fn from_f32(value: f32) -> Self;

    /// Converts the value to `f32`.
    fn to_f32(self) -> f32;

    /// Returns `max(0, self)`.
    fn relu(self) -> Self;

    /// Checks whether the value is zero.
    fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl KernelElement for f32 {
    const ZERO: Self = 0.0;

    fn from_f32(value: f32) -> Self {
        value
    }

    fn to_f32(self) -> f32 {
        self
    }

    fn relu(self) -> Self {
        if self > 0.0 {
            self
        } else {
            0.0
        }
    }
}

impl KernelElement for Half {
    const ZERO: Self = Half::ZERO;

    fn from_f32(value: f32) -> Self {
        Half::from_f32(value)
    }

    fn to_f32(self) -> f32 {
        Half::to_f32(self)
    }

    fn relu(self) -> Self {
        Half::relu(self)
    }

    fn is_zero(self) -> bool {
        Half::is_zero(self)
    }
}
