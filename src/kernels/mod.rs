//! Kernel entry points.
//!
//! Each entry point models a single invocation of a hardware kernel: it processes one
//! group and one block of images, reading and writing flat buffers of [`Lanes`] units.
//! Buffers and configuration are checked before anything is written; on error,
//! the outputs are left untouched.

use crate::buffers::Lanes;

mod chw;
mod direct;
mod fb_half;
mod hwcn;
mod pool;

pub use self::{
    direct::{conv_layer_direct, DIRECT_LANES},
    fb_half::cr_layer_fb_half,
    hwcn::cr_layer_hwcn_half,
    pool::{pool_layer_hwcn_half, PoolArgs},
};

/// External buffers of a kernel invocation.
///
/// The roles of `input`, `weights` and `output` depend on the [`Mode`](crate::Mode):
///
/// | Mode | `input` | `weights` | `output` |
/// |------|---------|-----------|----------|
/// | `Forward` | activations | filters | activations (overwritten) |
/// | `BackwardWeights` | activations | output gradients | filter gradients (accumulated) |
/// | `BackwardInput` | output gradients | flipped filters | input gradients (overwritten) |
///
/// `activation_mask` is written by the forward pass and read by the backward passes
/// when ReLU is fused into the layer; it may be `None` otherwise.
#[derive(Debug)]
pub struct KernelArgs<'a, T, M = Lanes<u8>> {
    /// Streamed input tensor.
    pub input: &'a [Lanes<T>],
    /// Weight-role tensor.
    pub weights: &'a [Lanes<T>],
    /// Per-output-channel biases (read in the forward pass only).
    pub bias: &'a [T],
    /// Output tensor.
    pub output: &'a mut [Lanes<T>],
    /// Activation mask.
    pub activation_mask: Option<&'a mut [M]>,
}
