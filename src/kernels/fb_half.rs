//! Half-precision forward / backward kernel over the channel-major tiled layout.

use super::{chw::ChwEngine, KernelArgs};
use crate::{
    buffers::Lanes,
    params::{ConfigError, KernelConfig},
    Half,
};

/// Half-precision convolution or fully-connected layer, forward or backward.
///
/// Processes `config.images` images of the `image_block`-th block for group `group`.
/// One output channel is computed at a time.
///
/// - [`Mode::Forward`](crate::Mode::Forward) seeds outputs with the bias, accumulates
///   over all read passes and, if `config.relu` is set, clamps the result and writes
///   the activation mask.
/// - [`Mode::BackwardWeights`](crate::Mode::BackwardWeights) correlates activations with
///   output gradients (passed as `weights`) and adds the result to the filter gradients
///   in `output`, which must be zero-initialized before the first invocation of a batch.
/// - [`Mode::BackwardInput`](crate::Mode::BackwardInput) convolves output gradients
///   (passed as `input`) with flipped filters.
///
/// In both backward modes with `config.relu` set, the `input` buffer is gated with
/// the activation mask.
///
/// # Errors
///
/// Returns an error if the configuration is out of bounds, if any of the buffers is too
/// short for the addressed region, or if the mask is missing while ReLU is fused.
pub fn cr_layer_fb_half(
    args: KernelArgs<'_, Half, Lanes<u8>>,
    config: &KernelConfig,
    group: usize,
    image_block: usize,
) -> Result<(), ConfigError> {
    config.validate_half()?;
    ChwEngine::<Half, 1>::new(args, config, group, image_block)?.run("cr_layer_fb_half");
    Ok(())
}
