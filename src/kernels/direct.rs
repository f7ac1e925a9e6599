//! Single-precision forward kernel.

use super::{chw::ChwEngine, KernelArgs};
use crate::params::{ConfigError, KernelConfig};

/// Output channels computed in parallel by [`conv_layer_direct()`].
pub const DIRECT_LANES: usize = 8;

/// Single-precision forward convolution over the channel-major tiled layout.
///
/// Processes one image (`config.images` must be 1) of group `group`; `image` selects
/// the image within the batch. Eight output channels are computed in parallel,
/// sharing each staged input window. Backward passes, fully-connected layers
/// and fused ReLU are not supported.
///
/// # Errors
///
/// Returns an error if the configuration is out of bounds for this kernel or if any
/// of the buffers is too short for the addressed region.
pub fn conv_layer_direct(
    args: KernelArgs<'_, f32>,
    config: &KernelConfig,
    group: usize,
    image: usize,
) -> Result<(), ConfigError> {
    config.validate_direct()?;
    ChwEngine::<f32, DIRECT_LANES>::new(args, config, group, image)?.run("conv_layer_direct");
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;
    use crate::buffers::{pack_filters, pack_tiled, unpack_tiled};

    #[test]
    fn box_filter_on_ramp() {
        let config = KernelConfig {
            in_channels: 1,
            out_channels: 1,
            burst_channels: 1,
            height: 5,
            width: 5,
            burst_rows: 5,
            ..KernelConfig::default()
        };
        let signal = Array4::from_shape_fn([1, 1, 5, 5], |(_, _, y, x)| (y * 5 + x) as f32);
        let filters = Array4::from_elem([1, 1, 3, 3], 1.0_f32);
        let input = pack_tiled::<f32>(signal.view(), config.tile_pad);
        let weights = pack_filters::<f32>(filters.view());
        let mut output = vec![[0.0; 16]; 5];

        let args = KernelArgs {
            input: &input,
            weights: &weights,
            bias: &[0.5],
            output: &mut output,
            activation_mask: None,
        };
        conv_layer_direct(args, &config, 0, 0).unwrap();
        let output = unpack_tiled(&output, [1, 1, 5, 5], config.tile_pad);
        // Zero-padded "same" convolution; the centre pixel sums 6..8, 11..13, 16..18.
        assert_eq!(output[[0, 0, 2, 2]], 108.5);
        assert_eq!(output[[0, 0, 0, 0]], 12.5);
        assert_eq!(output[[0, 0, 4, 4]], 18.0 + 19.0 + 23.0 + 24.0 + 0.5);
    }

    #[test]
    fn rejects_short_buffers() {
        let config = KernelConfig::default();
        let input = vec![[0.0; 16]; 16 * 16];
        let weights = vec![[0.0; 16]; 16 * 16];
        let mut output = vec![[1.0; 16]; 16 * 16 - 1];
        let args = KernelArgs {
            input: &input,
            weights: &weights,
            bias: &[0.0; 16],
            output: &mut output,
            activation_mask: None,
        };
        let err = conv_layer_direct(args, &config, 0, 0).unwrap_err();
        assert!(matches!(err, ConfigError::BufferLength { buffer: "output", .. }));
        assert!(output.iter().flatten().all(|&x| x == 1.0));
    }
}
