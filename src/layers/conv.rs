//! Convolutions over the channel-major tiled layout.

use log::{debug, warn};
use ndarray::{Array4, ArrayView4};

use super::{check_shape, image_blocks, to_half};
use crate::{
    base::{Dispatcher, ForwardPass, MaskKey, MaskLayout},
    buffers::{
        flip_filters, from_nchw, pack_filters, pack_tiled, unpack_filters, unpack_tiled,
        zero_lanes, FeatureMap,
    },
    kernels::{conv_layer_direct, cr_layer_fb_half, KernelArgs},
    params::{ConfigError, KernelConfig, Mode, VEC_WIDTH},
    Half,
};

/// Half-precision "same" convolution (stride 1, zero padding of `kernel_size / 2`)
/// with optional fused ReLU, computed by [`cr_layer_fb_half()`].
///
/// # Examples
///
/// ```
/// use ndarray::Array4;
/// use fpga_convolution::{Convolution, FeatureMap, KernelConfig};
///
/// # fn main() -> Result<(), fpga_convolution::ConfigError> {
/// let config = KernelConfig {
///     relu: true,
///     ..KernelConfig::conv(4, 2, 8, 8, 3)
/// };
/// let conv = Convolution::new(config)?;
/// let signal = Array4::from_elem([1, 4, 8, 8], 0.5_f32);
/// let filters = Array4::from_elem([2, 4, 3, 3], 0.25_f32);
/// let pass = conv.forward(FeatureMap::nchw(&signal), filters.view(), &[0.0, -10.0])?;
/// // The second channel is clamped by ReLU.
/// assert_eq!(pass.output()[[0, 0, 4, 4]], 4.5);
/// assert_eq!(pass.output()[[0, 1, 4, 4]], 0.0);
///
/// // Gradients are gated with the activation mask recorded by the forward pass.
/// let gradient = Array4::from_elem([1, 2, 8, 8], 1.0_f32);
/// let input_gradient = conv.input_gradient(
///     FeatureMap::nchw(&gradient),
///     filters.view(),
///     Some(&pass),
/// )?;
/// assert_eq!(input_gradient[[0, 0, 4, 4]], 2.25);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Convolution {
    config: KernelConfig,
}

impl Convolution {
    /// Creates a convolution with the specified configuration. `config.images` sets
    /// the number of images processed per kernel invocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or describes a fully-connected layer.
    pub fn new(config: KernelConfig) -> Result<Self, ConfigError> {
        if config.fully_connected {
            return Err(ConfigError::Unsupported {
                kernel: "fb_half convolution",
                feature: "fully-connected layers",
            });
        }
        let config = KernelConfig {
            mode: Mode::Forward,
            ..config
        };
        config.validate_half()?;
        Ok(Self { config })
    }

    /// Gets the forward configuration of this convolution.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn activation_shape(&self, batch_size: usize) -> [usize; 4] {
        let config = &self.config;
        [batch_size, config.total_in_channels(), config.height, config.width]
    }

    fn output_shape(&self, batch_size: usize) -> [usize; 4] {
        let config = &self.config;
        [batch_size, config.total_out_channels(), config.height, config.width]
    }

    fn filter_shape(&self) -> [usize; 4] {
        let config = &self.config;
        let size = config.kernel_size;
        [config.total_out_channels(), config.in_channels, size, size]
    }

    fn mask_key(&self, shape: [usize; 4]) -> MaskKey {
        MaskKey {
            layout: MaskLayout::Tiled {
                tile_pad: self.config.tile_pad,
            },
            shape,
        }
    }

    /// Computes the forward pass. `filters` have `[out * groups, in, k, k]` shape,
    /// and `bias` contains a value per output channel across all groups.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration.
    pub fn forward(
        &self,
        signal: FeatureMap<'_>,
        filters: ArrayView4<'_, f32>,
        bias: &[f32],
    ) -> Result<ForwardPass, ConfigError> {
        let config = self.config;
        let batch_size = signal.shape().batch_size;
        let image_blocks = image_blocks(batch_size, config.images)?;
        check_shape("signal", &self.activation_shape(batch_size), &signal.shape().as_nchw())?;
        check_shape("filters", &self.filter_shape(), filters.shape())?;
        check_shape("bias", &[config.total_out_channels()], &[bias.len()])?;

        let input = pack_tiled::<Half>(signal.to_nchw(), config.tile_pad);
        let weights = pack_filters::<Half>(filters);
        let bias = to_half(bias);
        let mut output = vec![zero_lanes::<Half>(); config.output_units(image_blocks)];
        let mut mask = if config.relu {
            Some(vec![[0_u8; VEC_WIDTH]; output.len()])
        } else {
            None
        };

        let completion = Dispatcher::new(image_blocks, config.groups).dispatch(|invocation| {
            let args = KernelArgs {
                input: &input,
                weights: &weights,
                bias: &bias,
                output: &mut output,
                activation_mask: mask.as_deref_mut(),
            };
            cr_layer_fb_half(args, &config, invocation.group, invocation.image_block)
        })?;
        debug!("convolution forward pass: {} invocations", completion.invocations());

        let shape = self.output_shape(batch_size);
        let output = from_nchw(unpack_tiled(&output, shape, config.tile_pad), signal.layout());
        Ok(ForwardPass::new(output, mask, self.mask_key(shape)))
    }

    /// Computes the gradient w.r.t. filters. If `activation_mask` is specified, activations
    /// are gated with its mask; the pass must have produced `activations`.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration, or the mask
    /// was recorded for a different tensor.
    pub fn weight_gradient(
        &self,
        activations: FeatureMap<'_>,
        output_gradient: FeatureMap<'_>,
        activation_mask: Option<&ForwardPass>,
    ) -> Result<Array4<f32>, ConfigError> {
        let batch_size = activations.shape().batch_size;
        let activation_shape = self.activation_shape(batch_size);
        check_shape("activations", &activation_shape, &activations.shape().as_nchw())?;
        check_shape(
            "output gradient",
            &self.output_shape(batch_size),
            &output_gradient.shape().as_nchw(),
        )?;
        let config = KernelConfig {
            mode: Mode::BackwardWeights,
            relu: activation_mask.is_some(),
            ..self.config
        };
        let image_blocks = image_blocks(batch_size, config.images)?;
        let mut mask = activation_mask
            .map(|pass| pass.checked_mask(&self.mask_key(activation_shape)))
            .transpose()?;

        let input = pack_tiled::<Half>(activations.to_nchw(), config.tile_pad);
        let weights = pack_tiled::<Half>(output_gradient.to_nchw(), config.tile_pad);
        let mut output = vec![zero_lanes::<Half>(); config.filter_units()];
        let completion = Dispatcher::new(image_blocks, config.groups).dispatch(|invocation| {
            let args = KernelArgs {
                input: &input,
                weights: &weights,
                bias: &[],
                output: &mut output,
                activation_mask: mask.as_deref_mut(),
            };
            cr_layer_fb_half(args, &config, invocation.group, invocation.image_block)
        })?;
        debug!("convolution weight gradient: {} invocations", completion.invocations());

        Ok(unpack_filters(&output, self.filter_shape()))
    }

    /// Computes the gradient w.r.t. the signal. If `forward` is specified, the output
    /// gradient is gated with its activation mask; this is required if ReLU is fused
    /// into the layer.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration, if the layer
    /// fuses ReLU and `forward` is not specified, or if the mask of `forward` was recorded
    /// for a different tensor.
    pub fn input_gradient(
        &self,
        output_gradient: FeatureMap<'_>,
        filters: ArrayView4<'_, f32>,
        forward: Option<&ForwardPass>,
    ) -> Result<Array4<f32>, ConfigError> {
        if self.config.relu && forward.is_none() {
            warn!("input gradient of a convolution with fused ReLU requested without its forward pass");
            return Err(ConfigError::MissingMask);
        }
        let batch_size = output_gradient.shape().batch_size;
        let output_shape = self.output_shape(batch_size);
        check_shape("output gradient", &output_shape, &output_gradient.shape().as_nchw())?;
        check_shape("filters", &self.filter_shape(), filters.shape())?;

        let config = self.config;
        let config = KernelConfig {
            mode: Mode::BackwardInput,
            relu: forward.is_some(),
            ..config.with_channels(config.out_channels, config.in_channels)
        };
        let image_blocks = image_blocks(batch_size, config.images)?;
        let mut mask = forward
            .map(|pass| pass.checked_mask(&self.mask_key(output_shape)))
            .transpose()?;

        let input = pack_tiled::<Half>(output_gradient.to_nchw(), config.tile_pad);
        let flipped = flip_filters(filters, config.groups);
        let weights = pack_filters::<Half>(flipped.view());
        let mut output = vec![zero_lanes::<Half>(); config.output_units(image_blocks)];
        let completion = Dispatcher::new(image_blocks, config.groups).dispatch(|invocation| {
            let args = KernelArgs {
                input: &input,
                weights: &weights,
                bias: &[],
                output: &mut output,
                activation_mask: mask.as_deref_mut(),
            };
            cr_layer_fb_half(args, &config, invocation.group, invocation.image_block)
        })?;
        debug!("convolution input gradient: {} invocations", completion.invocations());

        let shape = self.activation_shape(batch_size);
        let gradient = unpack_tiled(&output, shape, config.tile_pad);
        Ok(from_nchw(gradient, output_gradient.layout()))
    }
}

/// Single-precision forward convolution computed by [`conv_layer_direct()`],
/// one image per invocation.
#[derive(Debug, Clone)]
pub struct DirectConvolution {
    config: KernelConfig,
}

impl DirectConvolution {
    /// Creates a convolution with the specified configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is not supported by the direct kernel.
    pub fn new(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate_direct()?;
        Ok(Self { config })
    }

    /// Gets the configuration of this convolution.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Convolves `signal` with `filters` of `[out * groups, in, k, k]` shape.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration.
    pub fn compute(
        &self,
        signal: FeatureMap<'_>,
        filters: ArrayView4<'_, f32>,
        bias: &[f32],
    ) -> Result<Array4<f32>, ConfigError> {
        let config = self.config;
        let size = config.kernel_size;
        let shape = signal.shape();
        check_shape(
            "signal",
            &[shape.batch_size, config.total_in_channels(), config.height, config.width],
            &shape.as_nchw(),
        )?;
        check_shape(
            "filters",
            &[config.total_out_channels(), config.in_channels, size, size],
            filters.shape(),
        )?;
        check_shape("bias", &[config.total_out_channels()], &[bias.len()])?;

        let input = pack_tiled::<f32>(signal.to_nchw(), config.tile_pad);
        let weights = pack_filters::<f32>(filters);
        let mut output = vec![zero_lanes::<f32>(); config.output_units(shape.batch_size)];
        let completion = Dispatcher::new(shape.batch_size, config.groups).dispatch(|invocation| {
            let args = KernelArgs {
                input: &input,
                weights: &weights,
                bias,
                output: &mut output,
                activation_mask: None,
            };
            conv_layer_direct(args, &config, invocation.group, invocation.image_block)
        })?;
        debug!("direct convolution: {} invocations", completion.invocations());

        let output_shape = [
            shape.batch_size,
            config.total_out_channels(),
            config.height,
            config.width,
        ];
        let output = unpack_tiled(&output, output_shape, config.tile_pad);
        Ok(from_nchw(output, signal.layout()))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;

    #[test]
    fn shapes_are_checked() {
        let conv = Convolution::new(KernelConfig::conv(4, 2, 8, 8, 3)).unwrap();
        let signal = Array4::<f32>::zeros([1, 3, 8, 8]);
        let filters = Array4::<f32>::zeros([2, 4, 3, 3]);
        let err = conv
            .forward(FeatureMap::nchw(&signal), filters.view(), &[0.0; 2])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Shape { what: "signal", .. }));
    }

    #[test]
    fn relu_layers_need_forward_pass_for_input_gradient() {
        let config = KernelConfig {
            relu: true,
            ..KernelConfig::conv(4, 2, 8, 8, 3)
        };
        let conv = Convolution::new(config).unwrap();
        let gradient = Array4::<f32>::zeros([1, 2, 8, 8]);
        let filters = Array4::<f32>::zeros([2, 4, 3, 3]);
        let err = conv
            .input_gradient(FeatureMap::nchw(&gradient), filters.view(), None)
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingMask);
    }

    #[test]
    fn channels_last_maps_keep_their_layout() {
        let conv = DirectConvolution::new(KernelConfig::conv(2, 3, 4, 4, 1)).unwrap();
        let signal = Array4::from_shape_fn([2, 4, 4, 2], |(n, y, x, c)| (n + y + x + c) as f32);
        let filters = Array4::from_shape_fn([3, 2, 1, 1], |(o, _, _, _)| o as f32);
        let output = conv
            .compute(FeatureMap::nhwc(&signal), filters.view(), &[0.0, 1.0, 2.0])
            .unwrap();
        assert_eq!(output.shape(), [2, 4, 4, 3]);
        // Output channel `o` is `o * (x_0 + x_1) + o`.
        let expected = 2.0 * (2.0 * (1.0 + 2.0 + 3.0) + 1.0) + 2.0;
        assert_eq!(output[[1, 2, 3, 2]], expected);
    }
}
