//! Fully-connected layers.

use log::{debug, warn};
use ndarray::{Array2, ArrayView2, Ix2};

use super::{check_shape, image_blocks, to_half};
use crate::{
    base::{Dispatcher, ForwardPass, MaskKey, MaskLayout},
    buffers::{pack_rows, unpack_rows, zero_lanes},
    kernels::{cr_layer_fb_half, KernelArgs},
    params::{ConfigError, KernelConfig, Mode, VEC_WIDTH},
    Half,
};

/// Fully-connected layer computed by [`cr_layer_fb_half()`] with channels packed into lanes.
///
/// Signals have `[batch_size, in_channels]` shape and weights `[in_channels, out_channels]`
/// shape, so that `output = signal.dot(weights) + bias`.
#[derive(Debug, Clone)]
pub struct FullyConnected {
    config: KernelConfig,
}

impl FullyConnected {
    /// Creates a layer with the specified configuration. The configuration is switched
    /// to the fully-connected forward mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: KernelConfig) -> Result<Self, ConfigError> {
        let config = KernelConfig {
            mode: Mode::Forward,
            relu: config.relu,
            ..KernelConfig::dense(config.in_channels, config.out_channels, config.images)
        };
        config.validate_half()?;
        Ok(Self { config })
    }

    /// Gets the forward configuration of this layer.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn mask_key(batch_size: usize, channels: usize) -> MaskKey {
        MaskKey {
            layout: MaskLayout::Rows,
            shape: [batch_size, channels, 1, 1],
        }
    }

    fn dispatch(
        config: &KernelConfig,
        image_blocks: usize,
        mut args: KernelArgs<'_, Half>,
    ) -> Result<(), ConfigError> {
        let completion = Dispatcher::new(image_blocks, 1).dispatch(|invocation| {
            let args = KernelArgs {
                input: args.input,
                weights: args.weights,
                bias: args.bias,
                output: &mut *args.output,
                activation_mask: args.activation_mask.as_deref_mut(),
            };
            cr_layer_fb_half(args, config, invocation.group, invocation.image_block)
        })?;
        debug!(
            "fully-connected {:?} pass: {} invocations",
            config.mode,
            completion.invocations()
        );
        Ok(())
    }

    /// Computes the forward pass.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration.
    pub fn forward(
        &self,
        signal: ArrayView2<'_, f32>,
        weights: ArrayView2<'_, f32>,
        bias: &[f32],
    ) -> Result<ForwardPass<Ix2>, ConfigError> {
        let config = self.config;
        let batch_size = signal.nrows();
        check_shape("signal", &[batch_size, config.in_channels], signal.shape())?;
        check_shape(
            "weights",
            &[config.in_channels, config.out_channels],
            weights.shape(),
        )?;
        check_shape("bias", &[config.out_channels], &[bias.len()])?;
        let image_blocks = image_blocks(batch_size, config.images)?;

        let input = pack_rows::<Half>(signal);
        let packed_weights = pack_rows::<Half>(weights);
        let bias = to_half(bias);
        let mut output = vec![zero_lanes::<Half>(); config.output_units(image_blocks)];
        let mut mask = if config.relu {
            Some(vec![[0_u8; VEC_WIDTH]; output.len()])
        } else {
            None
        };
        let args = KernelArgs {
            input: &input,
            weights: &packed_weights,
            bias: &bias,
            output: &mut output,
            activation_mask: mask.as_deref_mut(),
        };
        Self::dispatch(&config, image_blocks, args)?;

        let output = unpack_rows(&output, [batch_size, config.out_channels]);
        let key = Self::mask_key(batch_size, config.out_channels);
        Ok(ForwardPass::new(output, mask, key))
    }

    /// Computes the gradient w.r.t. weights, of `[in_channels, out_channels]` shape.
    /// If `activation_mask` is specified, activations are gated with its mask.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration, or the mask
    /// was recorded for a different tensor.
    pub fn weight_gradient(
        &self,
        activations: ArrayView2<'_, f32>,
        output_gradient: ArrayView2<'_, f32>,
        activation_mask: Option<&ForwardPass<Ix2>>,
    ) -> Result<Array2<f32>, ConfigError> {
        let batch_size = activations.nrows();
        check_shape(
            "activations",
            &[batch_size, self.config.in_channels],
            activations.shape(),
        )?;
        check_shape(
            "output gradient",
            &[batch_size, self.config.out_channels],
            output_gradient.shape(),
        )?;
        let config = KernelConfig {
            mode: Mode::BackwardWeights,
            relu: activation_mask.is_some(),
            ..self.config
        };
        let image_blocks = image_blocks(batch_size, config.images)?;
        let mut mask = activation_mask
            .map(|pass| pass.checked_mask(&Self::mask_key(batch_size, config.in_channels)))
            .transpose()?;

        let input = pack_rows::<Half>(activations);
        let gradients = pack_rows::<Half>(output_gradient);
        let mut output = vec![zero_lanes::<Half>(); config.filter_units()];
        let args = KernelArgs {
            input: &input,
            weights: &gradients,
            bias: &[],
            output: &mut output,
            activation_mask: mask.as_deref_mut(),
        };
        Self::dispatch(&config, image_blocks, args)?;
        Ok(unpack_rows(&output, [config.in_channels, config.out_channels]))
    }

    /// Computes the gradient w.r.t. the signal. `forward` is required if ReLU is fused
    /// into the layer.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration, or if the layer
    /// fuses ReLU and `forward` is missing or belongs to a different tensor.
    pub fn input_gradient(
        &self,
        output_gradient: ArrayView2<'_, f32>,
        weights: ArrayView2<'_, f32>,
        forward: Option<&ForwardPass<Ix2>>,
    ) -> Result<Array2<f32>, ConfigError> {
        if self.config.relu && forward.is_none() {
            warn!("input gradient of a fully-connected layer with fused ReLU requested without its forward pass");
            return Err(ConfigError::MissingMask);
        }
        let batch_size = output_gradient.nrows();
        let (in_channels, out_channels) = (self.config.in_channels, self.config.out_channels);
        check_shape(
            "output gradient",
            &[batch_size, out_channels],
            output_gradient.shape(),
        )?;
        check_shape("weights", &[in_channels, out_channels], weights.shape())?;

        let config = KernelConfig {
            mode: Mode::BackwardInput,
            relu: forward.is_some(),
            ..KernelConfig::dense(out_channels, in_channels, self.config.images)
        };
        let image_blocks = image_blocks(batch_size, config.images)?;
        let mut mask = forward
            .map(|pass| pass.checked_mask(&Self::mask_key(batch_size, out_channels)))
            .transpose()?;

        let input = pack_rows::<Half>(output_gradient);
        let transposed = pack_rows::<Half>(weights.t());
        let mut output = vec![zero_lanes::<Half>(); config.output_units(image_blocks)];
        let args = KernelArgs {
            input: &input,
            weights: &transposed,
            bias: &[],
            output: &mut output,
            activation_mask: mask.as_deref_mut(),
        };
        Self::dispatch(&config, image_blocks, args)?;
        Ok(unpack_rows(&output, [batch_size, in_channels]))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    #[test]
    fn forward_and_backward_with_relu() {
        let config = KernelConfig {
            relu: true,
            ..KernelConfig::dense(16, 32, 2)
        };
        let layer = FullyConnected::new(config).unwrap();
        let signal = Array2::from_shape_fn([2, 16], |(n, i)| if i < 4 { (n + 1) as f32 } else { 0.0 });
        let weights = Array2::from_shape_fn([16, 32], |(_, o)| if o < 16 { 1.0 } else { -1.0 });
        let bias = vec![0.5; 32];

        let pass = layer.forward(signal.view(), weights.view(), &bias).unwrap();
        assert_eq!(pass.output()[[0, 0]], 4.5);
        assert_eq!(pass.output()[[1, 3]], 8.5);
        assert_eq!(pass.output()[[1, 20]], 0.0);

        let gradient = Array2::from_elem([2, 32], 1.0_f32);
        let input_gradient = layer
            .input_gradient(gradient.view(), weights.view(), Some(&pass))
            .unwrap();
        // Only the first 16 outputs are active.
        assert_eq!(input_gradient[[0, 7]], 16.0);

        let weight_gradient = layer
            .weight_gradient(signal.view(), gradient.view(), None)
            .unwrap();
        assert_eq!(weight_gradient.shape(), [16, 32]);
        assert_eq!(weight_gradient[[2, 5]], 3.0);
        assert_eq!(weight_gradient[[9, 5]], 0.0);
    }

    #[test]
    fn missing_forward_pass_is_an_error() {
        let config = KernelConfig {
            relu: true,
            ..KernelConfig::dense(16, 16, 1)
        };
        let layer = FullyConnected::new(config).unwrap();
        let gradient = Array2::<f32>::zeros([1, 16]);
        let weights = Array2::<f32>::zeros([16, 16]);
        assert_eq!(
            layer.input_gradient(gradient.view(), weights.view(), None),
            Err(ConfigError::MissingMask)
        );
    }

    #[test]
    fn channel_counts_must_fill_lanes() {
        let err = FullyConnected::new(KernelConfig::dense(20, 16, 1)).unwrap_err();
        assert!(matches!(err, ConfigError::Alignment { name: "in_channels", .. }));
    }
}
