//! Layers over the HWCN layout: strided convolutions and max-pooling.

use log::{debug, warn};
use ndarray::{Array4, ArrayView4, Ix4};

use super::{check_shape, to_half};
use crate::{
    base::{Dispatcher, ForwardPass, MaskKey, MaskLayout},
    buffers::{
        flip_filters, from_nchw, pack_hwcn, pack_hwcn_filters, unpack_hwcn, unpack_hwcn_filters,
        zero_lanes, FeatureMap, Lanes,
    },
    kernels::{cr_layer_hwcn_half, pool_layer_hwcn_half, KernelArgs, PoolArgs},
    params::{ConfigError, HwcnConfig, Mode, PoolConfig, VEC_WIDTH},
    Half,
};

/// Half-precision convolution over the HWCN layout computed by [`cr_layer_hwcn_half()`].
///
/// All `config.common.images` images of a batch are processed by a single invocation
/// per group, so the batch size must be equal to `images`.
#[derive(Debug, Clone)]
pub struct HwcnConvolution {
    config: HwcnConfig,
}

impl HwcnConvolution {
    /// Creates a convolution with the specified configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: HwcnConfig) -> Result<Self, ConfigError> {
        let mut config = config;
        config.common.mode = Mode::Forward;
        config.validate()?;
        Ok(Self { config })
    }

    /// Gets the forward configuration of this convolution.
    pub fn config(&self) -> &HwcnConfig {
        &self.config
    }

    fn activation_shape(&self) -> [usize; 4] {
        let common = &self.config.common;
        [common.images, common.total_in_channels(), common.height, common.width]
    }

    fn output_shape(&self) -> [usize; 4] {
        let common = &self.config.common;
        [
            common.images,
            common.total_out_channels(),
            self.config.output_height(),
            self.config.output_width(),
        ]
    }

    fn filter_shape(&self) -> [usize; 4] {
        let common = &self.config.common;
        let size = common.kernel_size;
        [common.total_out_channels(), common.in_channels, size, size]
    }

    fn mask_key(shape: [usize; 4]) -> MaskKey {
        MaskKey {
            layout: MaskLayout::Hwcn,
            shape,
        }
    }

    fn dispatch(config: &HwcnConfig, mut args: KernelArgs<'_, Half, u16>) -> Result<(), ConfigError> {
        let completion = Dispatcher::new(1, config.common.groups).dispatch(|invocation| {
            let args = KernelArgs {
                input: args.input,
                weights: args.weights,
                bias: args.bias,
                output: &mut *args.output,
                activation_mask: args.activation_mask.as_deref_mut(),
            };
            cr_layer_hwcn_half(args, config, invocation.group)
        })?;
        debug!(
            "HWCN convolution {:?} pass: {} invocations",
            config.common.mode,
            completion.invocations()
        );
        Ok(())
    }

    /// Computes the forward pass. `filters` have `[out * groups, in, k, k]` shape.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration.
    pub fn forward(
        &self,
        signal: FeatureMap<'_>,
        filters: ArrayView4<'_, f32>,
        bias: &[f32],
    ) -> Result<ForwardPass<Ix4, u16>, ConfigError> {
        let config = self.config;
        check_shape("signal", &self.activation_shape(), &signal.shape().as_nchw())?;
        check_shape("filters", &self.filter_shape(), filters.shape())?;
        check_shape("bias", &[config.common.total_out_channels()], &[bias.len()])?;

        let input = pack_hwcn::<Half>(signal.to_nchw());
        let weights = pack_hwcn_filters::<Half>(filters, config.common.burst_channels);
        let bias = to_half(bias);
        let mut output = vec![zero_lanes::<Half>(); config.output_units()];
        let mut mask = if config.common.relu {
            Some(vec![0_u16; output.len()])
        } else {
            None
        };
        let args = KernelArgs {
            input: &input,
            weights: &weights,
            bias: &bias,
            output: &mut output,
            activation_mask: mask.as_deref_mut(),
        };
        Self::dispatch(&config, args)?;

        let shape = self.output_shape();
        let output = from_nchw(unpack_hwcn(&output, shape), signal.layout());
        Ok(ForwardPass::new(output, mask, Self::mask_key(shape)))
    }

    /// Computes the gradient w.r.t. filters. If `activation_mask` is specified, activations
    /// are gated with its mask.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration, or the mask
    /// was recorded for a different tensor.
    pub fn weight_gradient(
        &self,
        activations: FeatureMap<'_>,
        output_gradient: FeatureMap<'_>,
        activation_mask: Option<&ForwardPass<Ix4, u16>>,
    ) -> Result<Array4<f32>, ConfigError> {
        let activation_shape = self.activation_shape();
        check_shape("activations", &activation_shape, &activations.shape().as_nchw())?;
        check_shape(
            "output gradient",
            &self.output_shape(),
            &output_gradient.shape().as_nchw(),
        )?;
        let mut config = self.config;
        config.common.mode = Mode::BackwardWeights;
        config.common.relu = activation_mask.is_some();
        config.validate()?;
        let mut mask = activation_mask
            .map(|pass| pass.checked_mask(&Self::mask_key(activation_shape)))
            .transpose()?;

        let input = pack_hwcn::<Half>(activations.to_nchw());
        let gradients = pack_hwcn::<Half>(output_gradient.to_nchw());
        let mut output = vec![zero_lanes::<Half>(); config.filter_units()];
        let args = KernelArgs {
            input: &input,
            weights: &gradients,
            bias: &[],
            output: &mut output,
            activation_mask: mask.as_deref_mut(),
        };
        Self::dispatch(&config, args)?;
        Ok(unpack_hwcn_filters(
            &output,
            self.filter_shape(),
            config.common.burst_channels,
        ))
    }

    /// Configuration of the transposed convolution computing input gradients.
    fn transposed_config(&self, relu: bool) -> Result<HwcnConfig, ConfigError> {
        let config = &self.config;
        let common = &config.common;
        if config.stride != 1 || config.pad >= common.kernel_size {
            return Err(ConfigError::Unsupported {
                kernel: "hwcn",
                feature: "input gradients of strided convolutions or padding >= kernel_size",
            });
        }
        let mut transposed = HwcnConfig {
            common: common.with_channels(common.out_channels, common.in_channels),
            stride: 1,
            pad: common.kernel_size - 1 - config.pad,
        };
        transposed.common.height = config.output_height();
        transposed.common.width = config.output_width();
        transposed.common.mode = Mode::BackwardInput;
        transposed.common.relu = relu;

        // Largest burst of 16k channels that fits on chip.
        let channels = transposed.common.in_channels;
        let burst = (1..=channels / VEC_WIDTH)
            .rev()
            .map(|units| units * VEC_WIDTH)
            .filter(|burst| channels % burst == 0)
            .find(|&burst| {
                let mut candidate = transposed;
                candidate.common.burst_channels = burst;
                candidate.common.read_passes = channels / burst;
                candidate.validate().is_ok()
            })
            .unwrap_or(VEC_WIDTH);
        transposed.common.burst_channels = burst;
        transposed.common.read_passes = (channels / burst).max(1);
        transposed.validate()?;
        Ok(transposed)
    }

    /// Computes the gradient w.r.t. the signal. Only unit-stride convolutions with
    /// `pad < kernel_size` are supported, and the number of output channels must be
    /// a multiple of 16.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor shapes do not match the configuration, if the convolution
    /// is not supported, or if the layer fuses ReLU and `forward` is missing or belongs
    /// to a different tensor.
    pub fn input_gradient(
        &self,
        output_gradient: FeatureMap<'_>,
        filters: ArrayView4<'_, f32>,
        forward: Option<&ForwardPass<Ix4, u16>>,
    ) -> Result<Array4<f32>, ConfigError> {
        if self.config.common.relu && forward.is_none() {
            warn!("input gradient of an HWCN convolution with fused ReLU requested without its forward pass");
            return Err(ConfigError::MissingMask);
        }
        let output_shape = self.output_shape();
        check_shape(
            "output gradient",
            &output_shape,
            &output_gradient.shape().as_nchw(),
        )?;
        check_shape("filters", &self.filter_shape(), filters.shape())?;
        let config = self.transposed_config(forward.is_some())?;
        let mut mask = forward
            .map(|pass| pass.checked_mask(&Self::mask_key(output_shape)))
            .transpose()?;

        let input = pack_hwcn::<Half>(output_gradient.to_nchw());
        let flipped = flip_filters(filters, config.common.groups);
        let weights = pack_hwcn_filters::<Half>(flipped.view(), config.common.burst_channels);
        let mut output = vec![zero_lanes::<Half>(); config.output_units()];
        let args = KernelArgs {
            input: &input,
            weights: &weights,
            bias: &[],
            output: &mut output,
            activation_mask: mask.as_deref_mut(),
        };
        Self::dispatch(&config, args)?;

        let gradient = unpack_hwcn(&output, self.activation_shape());
        Ok(from_nchw(gradient, output_gradient.layout()))
    }
}

/// Max-pooling with stride 2 over the HWCN layout, computed by [`pool_layer_hwcn_half()`].
#[derive(Debug, Clone)]
pub struct MaxPool {
    config: PoolConfig,
}

impl MaxPool {
    /// Creates a pooling layer with the specified configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        let mut config = config;
        config.common.mode = Mode::Forward;
        config.validate()?;
        Ok(Self { config })
    }

    /// Gets the configuration of this layer.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn activation_shape(&self) -> [usize; 4] {
        let common = &self.config.common;
        [common.images, common.in_channels, common.height, common.width]
    }

    fn pooled_shape(&self) -> [usize; 4] {
        let common = &self.config.common;
        [
            common.images,
            common.in_channels,
            self.config.output_height(),
            self.config.output_width(),
        ]
    }

    fn mask_key(&self) -> MaskKey {
        MaskKey {
            layout: MaskLayout::PoolArgmax {
                pool_size: self.config.pool_size,
            },
            shape: self.pooled_shape(),
        }
    }

    /// Pools `signal`, recording the winning window slot of every pooled element.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal shape does not match the configuration.
    pub fn forward(&self, signal: FeatureMap<'_>) -> Result<ForwardPass, ConfigError> {
        check_shape("signal", &self.activation_shape(), &signal.shape().as_nchw())?;
        let input = pack_hwcn::<Half>(signal.to_nchw());
        let pooled_shape = self.pooled_shape();
        let pooled_units = pooled_shape.iter().product::<usize>() / VEC_WIDTH;
        let mut output = vec![zero_lanes::<Half>(); pooled_units];
        let mut argmax: Vec<Lanes<u8>> = vec![[0; VEC_WIDTH]; pooled_units];
        let args = PoolArgs {
            input: &input,
            output: &mut output,
            argmax: &mut argmax,
        };
        pool_layer_hwcn_half(args, &self.config)?;

        let output = from_nchw(unpack_hwcn(&output, pooled_shape), signal.layout());
        Ok(ForwardPass::new(output, Some(argmax), self.mask_key()))
    }

    /// Routes `pooled_gradient` back to the window slots recorded by `forward`.
    ///
    /// # Errors
    ///
    /// Returns an error if the gradient shape does not match the configuration, or
    /// `forward` was produced by a different pooling layer.
    pub fn backward(
        &self,
        pooled_gradient: FeatureMap<'_>,
        forward: &ForwardPass,
    ) -> Result<Array4<f32>, ConfigError> {
        check_shape(
            "pooled gradient",
            &self.pooled_shape(),
            &pooled_gradient.shape().as_nchw(),
        )?;
        let mut argmax = forward.checked_mask(&self.mask_key())?;
        let mut config = self.config;
        config.common.mode = Mode::BackwardInput;

        let input = pack_hwcn::<Half>(pooled_gradient.to_nchw());
        let activation_shape = self.activation_shape();
        let units = activation_shape.iter().product::<usize>() / VEC_WIDTH;
        let mut output = vec![zero_lanes::<Half>(); units];
        let args = PoolArgs {
            input: &input,
            output: &mut output,
            argmax: &mut argmax,
        };
        pool_layer_hwcn_half(args, &config)?;

        let gradient = unpack_hwcn(&output, activation_shape);
        Ok(from_nchw(gradient, pooled_gradient.layout()))
    }
}
