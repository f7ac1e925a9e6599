//! Half-precision convolution over the HWCN layout.
//!
//! Images are the innermost axis, so every vector unit holds the same element
//! of 16 images. Each input burst is split into 4 sub-lanes of channels that are
//! multiplied in parallel.

use log::{debug, trace};

use std::ops::Range;

use super::KernelArgs;
use crate::{
    buffers::{zero_lanes, Lanes},
    mac::{accumulate, accumulate_enabled, pairwise_sum, sublane_sum, StagingRegister},
    params::{check_len, check_range, ConfigError, HwcnConfig, Mode},
    relu::{relu_backward_bits, relu_forward_bits},
    schedule::{pixel_backward_order, pixel_forward_order},
    tile::{load_range, store_range, TileBuffers},
    Half,
};

/// Channel sub-lanes of an input burst.
const SUBLANES: usize = 4;

/// Half-precision convolution over the HWCN layout, forward or backward.
///
/// Processes all images of group `group`. Unlike the channel-major kernels, arbitrary
/// kernel sizes (up to 11), strides and zero padding are supported. The activation mask
/// stores one `u16` per vector unit, with bit `j` corresponding to image lane `j`.
///
/// Buffer roles are the same as for [`cr_layer_fb_half()`](crate::kernels::cr_layer_fb_half);
/// filters and filter gradients use the layout of
/// [`pack_hwcn_filters()`](crate::buffers::pack_hwcn_filters).
///
/// # Errors
///
/// Returns an error if the configuration is out of bounds, if any of the buffers is too
/// short for the addressed region, or if the mask is missing while ReLU is fused.
pub fn cr_layer_hwcn_half(
    args: KernelArgs<'_, Half, u16>,
    config: &HwcnConfig,
    group: usize,
) -> Result<(), ConfigError> {
    config.validate()?;
    HwcnEngine::new(args, config, group)?.run();
    Ok(())
}

/// Offsets into the external HWCN buffers for a single group.
#[derive(Debug, Clone, Copy)]
struct HwcnLayout {
    config: HwcnConfig,
    group: usize,
}

impl HwcnLayout {
    fn taps(&self) -> usize {
        self.config.common.kernel_size * self.config.common.kernel_size
    }

    /// Activations of sub-lane `sublane` of the burst read in `read_pass` at pixel `(y, x)`.
    fn activation_range(&self, y: usize, x: usize, read_pass: usize, sublane: usize) -> Range<usize> {
        let common = &self.config.common;
        let len = self.config.sublane_channels() * self.config.image_units();
        let channel = (y * common.width + x) * common.total_in_channels()
            + self.group * common.in_channels
            + read_pass * common.burst_channels;
        let start = channel * self.config.image_units() + sublane * len;
        start..start + len
    }

    /// Units of output channel `filter` at output pixel `(y, x)`.
    fn pixel_range(&self, y: usize, x: usize, filter: usize) -> Range<usize> {
        let common = &self.config.common;
        let channel = (y * self.config.output_width() + x) * common.total_out_channels()
            + self.group * common.out_channels
            + filter;
        let start = channel * self.config.image_units();
        start..start + self.config.image_units()
    }

    /// Filter units of output channel `filter` for the burst read in `read_pass`.
    fn filter_range(&self, filter: usize, read_pass: usize) -> Range<usize> {
        let common = &self.config.common;
        let taps = self.taps();
        let start = (filter + common.out_channels * self.group)
            * taps
            * self.config.channel_weight_units()
            + read_pass * taps * self.config.burst_weight_units();
        start..start + taps * self.config.burst_weight_units()
    }
}

/// Filter taps along one axis that fall inside the signal when the window
/// starts at `origin - pad`.
fn tap_range(origin: usize, pad: usize, kernel_size: usize, extent: usize) -> Range<usize> {
    let start = pad.saturating_sub(origin);
    let end = (extent + pad).saturating_sub(origin).min(kernel_size);
    start..end.max(start)
}

struct HwcnEngine<'a> {
    config: HwcnConfig,
    layout: HwcnLayout,
    input: &'a [Lanes<Half>],
    weights: &'a [Lanes<Half>],
    output: &'a mut [Lanes<Half>],
    mask: Option<&'a mut [u16]>,
    tiles: TileBuffers<Half>,
}

impl<'a> HwcnEngine<'a> {
    fn new(
        args: KernelArgs<'a, Half, u16>,
        config: &HwcnConfig,
        group: usize,
    ) -> Result<Self, ConfigError> {
        let common = config.common;
        check_range("group", group, 0, common.groups - 1)?;
        let layout = HwcnLayout {
            config: *config,
            group,
        };

        let activations_end = layout
            .activation_range(
                common.height - 1,
                common.width - 1,
                common.read_passes - 1,
                SUBLANES - 1,
            )
            .end;
        let pixels_end = layout
            .pixel_range(
                config.output_height() - 1,
                config.output_width() - 1,
                common.out_channels - 1,
            )
            .end;
        let filters_end = layout
            .filter_range(common.out_channels - 1, common.read_passes - 1)
            .end;
        let (weights_end, output_end) = match common.mode {
            Mode::BackwardWeights => (pixels_end, filters_end),
            _ => (filters_end, pixels_end),
        };
        check_len("input", activations_end, args.input.len())?;
        check_len("weights", weights_end, args.weights.len())?;
        check_len("output", output_end, args.output.len())?;

        let bias_range = common.out_channels * group..common.out_channels * (group + 1);
        if common.mode == Mode::Forward {
            check_len("bias", bias_range.end, args.bias.len())?;
        }
        if common.relu {
            let mask = args.activation_mask.as_deref().ok_or(ConfigError::MissingMask)?;
            let mask_end = if common.mode.is_backward() {
                activations_end
            } else {
                pixels_end
            };
            check_len("activation_mask", mask_end, mask.len())?;
        }

        let taps = layout.taps();
        let input_units = SUBLANES * taps * config.sublane_channels() * config.image_units();
        let filter_units = taps * config.burst_weight_units();
        let (weight_units, output_units) = match common.mode {
            Mode::BackwardWeights => (config.image_units(), filter_units),
            _ => (filter_units, config.image_units()),
        };
        let mut tiles = TileBuffers::new(1, input_units, weight_units, output_units);
        if common.mode == Mode::Forward {
            tiles.load_bias(&args.bias[bias_range]);
        }

        Ok(Self {
            config: *config,
            layout,
            input: args.input,
            weights: args.weights,
            output: args.output,
            mask: args.activation_mask,
            tiles,
        })
    }

    fn run(mut self) {
        let common = self.config.common;
        debug!(
            "cr_layer_hwcn_half invocation: mode={:?}, group={}, kernel_size={}, stride={}, pad={}",
            common.mode, self.layout.group, common.kernel_size, self.config.stride, self.config.pad
        );

        for read_pass in 0..common.read_passes {
            for y in 0..self.config.output_height() {
                for x in 0..self.config.output_width() {
                    let (rows, cols) = self.load_window(y, x, read_pass);
                    for filter in 0..common.out_channels {
                        self.load_operands(y, x, filter, read_pass);
                        if common.mode == Mode::BackwardWeights {
                            self.gradient_steps(rows.clone(), cols.clone());
                        } else {
                            self.forward_steps(rows.clone(), cols.clone());
                        }
                        self.write_back(y, x, filter, read_pass);
                    }
                }
            }
            trace!("finished read pass {}", read_pass);
        }
    }

    /// Loads the activations covered by the filter at output pixel `(y, x)` and returns
    /// the filter rows and columns that fall inside the signal.
    fn load_window(&mut self, y: usize, x: usize, read_pass: usize) -> (Range<usize>, Range<usize>) {
        let common = self.config.common;
        let (stride, pad) = (self.config.stride, self.config.pad);
        let rows = tap_range(y * stride, pad, common.kernel_size, common.height);
        let cols = tap_range(x * stride, pad, common.kernel_size, common.width);
        let gate = common.relu && common.mode.is_backward();
        let taps = self.layout.taps();
        let sublane_units = self.config.sublane_channels() * self.config.image_units();

        for tap_row in rows.clone() {
            for tap_col in cols.clone() {
                let tap = tap_row * common.kernel_size + tap_col;
                let (in_y, in_x) = (y * stride + tap_row - pad, x * stride + tap_col - pad);
                for sublane in 0..SUBLANES {
                    let range = self.layout.activation_range(in_y, in_x, read_pass, sublane);
                    let start = (sublane * taps + tap) * sublane_units;
                    let tile = &mut self.tiles.input[start..start + sublane_units];
                    load_range(tile, self.input, range.clone());
                    if gate {
                        if let Some(mask) = self.mask.as_deref() {
                            for (unit, &bits) in tile.iter_mut().zip(&mask[range]) {
                                relu_backward_bits(unit, bits);
                            }
                        }
                    }
                }
            }
        }
        (rows, cols)
    }

    fn load_operands(&mut self, y: usize, x: usize, filter: usize, read_pass: usize) {
        let pixel = self.layout.pixel_range(y, x, filter);
        let filters = self.layout.filter_range(filter, read_pass);
        match self.config.common.mode {
            Mode::BackwardWeights => {
                load_range(&mut self.tiles.outputs[0], self.output, filters);
                load_range(&mut self.tiles.weights[0], self.weights, pixel);
            }
            mode => {
                if read_pass > 0 {
                    load_range(&mut self.tiles.outputs[0], self.output, pixel);
                } else if mode == Mode::Forward {
                    self.tiles.seed_bias(0, filter);
                } else {
                    self.tiles.seed_zero(0);
                }
                load_range(&mut self.tiles.weights[0], self.weights, filters);
            }
        }
    }

    /// Forward steps: each weight lane is broadcast over 16 images, and the products of
    /// the 4 sub-lanes are reduced before accumulation.
    fn forward_steps(&mut self, rows: Range<usize>, cols: Range<usize>) {
        let kernel_size = self.config.common.kernel_size;
        let taps = self.layout.taps();
        let channels = self.config.sublane_channels();
        let image_units = self.config.image_units();
        let weight_units = self.config.burst_weight_units();
        let slot = |sublane: usize, tap: usize, channel: usize, image_unit: usize| {
            ((sublane * taps + tap) * channels + channel) * image_units + image_unit
        };

        for step in pixel_forward_order(rows, cols, channels, image_units) {
            let tap = step.tap_row * kernel_size + step.tap_col;
            let unit = &self.tiles.weights[0][tap * weight_units + step.channel / SUBLANES];
            let lane_base = (step.channel % SUBLANES) * SUBLANES;

            let mut products = [zero_lanes(); SUBLANES];
            for (sublane, product) in products.iter_mut().enumerate() {
                let weight = unit[lane_base + sublane];
                let input = &self.tiles.input[slot(sublane, tap, step.channel, step.image_unit)];
                for (product, &value) in product.iter_mut().zip(input) {
                    *product = value * weight;
                }
            }
            accumulate(&mut self.tiles.outputs[0][step.image_unit], &sublane_sum(&products));
        }
    }

    /// Weight-gradient steps: products are reduced over the 16 images of a unit,
    /// and the sums of 4 consecutive channels are committed as one filter unit.
    fn gradient_steps(&mut self, rows: Range<usize>, cols: Range<usize>) {
        let kernel_size = self.config.common.kernel_size;
        let taps = self.layout.taps();
        let channels = self.config.sublane_channels();
        let image_units = self.config.image_units();
        let weight_units = self.config.burst_weight_units();
        let slot = |sublane: usize, tap: usize, channel: usize, image_unit: usize| {
            ((sublane * taps + tap) * channels + channel) * image_units + image_unit
        };

        let mut register = StagingRegister::<Half>::new();
        for step in pixel_backward_order(rows, cols, channels, image_units) {
            let tap = step.tap_row * kernel_size + step.tap_col;
            let gradient = &self.tiles.weights[0][step.image_unit];
            let sub_step = step.channel % SUBLANES;

            let mut sums = [Half::ZERO; SUBLANES];
            for (sublane, sum) in sums.iter_mut().enumerate() {
                let input = &self.tiles.input[slot(sublane, tap, step.channel, step.image_unit)];
                let mut products = zero_lanes();
                for ((product, &value), &grad) in products.iter_mut().zip(input).zip(gradient) {
                    *product = value * grad;
                }
                *sum = pairwise_sum(&products);
            }
            register.park(sub_step * SUBLANES, &sums);
            if accumulate_enabled(sub_step, SUBLANES) {
                let cell = tap * weight_units + step.channel / SUBLANES;
                accumulate(&mut self.tiles.outputs[0][cell], register.lanes());
            }
        }
    }

    fn write_back(&mut self, y: usize, x: usize, filter: usize, read_pass: usize) {
        let common = self.config.common;
        let range = match common.mode {
            Mode::BackwardWeights => self.layout.filter_range(filter, read_pass),
            _ => self.layout.pixel_range(y, x, filter),
        };
        let last_pass = read_pass + 1 == common.read_passes;
        if common.relu && common.mode == Mode::Forward && last_pass {
            if let Some(mask) = self.mask.as_deref_mut() {
                let tile = &mut self.tiles.outputs[0];
                for (unit, bits) in tile.iter_mut().zip(&mut mask[range.clone()]) {
                    *bits = relu_forward_bits(unit);
                }
            }
        }
        store_range(&self.tiles.outputs[0], self.output, range);
    }
}
