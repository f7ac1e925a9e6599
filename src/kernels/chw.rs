//! Engine shared by the channel-major kernels, generic over the element type
//! and the number of output lanes processed in parallel.

use log::{debug, trace};

use std::ops::Range;

use super::KernelArgs;
use crate::{
    buffers::{zero_lanes, Lanes},
    mac::{accumulate, accumulate_enabled, tap_sums, window_products, StagingRegister},
    params::{check_len, check_range, ConfigError, KernelConfig, Mode, VEC_WIDTH},
    relu::{relu_backward, relu_forward},
    schedule::{backward_order, forward_order},
    staging::{
        filter_taps, gradient_lanes, stage_window, AccessPlan, Cursor, RowGeometry, Seed,
        WindowPos,
    },
    tile::{load_range, store_range, TileBuffers},
    KernelElement,
};

pub(super) struct ChwEngine<'a, T, const LANES: usize> {
    config: KernelConfig,
    plan: AccessPlan,
    group: usize,
    image_block: usize,
    input: &'a [Lanes<T>],
    weights: &'a [Lanes<T>],
    output: &'a mut [Lanes<T>],
    mask: Option<&'a mut [Lanes<u8>]>,
    tiles: TileBuffers<T>,
}

impl<'a, T: KernelElement, const LANES: usize> ChwEngine<'a, T, LANES> {
    /// Checks buffers against the configuration. The configuration itself must
    /// be validated beforehand.
    pub fn new(
        args: KernelArgs<'a, T>,
        config: &KernelConfig,
        group: usize,
        image_block: usize,
    ) -> Result<Self, ConfigError> {
        check_range("group", group, 0, config.groups - 1)?;
        let plan = AccessPlan::select(config);
        let last = plan.last_cursor(config, group, image_block);
        check_len("input", plan.input_range(config, &last).end, args.input.len())?;
        check_len("weights", plan.weight_range(config, &last).end, args.weights.len())?;
        check_len("output", plan.output_range(config, &last).end, args.output.len())?;

        let bias_range = if config.fully_connected {
            0..config.out_channels
        } else {
            config.out_channels * group..config.out_channels * (group + 1)
        };
        if config.mode == Mode::Forward {
            check_len("bias", bias_range.end, args.bias.len())?;
        }
        if config.relu {
            let mask = args.activation_mask.as_deref().ok_or(ConfigError::MissingMask)?;
            check_len("activation_mask", plan.mask_range(config, &last).end, mask.len())?;
        }

        let (input_units, weight_units, output_units) = tile_sizes(config, plan);
        let mut tiles = TileBuffers::new(LANES, input_units, weight_units, output_units);
        if config.mode == Mode::Forward {
            tiles.load_bias(&args.bias[bias_range]);
        }
        Ok(Self {
            config: *config,
            plan,
            group,
            image_block,
            input: args.input,
            weights: args.weights,
            output: args.output,
            mask: args.activation_mask,
            tiles,
        })
    }

    pub fn run(mut self, kernel: &'static str) {
        debug!(
            "{} invocation: mode={:?}, plan={:?}, group={}, image_block={}",
            kernel, self.config.mode, self.plan, self.group, self.image_block
        );
        match self.plan {
            AccessPlan::Window { seed } => self.window_pass(seed),
            AccessPlan::WeightGradient => self.weight_gradient_pass(),
            AccessPlan::Dense { seed } => self.dense_pass(seed),
            AccessPlan::DenseWeightGradient => self.dense_weight_gradient_pass(),
        }
    }

    fn cursor(&self, image: usize, read_pass: usize) -> Cursor {
        Cursor {
            image: self.image_block * self.config.images + image,
            group: self.group,
            read_pass,
            ..Cursor::default()
        }
    }

    /// Loads the input bursts of all images, gating them with the activation mask
    /// in backward passes.
    fn load_inputs(&mut self, read_pass: usize) {
        let gate = self.config.relu && self.config.mode.is_backward();
        let burst_units = self.plan.input_range(&self.config, &Cursor::default()).len();
        for image in 0..self.config.images {
            let cursor = self.cursor(image, read_pass);
            let range = self.plan.input_range(&self.config, &cursor);
            let tile = &mut self.tiles.input[image * burst_units..(image + 1) * burst_units];
            load_range(tile, self.input, range.clone());
            if gate {
                if let Some(mask) = self.mask.as_deref() {
                    relu_backward(tile, &mask[range]);
                }
            }
        }
        trace!("loaded input bursts for read pass {}", read_pass);
    }

    fn active_lanes(&self, lane_group: usize) -> usize {
        let start = lane_group * LANES;
        (self.config.out_channels - start).min(LANES)
    }

    fn window_pass(&mut self, seed: Seed) {
        let config = self.config;
        let geometry = RowGeometry::from(&config);
        let row_units = config.row_units();
        let weight_units = config.burst_channels * config.weight_units();
        let lane_groups = (config.out_channels + LANES - 1) / LANES;

        for read_pass in 0..config.read_passes {
            self.load_inputs(read_pass);
            let last_pass = read_pass + 1 == config.read_passes;

            for lane_group in 0..lane_groups {
                let active = self.active_lanes(lane_group);
                let mut cursor = self.cursor(0, read_pass);
                for lane in 0..active {
                    cursor.filter = lane_group * LANES + lane;
                    let range = self.plan.weight_range(&config, &cursor);
                    load_range(&mut self.tiles.weights[lane], self.weights, range);
                }

                for image in 0..config.images {
                    let mut cursor = self.cursor(image, read_pass);
                    for row_tile in 0..config.output_tile_passes {
                        cursor.row_tile = row_tile;
                        for lane in 0..active {
                            cursor.filter = lane_group * LANES + lane;
                            if read_pass > 0 {
                                let range = self.plan.output_range(&config, &cursor);
                                load_range(&mut self.tiles.outputs[lane], self.output, range);
                            } else if seed == Seed::Bias {
                                self.tiles.seed_bias(lane, cursor.filter);
                            } else {
                                self.tiles.seed_zero(lane);
                            }
                        }

                        let steps =
                            forward_order(weight_units, config.kernel_size, config.burst_rows, row_units);
                        for step in steps {
                            let pos = WindowPos {
                                image,
                                weight_unit: step.weight_unit,
                                row_tap: step.row_tap,
                                row: row_tile * config.burst_rows + step.row,
                                column_unit: step.column_unit,
                            };
                            let window = stage_window(&self.tiles.input, &geometry, pos);
                            for lane in 0..active {
                                let unit = &self.tiles.weights[lane][step.weight_unit];
                                let taps = filter_taps(unit, step.row_tap, config.kernel_size);
                                let sums = window_products(&window, taps);
                                accumulate(&mut self.tiles.outputs[lane][step.cell(row_units)], &sums);
                            }
                        }

                        for lane in 0..active {
                            cursor.filter = lane_group * LANES + lane;
                            let range = self.plan.output_range(&config, &cursor);
                            self.write_back(lane, range, last_pass);
                        }
                    }
                }
            }
        }
    }

    /// Applies ReLU (on the last read pass of a forward invocation) and stores
    /// an output tile.
    fn write_back(&mut self, lane: usize, range: Range<usize>, last_pass: bool) {
        let tile = &mut self.tiles.outputs[lane];
        if self.config.relu && self.config.mode == Mode::Forward && last_pass {
            if let Some(mask) = self.mask.as_deref_mut() {
                relu_forward(&mut tile[..range.len()], &mut mask[range.clone()]);
            }
        }
        store_range(tile, self.output, range);
    }

    fn weight_gradient_pass(&mut self) {
        let config = self.config;
        let geometry = RowGeometry::from(&config);
        let row_units = config.row_units();
        let weight_units = config.burst_channels * config.weight_units();
        let lane_groups = (config.out_channels + LANES - 1) / LANES;

        for read_pass in 0..config.read_passes {
            self.load_inputs(read_pass);

            for lane_group in 0..lane_groups {
                let active = self.active_lanes(lane_group);
                let mut cursor = self.cursor(0, read_pass);
                for lane in 0..active {
                    cursor.filter = lane_group * LANES + lane;
                    let range = self.plan.output_range(&config, &cursor);
                    load_range(&mut self.tiles.outputs[lane], self.output, range);
                }

                for image in 0..config.images {
                    let mut cursor = self.cursor(image, read_pass);
                    for row_tile in 0..config.output_tile_passes {
                        cursor.row_tile = row_tile;
                        for lane in 0..active {
                            cursor.filter = lane_group * LANES + lane;
                            let range = self.plan.weight_range(&config, &cursor);
                            load_range(&mut self.tiles.weights[lane], self.weights, range);
                        }

                        let mut registers = [StagingRegister::<T>::new(); LANES];
                        let steps =
                            backward_order(weight_units, config.kernel_size, config.burst_rows, row_units);
                        for step in steps {
                            let pos = WindowPos {
                                image,
                                weight_unit: step.weight_unit,
                                row_tap: step.row_tap,
                                row: row_tile * config.burst_rows + step.row,
                                column_unit: step.column_unit,
                            };
                            let window = stage_window(&self.tiles.input, &geometry, pos);
                            let commit = accumulate_enabled(step.row_tap, config.kernel_size);
                            let second_unit = config.kernel_size == 5 && step.weight_unit & 1 == 1;

                            for (lane, register) in registers.iter_mut().enumerate().take(active) {
                                let unit = &self.tiles.weights[lane][step.cell(row_units)];
                                let gradient = gradient_lanes(unit, step.column_unit, config.width);
                                let sums = tap_sums(&window, &gradient);
                                register.park(step.row_tap * sums.len(), &sums);
                                if commit {
                                    let packed = register.packed(config.kernel_size, second_unit);
                                    accumulate(&mut self.tiles.outputs[lane][step.weight_unit], &packed);
                                }
                            }
                        }
                    }
                }

                let mut cursor = self.cursor(0, read_pass);
                for lane in 0..active {
                    cursor.filter = lane_group * LANES + lane;
                    let range = self.plan.output_range(&config, &cursor);
                    store_range(&self.tiles.outputs[lane], self.output, range);
                }
            }
        }
    }

    fn dense_pass(&mut self, seed: Seed) {
        let config = self.config;
        let row = config.out_channels / VEC_WIDTH;
        let in_units = config.in_channels / VEC_WIDTH;
        self.load_inputs(0);

        let outputs = &mut self.tiles.outputs[0];
        for image in 0..config.images {
            for unit in 0..row {
                let mut lanes = zero_lanes();
                if seed == Seed::Bias {
                    lanes.copy_from_slice(&self.tiles.bias[unit * VEC_WIDTH..(unit + 1) * VEC_WIDTH]);
                }
                outputs[image * row + unit] = lanes;
            }
        }

        let mut cursor = self.cursor(0, 0);
        for channel in 0..config.in_channels {
            cursor.filter = channel;
            let range = self.plan.weight_range(&config, &cursor);
            load_range(&mut self.tiles.weights[0], self.weights, range);
            for image in 0..config.images {
                let value =
                    self.tiles.input[image * in_units + channel / VEC_WIDTH][channel % VEC_WIDTH];
                for unit in 0..row {
                    let weights = &self.tiles.weights[0][unit];
                    let mut products = zero_lanes();
                    for (product, &weight) in products.iter_mut().zip(weights) {
                        *product = value * weight;
                    }
                    accumulate(&mut self.tiles.outputs[0][image * row + unit], &products);
                }
            }
        }

        for image in 0..config.images {
            let cursor = self.cursor(image, 0);
            let range = self.plan.output_range(&config, &cursor);
            let tile = &mut self.tiles.outputs[0][image * row..(image + 1) * row];
            if config.relu && config.mode == Mode::Forward {
                if let Some(mask) = self.mask.as_deref_mut() {
                    relu_forward(tile, &mut mask[range.clone()]);
                }
            }
            store_range(tile, self.output, range);
        }
    }

    fn dense_weight_gradient_pass(&mut self) {
        let config = self.config;
        let row = config.out_channels / VEC_WIDTH;
        let in_units = config.in_channels / VEC_WIDTH;
        self.load_inputs(0);
        for image in 0..config.images {
            let cursor = self.cursor(image, 0);
            let range = self.plan.weight_range(&config, &cursor);
            load_range(&mut self.tiles.weights[0][image * row..], self.weights, range);
        }

        let mut cursor = self.cursor(0, 0);
        for channel in 0..config.in_channels {
            cursor.filter = channel;
            let range = self.plan.output_range(&config, &cursor);
            load_range(&mut self.tiles.outputs[0], self.output, range.clone());
            for image in 0..config.images {
                let value =
                    self.tiles.input[image * in_units + channel / VEC_WIDTH][channel % VEC_WIDTH];
                for unit in 0..row {
                    let gradient = &self.tiles.weights[0][image * row + unit];
                    let mut products = zero_lanes();
                    for (product, &grad) in products.iter_mut().zip(gradient) {
                        *product = value * grad;
                    }
                    accumulate(&mut self.tiles.outputs[0][unit], &products);
                }
            }
            store_range(&self.tiles.outputs[0], self.output, range);
        }
    }
}

fn tile_sizes(config: &KernelConfig, plan: AccessPlan) -> (usize, usize, usize) {
    let input = config.images * plan.input_range(config, &Cursor::default()).len();
    let row = config.out_channels / VEC_WIDTH;
    let filter_units = config.burst_channels * config.weight_units();
    let row_tile = config.burst_rows * config.row_units();
    match plan {
        AccessPlan::Window { .. } => (input, filter_units, row_tile),
        AccessPlan::WeightGradient => (input, row_tile, filter_units),
        AccessPlan::Dense { .. } => (input, row, config.images * row),
        AccessPlan::DenseWeightGradient => (input, config.images * row, row),
    }
}
