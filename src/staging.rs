//! Access plans and operand staging for the channel-major kernels.
//!
//! An [`AccessPlan`] is chosen once per invocation from the mode and fixes where
//! each external buffer is read and written. The staging functions then turn tile
//! contents into the 16x3 operand windows consumed by the multiply-accumulate stage.

use std::ops::Range;

use crate::{
    buffers::{zero_lanes, Lanes},
    params::{KernelConfig, Mode, VEC_WIDTH},
    KernelElement,
};

/// Taps multiplied per lane and cycle.
pub(crate) const TAPS: usize = 3;
/// Slots of the row window: 2 halo lanes on each side of a 16-lane unit plus a zero slot.
const WINDOW_SLOTS: usize = VEC_WIDTH + 5;

/// Operand window: `window[lane][tap]`.
pub(crate) type Window<T> = [[T; TAPS]; VEC_WIDTH];

/// Source of the initial accumulator value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Seed {
    Bias,
    Zero,
}

/// Position of an invocation step in the external buffers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Cursor {
    /// Absolute image index.
    pub image: usize,
    pub group: usize,
    pub read_pass: usize,
    /// Filter row being streamed: output channel for convolutions, input channel
    /// for dense layers.
    pub filter: usize,
    pub row_tile: usize,
}

/// Addressing of the external buffers for a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessPlan {
    /// Sliding-window convolution (forward or input gradient).
    Window { seed: Seed },
    /// Correlation of activations with output gradients.
    WeightGradient,
    /// Matrix-vector products of a fully-connected layer.
    Dense { seed: Seed },
    /// Outer products of a fully-connected layer.
    DenseWeightGradient,
}

impl AccessPlan {
    pub fn select(config: &KernelConfig) -> Self {
        let seed = match config.mode {
            Mode::Forward => Seed::Bias,
            _ => Seed::Zero,
        };
        match (config.fully_connected, config.mode) {
            (false, Mode::BackwardWeights) => AccessPlan::WeightGradient,
            (false, _) => AccessPlan::Window { seed },
            (true, Mode::BackwardWeights) => AccessPlan::DenseWeightGradient,
            (true, _) => AccessPlan::Dense { seed },
        }
    }

    pub fn is_dense(self) -> bool {
        matches!(self, AccessPlan::Dense { .. } | AccessPlan::DenseWeightGradient)
    }

    /// Region of `input` holding a burst of channels for one image.
    pub fn input_range(self, config: &KernelConfig, cursor: &Cursor) -> Range<usize> {
        if self.is_dense() {
            let len = config.in_channels / VEC_WIDTH;
            let start = cursor.image * len;
            return start..start + len;
        }
        let plane = config.plane_units();
        let channel = (cursor.image * config.groups + cursor.group) * config.in_channels
            + cursor.read_pass * config.burst_channels;
        let start = channel * plane;
        start..start + config.burst_channels * plane
    }

    /// Region of `weights` holding the operand tile of one filter.
    pub fn weight_range(self, config: &KernelConfig, cursor: &Cursor) -> Range<usize> {
        match self {
            AccessPlan::Window { .. } => filter_range(config, cursor),
            AccessPlan::WeightGradient => row_tile_range(config, cursor),
            AccessPlan::Dense { .. } => {
                let len = config.out_channels / VEC_WIDTH;
                cursor.filter * len..(cursor.filter + 1) * len
            }
            AccessPlan::DenseWeightGradient => {
                let len = config.out_channels / VEC_WIDTH;
                cursor.image * len..(cursor.image + 1) * len
            }
        }
    }

    /// Region of `output` accumulated by one filter.
    pub fn output_range(self, config: &KernelConfig, cursor: &Cursor) -> Range<usize> {
        match self {
            AccessPlan::Window { .. } => row_tile_range(config, cursor),
            AccessPlan::WeightGradient => filter_range(config, cursor),
            AccessPlan::Dense { .. } => {
                let len = config.out_channels / VEC_WIDTH;
                cursor.image * len..(cursor.image + 1) * len
            }
            AccessPlan::DenseWeightGradient => {
                let len = config.out_channels / VEC_WIDTH;
                cursor.filter * len..(cursor.filter + 1) * len
            }
        }
    }

    /// Region of the activation mask consulted by the invocation: output positions
    /// for the forward pass, input positions for backward passes.
    pub fn mask_range(self, config: &KernelConfig, cursor: &Cursor) -> Range<usize> {
        if config.mode.is_backward() {
            self.input_range(config, cursor)
        } else {
            self.output_range(config, cursor)
        }
    }

    /// Cursor addressing the last position touched by an invocation. All ranges
    /// are monotonic in every cursor field, so lengths of external buffers can be checked
    /// against the ranges of this cursor.
    pub fn last_cursor(self, config: &KernelConfig, group: usize, image_block: usize) -> Cursor {
        let filter = match self {
            AccessPlan::Dense { .. } | AccessPlan::DenseWeightGradient => config.in_channels - 1,
            _ => config.out_channels - 1,
        };
        Cursor {
            image: image_block * config.images + config.images - 1,
            group,
            read_pass: config.read_passes - 1,
            filter,
            row_tile: config.output_tile_passes - 1,
        }
    }
}

fn filter_range(config: &KernelConfig, cursor: &Cursor) -> Range<usize> {
    let units = config.weight_units();
    let filter = cursor.filter + config.out_channels * cursor.group;
    let start = (filter * config.in_channels + cursor.read_pass * config.burst_channels) * units;
    start..start + config.burst_channels * units
}

fn row_tile_range(config: &KernelConfig, cursor: &Cursor) -> Range<usize> {
    let row_units = config.row_units();
    let channel = cursor.image * config.total_out_channels()
        + cursor.filter
        + config.out_channels * cursor.group;
    let start = (channel * config.height + cursor.row_tile * config.burst_rows) * row_units;
    start..start + config.burst_rows * row_units
}

/// Geometry of the input tile.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RowGeometry {
    pub height: usize,
    pub width: usize,
    pub row_units: usize,
    pub kernel_size: usize,
    pub channels: usize,
}

impl From<&KernelConfig> for RowGeometry {
    fn from(config: &KernelConfig) -> Self {
        Self {
            height: config.height,
            width: config.width,
            row_units: config.row_units(),
            kernel_size: config.kernel_size,
            channels: config.burst_channels,
        }
    }
}

/// Position of a staged window inside the input tile.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowPos {
    /// Image within the invocation.
    pub image: usize,
    /// Weight unit; for 5x5 filters, two consecutive units share a channel.
    pub weight_unit: usize,
    pub row_tap: usize,
    /// Absolute output row.
    pub row: usize,
    pub column_unit: usize,
}

/// Stages the operand window for 16 consecutive output columns.
///
/// Lane `p`, tap `q` holds column `16 * column_unit + p + q + shift - 2` of the row
/// `row + row_tap - kernel_size / 2`, where `shift` selects the columns covered by the weight
/// unit. Rows and columns outside of the map, as well as slots beyond the two-lane halo,
/// read as zero.
pub(crate) fn stage_window<T: KernelElement>(
    tile: &[Lanes<T>],
    geometry: &RowGeometry,
    pos: WindowPos,
) -> Window<T> {
    let mut window = [[T::ZERO; TAPS]; VEC_WIDTH];
    let (channel, shift) = match (geometry.kernel_size, pos.weight_unit & 1) {
        (5, 0) => (pos.weight_unit >> 1, 0),
        (5, _) => (pos.weight_unit >> 1, 3),
        _ => (pos.weight_unit, 1),
    };
    let row = match (pos.row + pos.row_tap).checked_sub(geometry.kernel_size / 2) {
        Some(row) if row < geometry.height && channel < geometry.channels => row,
        _ => return window,
    };

    let base = ((pos.image * geometry.channels + channel) * geometry.height + row)
        * geometry.row_units;
    let row_len = geometry.width.min(geometry.row_units * VEC_WIDTH);
    let origin = pos.column_unit * VEC_WIDTH;
    for (lane, taps) in window.iter_mut().enumerate() {
        for (tap, value) in taps.iter_mut().enumerate() {
            let slot = lane + tap + shift;
            if slot >= WINDOW_SLOTS - 1 {
                continue;
            }
            if let Some(column) = (origin + slot).checked_sub(2) {
                if column < row_len {
                    *value = tile[base + column / VEC_WIDTH][column % VEC_WIDTH];
                }
            }
        }
    }
    window
}

/// Weights for row tap `row_tap` of a packed filter unit, broadcast to all lanes.
pub(crate) fn filter_taps<T: KernelElement>(
    unit: &Lanes<T>,
    row_tap: usize,
    kernel_size: usize,
) -> [T; TAPS] {
    if kernel_size == 1 {
        [T::ZERO, unit[0], T::ZERO]
    } else {
        let base = row_tap * TAPS;
        [unit[base], unit[base + 1], unit[base + 2]]
    }
}

/// Output gradient lanes for a column unit; lanes beyond the map width are zeroed.
pub(crate) fn gradient_lanes<T: KernelElement>(
    unit: &Lanes<T>,
    column_unit: usize,
    width: usize,
) -> Lanes<T> {
    let mut lanes = zero_lanes();
    for (lane, value) in lanes.iter_mut().enumerate() {
        if column_unit * VEC_WIDTH + lane < width {
            *value = unit[lane];
        }
    }
    lanes
}
