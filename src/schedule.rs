//! Iteration order of the multiply-accumulate stage.
//!
//! The hardware drives the MAC pipeline with a flat counter that is decomposed into
//! loop indices. Here, the same visiting order is produced by nested loops. Iterations
//! that the hardware adds only to cover adder latency touch accumulator cells that are
//! never written back, so they are omitted.

use std::ops::Range;

/// Step of a channel-major invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TileStep {
    pub weight_unit: usize,
    pub row_tap: usize,
    /// Row within the output tile.
    pub row: usize,
    pub column_unit: usize,
}

impl TileStep {
    /// Index of the output (or gradient) unit touched by the step within a row tile.
    pub fn cell(&self, row_units: usize) -> usize {
        self.row * row_units + self.column_unit
    }
}

/// Forward order, outer to inner: weight unit, row tap, row, column unit.
pub(crate) fn forward_order(
    weight_units: usize,
    kernel_size: usize,
    rows: usize,
    row_units: usize,
) -> impl Iterator<Item = TileStep> {
    (0..weight_units).flat_map(move |weight_unit| {
        (0..kernel_size).flat_map(move |row_tap| {
            (0..rows).flat_map(move |row| {
                (0..row_units).map(move |column_unit| TileStep {
                    weight_unit,
                    row_tap,
                    row,
                    column_unit,
                })
            })
        })
    })
}

/// Weight-gradient order, outer to inner: row, column unit, weight unit, row tap.
/// Row taps are innermost, so that the partial sums of a cell are complete when
/// the last tap is reduced.
pub(crate) fn backward_order(
    weight_units: usize,
    kernel_size: usize,
    rows: usize,
    row_units: usize,
) -> impl Iterator<Item = TileStep> {
    (0..rows).flat_map(move |row| {
        (0..row_units).flat_map(move |column_unit| {
            (0..weight_units).flat_map(move |weight_unit| {
                (0..kernel_size).map(move |row_tap| TileStep {
                    weight_unit,
                    row_tap,
                    row,
                    column_unit,
                })
            })
        })
    })
}

/// Step of an HWCN invocation at a fixed output pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PixelStep {
    /// Filter row.
    pub tap_row: usize,
    /// Filter column.
    pub tap_col: usize,
    /// Channel within a sub-lane.
    pub channel: usize,
    pub image_unit: usize,
}

/// HWCN forward order, outer to inner: filter row, filter column, channel, image unit.
pub(crate) fn pixel_forward_order(
    tap_rows: Range<usize>,
    tap_cols: Range<usize>,
    channels: usize,
    image_units: usize,
) -> impl Iterator<Item = PixelStep> {
    tap_rows.flat_map(move |tap_row| {
        tap_cols.clone().flat_map(move |tap_col| {
            (0..channels).flat_map(move |channel| {
                (0..image_units).map(move |image_unit| PixelStep {
                    tap_row,
                    tap_col,
                    channel,
                    image_unit,
                })
            })
        })
    })
}

/// HWCN weight-gradient order, outer to inner: image unit, filter row, filter column,
/// channel. Consecutive channels fill one weight unit.
pub(crate) fn pixel_backward_order(
    tap_rows: Range<usize>,
    tap_cols: Range<usize>,
    channels: usize,
    image_units: usize,
) -> impl Iterator<Item = PixelStep> {
    (0..image_units).flat_map(move |image_unit| {
        let tap_cols = tap_cols.clone();
        tap_rows.clone().flat_map(move |tap_row| {
            tap_cols.clone().flat_map(move |tap_col| {
                (0..channels).map(move |channel| PixelStep {
                    tap_row,
                    tap_col,
                    channel,
                    image_unit,
                })
            })
        })
    })
}
