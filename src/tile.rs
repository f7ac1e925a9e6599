//! On-chip tile buffers and burst transfers between them and the external buffers.

use std::ops::Range;

use crate::{
    buffers::{splat, zero_lanes, Lanes},
    KernelElement,
};

/// Tiles owned by a single kernel invocation. `weights` and `outputs` hold one tile
/// per output lane processed in parallel.
#[derive(Debug)]
pub(crate) struct TileBuffers<T> {
    pub input: Vec<Lanes<T>>,
    pub weights: Vec<Vec<Lanes<T>>>,
    pub outputs: Vec<Vec<Lanes<T>>>,
    pub bias: Vec<T>,
}

impl<T: KernelElement> TileBuffers<T> {
    pub fn new(lanes: usize, input_units: usize, weight_units: usize, output_units: usize) -> Self {
        Self {
            input: vec![zero_lanes(); input_units],
            weights: vec![vec![zero_lanes(); weight_units]; lanes],
            outputs: vec![vec![zero_lanes(); output_units]; lanes],
            bias: Vec::new(),
        }
    }

    /// Copies the bias slice of the current group.
    pub fn load_bias(&mut self, bias: &[T]) {
        self.bias.clear();
        self.bias.extend_from_slice(bias);
    }

    /// Fills an output tile with the bias of `channel` replicated across all lanes.
    pub fn seed_bias(&mut self, lane: usize, channel: usize) {
        let value = self.bias.get(channel).copied().unwrap_or(T::ZERO);
        self.outputs[lane].iter_mut().for_each(|unit| *unit = splat(value));
    }

    /// Fills an output tile with zeros.
    pub fn seed_zero(&mut self, lane: usize) {
        self.outputs[lane].iter_mut().for_each(|unit| *unit = zero_lanes());
    }
}

/// Reads a burst of `dst.len()` units starting at `offset`.
pub(crate) fn load_burst<U: Copy>(dst: &mut [U], src: &[U], offset: usize) {
    dst.copy_from_slice(&src[offset..offset + dst.len()]);
}

/// Writes a burst of `src.len()` units starting at `offset`.
pub(crate) fn store_burst<U: Copy>(src: &[U], dst: &mut [U], offset: usize) {
    dst[offset..offset + src.len()].copy_from_slice(src);
}

/// Reads the region `range` of an external buffer into the beginning of a tile.
pub(crate) fn load_range<U: Copy>(tile: &mut [U], src: &[U], range: Range<usize>) {
    load_burst(&mut tile[..range.len()], src, range.start);
}

/// Writes the beginning of a tile to the region `range` of an external buffer.
pub(crate) fn store_range<U: Copy>(tile: &[U], dst: &mut [U], range: Range<usize>) {
    store_burst(&tile[..range.len()], dst, range.start);
}
