//! Max-pooling over the HWCN layout.

use log::{debug, trace};

use std::ops::Range;

use crate::{
    buffers::{splat, zero_lanes, Lanes},
    half::max_with_index,
    params::{check_len, ConfigError, PoolConfig, VEC_WIDTH},
    tile::{load_range, store_range},
    Half,
};

/// Window slots; a 2x2 window uses the top-left corner of the 3x3 grid.
const SLOTS: usize = 9;
const GRID: usize = 3;
const STRIDE: usize = 2;

/// External buffers of a pooling invocation.
#[derive(Debug)]
pub struct PoolArgs<'a> {
    /// Activations (forward) or gradients w.r.t. the pooled output (backward).
    pub input: &'a [Lanes<Half>],
    /// Pooled activations (forward) or gradients w.r.t. the activations (backward).
    pub output: &'a mut [Lanes<Half>],
    /// Index of the winning window slot (`3 * h + w`) for each pooled element.
    /// Written by the forward pass and read by the backward pass.
    pub argmax: &'a mut [Lanes<u8>],
}

/// Max-pooling with stride 2 over the HWCN layout, forward or backward.
///
/// The forward pass reduces each window with a fixed 9-way tree and records the winning
/// slot; on ties, the slot with the lower index wins. The backward pass routes each pooled
/// gradient to the recorded slot; gradients routed to a position shared by overlapping
/// windows are summed.
///
/// # Errors
///
/// Returns an error if the configuration is out of bounds or any of the buffers is too
/// short.
pub fn pool_layer_hwcn_half(args: PoolArgs<'_>, config: &PoolConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let layout = PoolLayout { config: *config };
    let (pooled, unpooled) = (layout.pooled_units(), layout.unpooled_units());
    if config.common.mode.is_backward() {
        check_len("input", pooled, args.input.len())?;
        check_len("argmax", pooled, args.argmax.len())?;
        check_len("output", unpooled, args.output.len())?;
    } else {
        check_len("input", unpooled, args.input.len())?;
        check_len("output", pooled, args.output.len())?;
        check_len("argmax", pooled, args.argmax.len())?;
    }

    debug!(
        "pool_layer_hwcn_half invocation: mode={:?}, pool_size={}, pooled={}x{}",
        config.common.mode,
        config.pool_size,
        config.output_height(),
        config.output_width()
    );
    if config.common.mode.is_backward() {
        pool_backward(args, layout);
    } else {
        pool_forward(args, layout);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct PoolLayout {
    config: PoolConfig,
}

impl PoolLayout {
    fn burst_units(&self) -> usize {
        self.config.common.burst_channels * self.config.image_units()
    }

    fn units(&self, height: usize, width: usize) -> usize {
        height * width * self.config.common.in_channels * self.config.image_units()
    }

    fn pooled_units(&self) -> usize {
        self.units(self.config.output_height(), self.config.output_width())
    }

    fn unpooled_units(&self) -> usize {
        self.units(self.config.common.height, self.config.common.width)
    }

    fn burst_range(&self, y: usize, x: usize, width: usize, read_pass: usize) -> Range<usize> {
        let common = &self.config.common;
        let channel = (y * width + x) * common.in_channels + read_pass * common.burst_channels;
        let start = channel * self.config.image_units();
        start..start + self.burst_units()
    }

    /// Burst of the activation map at `(y, x)`, or `None` if the slot `(h, w)` of the window
    /// is outside of the window or of the map.
    fn window_range(&self, ph: usize, pw: usize, h: usize, w: usize, read_pass: usize) -> Option<Range<usize>> {
        let common = &self.config.common;
        let (y, x) = (ph * STRIDE + h, pw * STRIDE + w);
        let inside = h < self.config.pool_size
            && w < self.config.pool_size
            && y < common.height
            && x < common.width;
        if inside {
            Some(self.burst_range(y, x, common.width, read_pass))
        } else {
            None
        }
    }

    fn pooled_range(&self, ph: usize, pw: usize, read_pass: usize) -> Range<usize> {
        self.burst_range(ph, pw, self.config.output_width(), read_pass)
    }

    /// Checks whether slot `(h, w)` of window `(ph, pw)` is covered by an earlier window.
    fn is_shared(&self, ph: usize, pw: usize, h: usize, w: usize) -> bool {
        self.config.pool_size == GRID && ((h == 0 && ph > 0) || (w == 0 && pw > 0))
    }
}

/// 9-way max tree: pairs of adjacent slots, then pairs of pairs, then the last slot.
fn max9(taps: [Half; SLOTS]) -> (Half, u8) {
    let mut stage = [(Half::ZERO, 0_u8); 4];
    for (i, value) in stage.iter_mut().enumerate() {
        let (left, right) = (2 * i, 2 * i + 1);
        *value = max_with_index((taps[left], left as u8), (taps[right], right as u8));
    }
    let left = max_with_index(stage[0], stage[1]);
    let right = max_with_index(stage[2], stage[3]);
    let inner = max_with_index(left, right);
    max_with_index(inner, (taps[8], 8))
}

fn pool_forward(args: PoolArgs<'_>, layout: PoolLayout) {
    let config = layout.config;
    let burst_units = layout.burst_units();
    let mut windows = vec![vec![zero_lanes::<Half>(); burst_units]; SLOTS];
    let mut pooled = vec![zero_lanes::<Half>(); burst_units];
    let mut argmax = vec![[0_u8; 16]; burst_units];

    for ph in 0..config.output_height() {
        for pw in 0..config.output_width() {
            for read_pass in 0..config.common.read_passes {
                for (slot, window) in windows.iter_mut().enumerate() {
                    let (h, w) = (slot / GRID, slot % GRID);
                    match layout.window_range(ph, pw, h, w, read_pass) {
                        Some(range) => load_range(window, args.input, range),
                        None => window.iter_mut().for_each(|unit| *unit = splat(Half::POOL_SENTINEL)),
                    }
                }

                for (unit, (value, index)) in pooled.iter_mut().zip(&mut argmax).enumerate() {
                    for lane in 0..VEC_WIDTH {
                        let mut taps = [Half::ZERO; SLOTS];
                        for (tap, window) in taps.iter_mut().zip(&windows) {
                            *tap = window[unit][lane];
                        }
                        let (max, slot) = max9(taps);
                        value[lane] = max;
                        index[lane] = slot;
                    }
                }

                let range = layout.pooled_range(ph, pw, read_pass);
                store_range(&pooled, args.output, range.clone());
                store_range(&argmax, args.argmax, range);
            }
        }
        trace!("pooled row {}", ph);
    }
}

fn pool_backward(args: PoolArgs<'_>, layout: PoolLayout) {
    let config = layout.config;
    let burst_units = layout.burst_units();
    let mut windows = vec![vec![zero_lanes::<Half>(); burst_units]; SLOTS];
    let mut gradient = vec![zero_lanes::<Half>(); burst_units];
    let mut argmax = vec![[0_u8; 16]; burst_units];

    for ph in 0..config.output_height() {
        for pw in 0..config.output_width() {
            for read_pass in 0..config.common.read_passes {
                let range = layout.pooled_range(ph, pw, read_pass);
                load_range(&mut gradient, args.input, range.clone());
                load_range(&mut argmax, args.argmax, range);

                for (slot, window) in windows.iter_mut().enumerate() {
                    let (h, w) = (slot / GRID, slot % GRID);
                    match layout.window_range(ph, pw, h, w, read_pass) {
                        Some(range) if layout.is_shared(ph, pw, h, w) => {
                            load_range(window, args.output, range);
                        }
                        _ => window.iter_mut().for_each(|unit| *unit = zero_lanes()),
                    }
                }

                for (unit, (values, slots)) in gradient.iter().zip(&argmax).enumerate() {
                    for (lane, (&value, &slot)) in values.iter().zip(slots).enumerate() {
                        if let Some(window) = windows.get_mut(usize::from(slot)) {
                            window[unit][lane] += value;
                        }
                    }
                }

                for (slot, window) in windows.iter().enumerate() {
                    let (h, w) = (slot / GRID, slot % GRID);
                    if let Some(range) = layout.window_range(ph, pw, h, w, read_pass) {
                        store_range(window, args.output, range);
                    }
                }
            }
        }
        trace!("routed gradients of pooled row {}", ph);
    }
}
