//! Host-side tensors and their packing into the vector-unit buffers read by the kernels.

use ndarray::{Array2, Array4, ArrayView2, ArrayView4};

use crate::{params::VEC_WIDTH, KernelElement};

/// Addressable vector unit: 16 scalars moved and multiplied together.
pub type Lanes<T> = [T; VEC_WIDTH];

/// Replicates `value` across all lanes.
pub fn splat<T: Copy>(value: T) -> Lanes<T> {
    [value; VEC_WIDTH]
}

pub(crate) fn zero_lanes<T: KernelElement>() -> Lanes<T> {
    [T::ZERO; VEC_WIDTH]
}

/// Shape of a [`FeatureMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureMapShape {
    /// Number of samples constituting the map.
    pub batch_size: usize,
    /// Number of channels.
    pub channels: usize,
    /// Spatial height.
    pub height: usize,
    /// Spatial width.
    pub width: usize,
}

impl FeatureMapShape {
    fn from_slice(shape: &[usize], layout: Layout) -> Self {
        assert_eq!(shape.len(), 4);
        match layout {
            Layout::ChannelsFirst => Self {
                batch_size: shape[0],
                channels: shape[1],
                height: shape[2],
                width: shape[3],
            },
            Layout::ChannelsLast => Self {
                batch_size: shape[0],
                height: shape[1],
                width: shape[2],
                channels: shape[3],
            },
        }
    }

    /// Returns dimensions in the NCHW order.
    pub fn as_nchw(self) -> [usize; 4] {
        [self.batch_size, self.channels, self.height, self.width]
    }
}

/// Memory layout of a [`FeatureMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// `NCHW` / "channels-first" layout.
    ChannelsFirst,
    /// `NHWC` / "channels-last" layout.
    ChannelsLast,
}

/// Feature map, i.e., a signal, an activation or a gradient tensor.
///
/// A thin wrapper around [`ArrayView4`] that additionally indicates the memory layout
/// of the map. Outputs of the layers are always returned in the layout of the corresponding
/// input map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMap<'a> {
    layout: Layout,
    inner: ArrayView4<'a, f32>,
    shape: FeatureMapShape,
}

impl<'a> FeatureMap<'a> {
    /// Constructs a map from an NCHW-ordered tensor.
    pub fn nchw(array: impl Into<ArrayView4<'a, f32>>) -> Self {
        let array = array.into();
        Self {
            layout: Layout::ChannelsFirst,
            shape: FeatureMapShape::from_slice(array.shape(), Layout::ChannelsFirst),
            inner: array,
        }
    }

    /// Constructs a map from an NHWC-ordered tensor.
    pub fn nhwc(array: impl Into<ArrayView4<'a, f32>>) -> Self {
        let array = array.into();
        Self {
            layout: Layout::ChannelsLast,
            shape: FeatureMapShape::from_slice(array.shape(), Layout::ChannelsLast),
            inner: array,
        }
    }

    /// Gets the layout of this map.
    pub fn layout(self) -> Layout {
        self.layout
    }

    /// Gets the shape of this map.
    pub fn shape(self) -> FeatureMapShape {
        self.shape
    }

    pub(crate) fn to_nchw(self) -> ArrayView4<'a, f32> {
        match self.layout {
            Layout::ChannelsFirst => self.inner,
            Layout::ChannelsLast => self.inner.permuted_axes([0, 3, 1, 2]),
        }
    }
}

/// Converts an NCHW tensor into the given layout.
pub(crate) fn from_nchw(array: Array4<f32>, layout: Layout) -> Array4<f32> {
    match layout {
        Layout::ChannelsFirst => array,
        Layout::ChannelsLast => array.permuted_axes([0, 2, 3, 1]).as_standard_layout().to_owned(),
    }
}

/// Packs an NCHW tensor into the channel-major tiled layout. Each row is padded with zeros
/// to `2 * tile_pad` scalars.
///
/// # Panics
///
/// Panics if `tile_pad` is not a positive multiple of 8 or rows do not fit.
pub fn pack_tiled<T: KernelElement>(signal: ArrayView4<'_, f32>, tile_pad: usize) -> Vec<Lanes<T>> {
    assert!(tile_pad > 0 && tile_pad % 8 == 0, "Invalid tile padding");
    let row_units = tile_pad / 8;
    let (images, channels, height, width) = signal.dim();
    assert!(width <= row_units * VEC_WIDTH, "Rows do not fit the padded tile");

    let mut buffer = vec![zero_lanes::<T>(); images * channels * height * row_units];
    for ((image, channel, y, x), &value) in signal.indexed_iter() {
        let unit = ((image * channels + channel) * height + y) * row_units + x / VEC_WIDTH;
        buffer[unit][x % VEC_WIDTH] = T::from_f32(value);
    }
    buffer
}

fn unpack_tiled_with<U: Copy, V>(
    buffer: &[Lanes<U>],
    shape: [usize; 4],
    tile_pad: usize,
    map: impl Fn(U) -> V,
) -> Array4<V> {
    let row_units = tile_pad / 8;
    let [images, channels, height, width] = shape;
    assert!(width <= row_units * VEC_WIDTH, "Rows do not fit the padded tile");
    assert!(
        buffer.len() >= images * channels * height * row_units,
        "Buffer is too short for the requested shape"
    );

    Array4::from_shape_fn(shape, |(image, channel, y, x)| {
        let unit = ((image * channels + channel) * height + y) * row_units + x / VEC_WIDTH;
        map(buffer[unit][x % VEC_WIDTH])
    })
}

/// Unpacks a channel-major tiled buffer into an NCHW tensor of the given `shape`.
///
/// # Panics
///
/// Panics if the buffer is too short.
pub fn unpack_tiled<T: KernelElement>(
    buffer: &[Lanes<T>],
    shape: [usize; 4],
    tile_pad: usize,
) -> Array4<f32> {
    unpack_tiled_with(buffer, shape, tile_pad, T::to_f32)
}

/// Unpacks a byte-per-element activation mask stored in the channel-major tiled layout.
pub fn unpack_tiled_mask(mask: &[Lanes<u8>], shape: [usize; 4], tile_pad: usize) -> Array4<bool> {
    unpack_tiled_with(mask, shape, tile_pad, |flag| flag != 0)
}

fn filter_slot(kernel_size: usize, y: usize, x: usize) -> (usize, usize) {
    match kernel_size {
        1 => (0, 0),
        3 => (0, y * 3 + x),
        5 if x < 3 => (0, y * 3 + x),
        5 => (1, y * 3 + x - 3),
        _ => unreachable!("Unsupported kernel size"),
    }
}

/// Packs `[out, in, k, k]` filters for the channel-major kernels.
///
/// A 1x1 or 3x3 filter occupies a single unit per (output, input) channel pair, with tap
/// `(y, x)` at lane `3 * y + x` (lane 0 for 1x1 filters). A 5x5 filter occupies two units:
/// the first one holds columns 0..3 at lanes `3 * y + x`, the second one columns 3..5
/// at lanes `3 * y + x - 3`. All other lanes are zero.
///
/// # Panics
///
/// Panics if the filters are not square or have unsupported size.
pub fn pack_filters<T: KernelElement>(filters: ArrayView4<'_, f32>) -> Vec<Lanes<T>> {
    let (outputs, inputs, kernel_size, kernel_w) = filters.dim();
    assert_eq!(kernel_size, kernel_w, "Filters must be square");
    assert!(
        [1, 3, 5].contains(&kernel_size),
        "Unsupported kernel size {}",
        kernel_size
    );
    let units = if kernel_size == 5 { 2 } else { 1 };

    let mut buffer = vec![zero_lanes::<T>(); outputs * inputs * units];
    for ((output, input, y, x), &value) in filters.indexed_iter() {
        let (unit, lane) = filter_slot(kernel_size, y, x);
        buffer[(output * inputs + input) * units + unit][lane] = T::from_f32(value);
    }
    buffer
}

/// Inverse of [`pack_filters()`]. Also used to unpack weight gradients, which share
/// the packed filter layout.
pub fn unpack_filters<T: KernelElement>(buffer: &[Lanes<T>], shape: [usize; 4]) -> Array4<f32> {
    let [outputs, inputs, kernel_size, _] = shape;
    assert!(
        [1, 3, 5].contains(&kernel_size),
        "Unsupported kernel size {}",
        kernel_size
    );
    let units = if kernel_size == 5 { 2 } else { 1 };
    assert!(
        buffer.len() >= outputs * inputs * units,
        "Buffer is too short for the requested shape"
    );

    Array4::from_shape_fn(shape, |(output, input, y, x)| {
        let (unit, lane) = filter_slot(kernel_size, y, x);
        buffer[(output * inputs + input) * units + unit][lane].to_f32()
    })
}

/// Transforms `[out, in, k, k]` filters of a grouped convolution into the filters
/// of the corresponding input-gradient convolution: `[in, out, k, k]` per group with
/// spatially flipped taps.
///
/// # Panics
///
/// Panics if the number of filters is not divisible by `groups`.
pub fn flip_filters(filters: ArrayView4<'_, f32>, groups: usize) -> Array4<f32> {
    let (outputs, inputs, kernel_h, kernel_w) = filters.dim();
    assert_eq!(outputs % groups, 0, "Filter count must be divisible by groups");
    let group_outputs = outputs / groups;

    Array4::from_shape_fn(
        [inputs * groups, group_outputs, kernel_h, kernel_w],
        |(input, output, y, x)| {
            let group = input / inputs;
            filters[[
                group * group_outputs + output,
                input % inputs,
                kernel_h - 1 - y,
                kernel_w - 1 - x,
            ]]
        },
    )
}

/// Packs an NCHW tensor into the HWCN layout: images are the innermost axis, packed
/// 16 per vector unit.
///
/// # Panics
///
/// Panics if the batch size is not divisible by 16.
pub fn pack_hwcn<T: KernelElement>(signal: ArrayView4<'_, f32>) -> Vec<Lanes<T>> {
    let (images, channels, height, width) = signal.dim();
    assert_eq!(images % VEC_WIDTH, 0, "Batch size must be divisible by 16");
    let image_units = images / VEC_WIDTH;

    let mut buffer = vec![zero_lanes::<T>(); height * width * channels * image_units];
    for ((image, channel, y, x), &value) in signal.indexed_iter() {
        let unit = ((y * width + x) * channels + channel) * image_units + image / VEC_WIDTH;
        buffer[unit][image % VEC_WIDTH] = T::from_f32(value);
    }
    buffer
}

fn unpack_hwcn_with<V>(shape: [usize; 4], get: impl Fn(usize, usize) -> V) -> Array4<V> {
    let [images, channels, _, width] = shape;
    let image_units = images / VEC_WIDTH;
    Array4::from_shape_fn(shape, |(image, channel, y, x)| {
        let unit = ((y * width + x) * channels + channel) * image_units + image / VEC_WIDTH;
        get(unit, image % VEC_WIDTH)
    })
}

/// Unpacks an HWCN buffer into an NCHW tensor of the given `shape`.
///
/// # Panics
///
/// Panics if the buffer is too short.
pub fn unpack_hwcn<T: KernelElement>(buffer: &[Lanes<T>], shape: [usize; 4]) -> Array4<f32> {
    assert!(
        buffer.len() * VEC_WIDTH >= shape.iter().product(),
        "Buffer is too short for the requested shape"
    );
    unpack_hwcn_with(shape, |unit, lane| buffer[unit][lane].to_f32())
}

/// Unpacks an HWCN activation mask (one bit per image in each `u16` word).
pub fn unpack_hwcn_mask(mask: &[u16], shape: [usize; 4]) -> Array4<bool> {
    assert!(
        mask.len() * VEC_WIDTH >= shape.iter().product(),
        "Mask is too short for the requested shape"
    );
    unpack_hwcn_with(shape, |unit, lane| mask[unit] & (1 << lane) != 0)
}

fn hwcn_filter_slot(burst_channels: usize, channel: usize) -> (usize, usize, usize) {
    let sublane_channels = burst_channels / 4;
    let burst = channel / burst_channels;
    let within = channel % burst_channels;
    let (sublane, offset) = (within / sublane_channels, within % sublane_channels);
    let packed = 4 * offset + sublane;
    (burst, packed / VEC_WIDTH, packed % VEC_WIDTH)
}

/// Packs `[out, in, k, k]` filters for the HWCN kernel.
///
/// Units are ordered as `[out][burst][tap][unit]`. Within a burst, channels are split into
/// 4 sub-lanes of `burst_channels / 4` channels each; channel `w` of sub-lane `m` is stored
/// at packed position `4 * w + m`.
///
/// # Panics
///
/// Panics if `burst_channels` is not a multiple of 16 or does not divide
/// the number of input channels.
pub fn pack_hwcn_filters<T: KernelElement>(
    filters: ArrayView4<'_, f32>,
    burst_channels: usize,
) -> Vec<Lanes<T>> {
    let (outputs, inputs, kernel_size, _) = filters.dim();
    assert_eq!(burst_channels % VEC_WIDTH, 0, "Bursts must contain 16k channels");
    assert_eq!(inputs % burst_channels, 0, "Bursts must divide input channels");
    let taps = kernel_size * kernel_size;
    let burst_units = burst_channels / VEC_WIDTH;
    let channel_units = inputs / VEC_WIDTH;

    let mut buffer = vec![zero_lanes::<T>(); outputs * taps * channel_units];
    for ((output, input, y, x), &value) in filters.indexed_iter() {
        let (burst, unit, lane) = hwcn_filter_slot(burst_channels, input);
        let tap = y * kernel_size + x;
        let index =
            output * taps * channel_units + burst * taps * burst_units + tap * burst_units + unit;
        buffer[index][lane] = T::from_f32(value);
    }
    buffer
}

/// Inverse of [`pack_hwcn_filters()`].
pub fn unpack_hwcn_filters<T: KernelElement>(
    buffer: &[Lanes<T>],
    shape: [usize; 4],
    burst_channels: usize,
) -> Array4<f32> {
    let [outputs, inputs, kernel_size, _] = shape;
    let taps = kernel_size * kernel_size;
    let burst_units = burst_channels / VEC_WIDTH;
    let channel_units = inputs / VEC_WIDTH;
    assert!(
        buffer.len() >= outputs * taps * channel_units,
        "Buffer is too short for the requested shape"
    );

    Array4::from_shape_fn(shape, |(output, input, y, x)| {
        let (burst, unit, lane) = hwcn_filter_slot(burst_channels, input);
        let tap = y * kernel_size + x;
        let index =
            output * taps * channel_units + burst * taps * burst_units + tap * burst_units + unit;
        buffer[index][lane].to_f32()
    })
}

/// Packs a row-major matrix with rows split into 16-lane units.
///
/// # Panics
///
/// Panics if the number of columns is not divisible by 16.
pub fn pack_rows<T: KernelElement>(matrix: ArrayView2<'_, f32>) -> Vec<Lanes<T>> {
    let (rows, columns) = matrix.dim();
    assert_eq!(columns % VEC_WIDTH, 0, "Row length must be divisible by 16");
    let row_units = columns / VEC_WIDTH;

    let mut buffer = vec![zero_lanes::<T>(); rows * row_units];
    for ((row, column), &value) in matrix.indexed_iter() {
        buffer[row * row_units + column / VEC_WIDTH][column % VEC_WIDTH] = T::from_f32(value);
    }
    buffer
}

/// Inverse of [`pack_rows()`].
pub fn unpack_rows<T: KernelElement>(buffer: &[Lanes<T>], shape: [usize; 2]) -> Array2<f32> {
    let [rows, columns] = shape;
    let row_units = columns / VEC_WIDTH;
    assert!(buffer.len() >= rows * row_units, "Buffer is too short");
    Array2::from_shape_fn(shape, |(row, column)| {
        buffer[row * row_units + column / VEC_WIDTH][column % VEC_WIDTH].to_f32()
    })
}

/// Unpacks a byte-per-element row-major mask.
pub fn unpack_rows_mask(mask: &[Lanes<u8>], shape: [usize; 2]) -> Array2<bool> {
    let [rows, columns] = shape;
    let row_units = columns / VEC_WIDTH;
    assert!(mask.len() >= rows * row_units, "Mask is too short");
    Array2::from_shape_fn(shape, |(row, column)| {
        mask[row * row_units + column / VEC_WIDTH][column % VEC_WIDTH] != 0
    })
}
