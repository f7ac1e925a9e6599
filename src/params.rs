//! Kernel configuration and its validation.

use thiserror::Error;

/// Number of scalar lanes in a vector unit.
pub const VEC_WIDTH: usize = 16;

/// Capacity of the on-chip input tile, in vector units.
pub const INPUT_TILE_UNITS: usize = 8 * 256 * 16;
/// Capacity of the input tile of the single-precision direct kernel, in vector units.
pub const DIRECT_INPUT_TILE_UNITS: usize = 256 * 16;
/// Capacity of a per-lane weight or output tile, in vector units.
pub const LANE_TILE_UNITS: usize = 512;
/// Capacity of the on-chip bias buffer, in scalars.
pub const BIAS_CAPACITY: usize = 1024;

/// Capacity of a per-sub-lane input tile of the HWCN kernel, in vector units.
pub const HWCN_INPUT_TILE_UNITS: usize = 2 * 256 * 16;
/// Capacity of the weight and output tiles of the HWCN kernel, in vector units.
pub const HWCN_LANE_TILE_UNITS: usize = 256;
/// Capacity of the pooling window buffers, in vector units.
pub const POOL_TILE_UNITS: usize = 256;

/// Direction of a kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Forward pass: `output = bias + conv(input, weights)`, optionally followed by ReLU.
    Forward,
    /// Weight gradient: correlates activations (`input`) with output gradients
    /// (`weights`) and accumulates the result into `output`.
    BackwardWeights,
    /// Input gradient: convolves output gradients (`input`) with flipped
    /// and transposed filters (`weights`).
    BackwardInput,
}

impl Mode {
    /// Returns `true` for both backward modes.
    pub fn is_backward(self) -> bool {
        self != Mode::Forward
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Forward
    }
}

/// Errors signalled by configuration and buffer checks.
///
/// All checks are performed before a kernel writes to any of its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A parameter lies outside of its supported range.
    #[error("`{name}` = {value} is outside of the supported range {min}..={max}")]
    OutOfRange {
        /// Parameter name.
        name: &'static str,
        /// Supplied value.
        value: usize,
        /// Minimum supported value.
        min: usize,
        /// Maximum supported value.
        max: usize,
    },
    /// Unsupported filter size.
    #[error("unsupported kernel size {0}")]
    KernelSize(usize),
    /// A parameter must be a multiple of some factor.
    #[error("`{name}` = {value} must be a multiple of {factor}")]
    Alignment {
        /// Parameter name.
        name: &'static str,
        /// Supplied value.
        value: usize,
        /// Required factor.
        factor: usize,
    },
    /// Two parameters whose product must equal a third one do not agree.
    #[error("{what}: {parts} != {total}")]
    Split {
        /// Description of the split.
        what: &'static str,
        /// Product of the split parts.
        parts: usize,
        /// Expected total.
        total: usize,
    },
    /// Tiles needed for an invocation do not fit on chip.
    #[error("{buffer} tile needs {required} units, but only {capacity} fit on chip")]
    Capacity {
        /// Tile name.
        buffer: &'static str,
        /// Units required by the configuration.
        required: usize,
        /// Units available.
        capacity: usize,
    },
    /// A caller-supplied buffer is too short for the addressed region.
    #[error("`{buffer}` buffer has {actual} elements, but the invocation addresses {required}")]
    BufferLength {
        /// Buffer name.
        buffer: &'static str,
        /// Minimal length needed.
        required: usize,
        /// Actual length.
        actual: usize,
    },
    /// Tensor dimensions supplied to a host wrapper disagree with the configuration.
    #[error("{what} has shape {actual:?}, expected {expected:?}")]
    Shape {
        /// Tensor description.
        what: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },
    /// ReLU backward pass requires an activation mask, but none was supplied.
    #[error("activation mask is required when ReLU is fused into a backward pass")]
    MissingMask,
    /// Activation mask was produced for a different layout than the one being read.
    #[error("activation mask layout {actual:?} does not match the expected {expected:?}")]
    MaskMismatch {
        /// Layout the backward pass reads.
        expected: crate::base::MaskKey,
        /// Layout the mask was produced for.
        actual: crate::base::MaskKey,
    },
    /// The kernel does not support the requested mode or feature.
    #[error("{kernel} kernel does not support {feature}")]
    Unsupported {
        /// Kernel name.
        kernel: &'static str,
        /// Unsupported feature.
        feature: &'static str,
    },
}

pub(crate) fn check_range(
    name: &'static str,
    value: usize,
    min: usize,
    max: usize,
) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

pub(crate) fn check_multiple(
    name: &'static str,
    value: usize,
    factor: usize,
) -> Result<(), ConfigError> {
    if value % factor == 0 {
        Ok(())
    } else {
        Err(ConfigError::Alignment {
            name,
            value,
            factor,
        })
    }
}

pub(crate) fn check_capacity(
    buffer: &'static str,
    required: usize,
    capacity: usize,
) -> Result<(), ConfigError> {
    if required <= capacity {
        Ok(())
    } else {
        Err(ConfigError::Capacity {
            buffer,
            required,
            capacity,
        })
    }
}

pub(crate) fn check_len(
    buffer: &'static str,
    required: usize,
    actual: usize,
) -> Result<(), ConfigError> {
    if required <= actual {
        Ok(())
    } else {
        Err(ConfigError::BufferLength {
            buffer,
            required,
            actual,
        })
    }
}

fn check_split(
    what: &'static str,
    parts: usize,
    total: usize,
) -> Result<(), ConfigError> {
    if parts == total {
        Ok(())
    } else {
        Err(ConfigError::Split { what, parts, total })
    }
}

/// Configuration shared by all kernel variants.
///
/// Channel counts refer to a single group. Spatial extents (`height`, `width`) refer to
/// the tensor read by the kernel; for [`Mode::BackwardWeights`] this is the activation
/// tensor, for the other modes the tensor in `input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelConfig {
    /// Input channels per group.
    pub in_channels: usize,
    /// Output channels per group.
    pub out_channels: usize,
    /// Input channels loaded on chip per read pass.
    pub burst_channels: usize,
    /// Number of read passes; `burst_channels * read_passes == in_channels`.
    pub read_passes: usize,
    /// Number of output row tiles; `burst_rows * output_tile_passes == height`.
    pub output_tile_passes: usize,
    /// Rows per output tile.
    pub burst_rows: usize,
    /// Spatial height.
    pub height: usize,
    /// Spatial width.
    pub width: usize,
    /// Half of the padded row width. A stored row has `2 * tile_pad` scalars,
    /// i.e. `tile_pad / 8` vector units.
    pub tile_pad: usize,
    /// Filter size: 1, 3 or 5 for the channel-major kernels.
    pub kernel_size: usize,
    /// Number of groups.
    pub groups: usize,
    /// Images processed per invocation.
    pub images: usize,
    /// Treats the layer as fully connected (1x1 spatial extent, channels packed into lanes).
    pub fully_connected: bool,
    /// Fuses ReLU into the layer.
    pub relu: bool,
    /// Direction of the pass.
    pub mode: Mode,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            in_channels: 16,
            out_channels: 16,
            burst_channels: 16,
            read_passes: 1,
            output_tile_passes: 1,
            burst_rows: 16,
            height: 16,
            width: 16,
            tile_pad: 8,
            kernel_size: 3,
            groups: 1,
            images: 1,
            fully_connected: false,
            relu: false,
            mode: Mode::Forward,
        }
    }
}

impl KernelConfig {
    /// Creates a configuration for a convolution over `height x width` maps, choosing
    /// the tile geometry automatically: the narrowest padded row fitting `width`, the tallest
    /// output tile and the largest input burst that fit on chip.
    pub fn conv(
        in_channels: usize,
        out_channels: usize,
        height: usize,
        width: usize,
        kernel_size: usize,
    ) -> Self {
        let tile_pad = ((width + VEC_WIDTH - 1) / VEC_WIDTH).max(1) * 8;
        let row_units = tile_pad / 8;
        let burst_rows = (1..=height)
            .rev()
            .filter(|rows| height % rows == 0)
            .find(|rows| *rows <= 64 && rows * row_units <= LANE_TILE_UNITS)
            .unwrap_or(1);
        let config = Self {
            in_channels,
            out_channels,
            burst_channels: in_channels,
            read_passes: 1,
            output_tile_passes: height / burst_rows,
            burst_rows,
            height,
            width,
            tile_pad,
            kernel_size,
            ..Self::default()
        };
        config.with_channels(in_channels, out_channels)
    }

    /// Creates a configuration for a fully-connected layer.
    pub fn dense(in_channels: usize, out_channels: usize, images: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            burst_channels: in_channels,
            read_passes: 1,
            output_tile_passes: 1,
            burst_rows: 1,
            height: 1,
            width: 1,
            tile_pad: 8,
            kernel_size: 1,
            images,
            fully_connected: true,
            ..Self::default()
        }
    }

    /// Replaces channel counts, re-deriving the burst split so that the input tile fits
    /// on chip. Used to derive transposed configurations for input gradients.
    pub fn with_channels(self, in_channels: usize, out_channels: usize) -> Self {
        let per_channel = self.images * self.height * self.row_units().max(1);
        let burst_channels = (1..=in_channels)
            .rev()
            .filter(|burst| in_channels % burst == 0)
            .find(|burst| {
                *burst <= 256
                    && burst * per_channel <= INPUT_TILE_UNITS
                    && burst * self.weight_units() <= LANE_TILE_UNITS
            })
            .unwrap_or(1);
        Self {
            in_channels,
            out_channels,
            burst_channels: if self.fully_connected {
                in_channels
            } else {
                burst_channels
            },
            read_passes: if self.fully_connected {
                1
            } else {
                in_channels / burst_channels
            },
            ..self
        }
    }

    /// Vector units per stored row (`fact` in the packed layout).
    pub fn row_units(&self) -> usize {
        self.tile_pad / 8
    }

    /// Scalars per stored row.
    pub fn padded_width(&self) -> usize {
        self.tile_pad * 2
    }

    /// Weight units per (output, input) channel pair: two for 5x5 filters, one otherwise.
    pub fn weight_units(&self) -> usize {
        if self.kernel_size == 5 {
            2
        } else {
            1
        }
    }

    /// Input channels across all groups.
    pub fn total_in_channels(&self) -> usize {
        self.in_channels * self.groups
    }

    /// Output channels across all groups.
    pub fn total_out_channels(&self) -> usize {
        self.out_channels * self.groups
    }

    /// Units of a single channel plane in the channel-major tiled layout.
    pub fn plane_units(&self) -> usize {
        self.height * self.row_units()
    }

    /// Vector units needed to store the input of the layer for `image_blocks` blocks.
    pub fn input_units(&self, image_blocks: usize) -> usize {
        let images = self.images * image_blocks;
        if self.fully_connected {
            images * self.in_channels / VEC_WIDTH
        } else {
            images * self.total_in_channels() * self.plane_units()
        }
    }

    /// Vector units needed to store the output (or output gradient) of the layer.
    pub fn output_units(&self, image_blocks: usize) -> usize {
        let images = self.images * image_blocks;
        if self.fully_connected {
            images * self.out_channels / VEC_WIDTH
        } else {
            images * self.total_out_channels() * self.plane_units()
        }
    }

    /// Vector units needed to store the packed filters of the layer.
    pub fn filter_units(&self) -> usize {
        if self.fully_connected {
            self.in_channels * self.out_channels / VEC_WIDTH
        } else {
            self.total_out_channels() * self.in_channels * self.weight_units()
        }
    }

    fn validate_common(&self) -> Result<(), ConfigError> {
        check_range("groups", self.groups, 1, 2)?;
        check_range("images", self.images, 1, 256)?;
        if self.fully_connected {
            check_range("in_channels", self.in_channels, VEC_WIDTH, 4096)?;
            check_range("out_channels", self.out_channels, VEC_WIDTH, 4096)?;
            check_multiple("in_channels", self.in_channels, VEC_WIDTH)?;
            check_multiple("out_channels", self.out_channels, VEC_WIDTH)?;
            check_range("groups", self.groups, 1, 1)?;
            check_range("read_passes", self.read_passes, 1, 1)?;
            check_split(
                "burst_channels * read_passes vs in_channels",
                self.burst_channels * self.read_passes,
                self.in_channels,
            )?;
            return Ok(());
        }

        check_range("in_channels", self.in_channels, 1, 2048)?;
        check_range("out_channels", self.out_channels, 1, 2048)?;
        check_range("burst_channels", self.burst_channels, 1, 256)?;
        check_range("read_passes", self.read_passes, 1, 64)?;
        check_range("height", self.height, 1, 256)?;
        check_range("width", self.width, 1, 256)?;
        check_range("burst_rows", self.burst_rows, 1, 64)?;
        check_range("output_tile_passes", self.output_tile_passes, 1, 32)?;
        if self.kernel_size != 1 && self.kernel_size != 3 && self.kernel_size != 5 {
            return Err(ConfigError::KernelSize(self.kernel_size));
        }
        check_multiple("tile_pad", self.tile_pad, 8)?;
        check_range("tile_pad", self.tile_pad, 8, 128)?;
        check_range("width", self.width, 1, self.padded_width())?;
        check_split(
            "burst_channels * read_passes vs in_channels",
            self.burst_channels * self.read_passes,
            self.in_channels,
        )?;
        check_split(
            "burst_rows * output_tile_passes vs height",
            self.burst_rows * self.output_tile_passes,
            self.height,
        )
    }

    /// Checks the configuration against the bounds of the half-precision channel-major
    /// kernel ([`cr_layer_fb_half`](crate::kernels::cr_layer_fb_half)), including on-chip
    /// tile capacities.
    pub fn validate_half(&self) -> Result<(), ConfigError> {
        self.validate_common()?;
        if self.fully_connected {
            check_capacity("input", self.images * self.in_channels / VEC_WIDTH, INPUT_TILE_UNITS)?;
            check_capacity("bias", self.out_channels, BIAS_CAPACITY)?;
            let row = self.out_channels / VEC_WIDTH;
            let (weight_units, output_units) = match self.mode {
                Mode::BackwardWeights => (self.images * row, row),
                _ => (row, self.images * row),
            };
            check_capacity("weight", weight_units, LANE_TILE_UNITS)?;
            return check_capacity("output", output_units, LANE_TILE_UNITS);
        }

        check_capacity(
            "input",
            self.images * self.burst_channels * self.plane_units(),
            INPUT_TILE_UNITS,
        )?;
        check_capacity("bias", self.out_channels, BIAS_CAPACITY)?;
        let weight_tile = self.burst_channels * self.weight_units();
        let row_tile = self.burst_rows * self.row_units();
        let (weight_units, output_units) = match self.mode {
            Mode::BackwardWeights => (row_tile, weight_tile),
            _ => (weight_tile, row_tile),
        };
        check_capacity("weight", weight_units, LANE_TILE_UNITS)?;
        check_capacity("output", output_units, LANE_TILE_UNITS)
    }

    /// Checks the configuration against the bounds of the single-precision direct kernel
    /// ([`conv_layer_direct`](crate::kernels::conv_layer_direct)).
    pub fn validate_direct(&self) -> Result<(), ConfigError> {
        const KERNEL: &str = "direct";
        if self.mode != Mode::Forward {
            return Err(ConfigError::Unsupported {
                kernel: KERNEL,
                feature: "backward passes",
            });
        }
        if self.fully_connected {
            return Err(ConfigError::Unsupported {
                kernel: KERNEL,
                feature: "fully-connected layers",
            });
        }
        if self.relu {
            return Err(ConfigError::Unsupported {
                kernel: KERNEL,
                feature: "fused ReLU",
            });
        }
        check_range("images", self.images, 1, 1)?;
        check_capacity(
            "input",
            self.burst_channels * self.plane_units(),
            DIRECT_INPUT_TILE_UNITS,
        )?;
        self.validate_half()
    }
}

/// Configuration of the HWCN convolution kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwcnConfig {
    /// Common parameters. `images` is the number of images packed along the innermost
    /// axis; `tile_pad`, `burst_rows` and `output_tile_passes` are not used.
    pub common: KernelConfig,
    /// Convolution stride along both spatial axes.
    pub stride: usize,
    /// Zero padding along both spatial axes.
    pub pad: usize,
}

impl Default for HwcnConfig {
    fn default() -> Self {
        Self {
            common: KernelConfig {
                images: VEC_WIDTH,
                ..KernelConfig::default()
            },
            stride: 1,
            pad: 1,
        }
    }
}

impl From<HwcnConfig> for KernelConfig {
    fn from(value: HwcnConfig) -> Self {
        value.common
    }
}

impl HwcnConfig {
    /// Units packing 16 images each.
    pub fn image_units(&self) -> usize {
        self.common.images / VEC_WIDTH
    }

    /// Channels handled by each of the 4 sub-lanes in a burst.
    pub fn sublane_channels(&self) -> usize {
        self.common.burst_channels / 4
    }

    /// Weight units per filter tap for a single burst.
    pub fn burst_weight_units(&self) -> usize {
        (self.common.burst_channels + VEC_WIDTH - 1) / VEC_WIDTH
    }

    /// Weight units per filter tap for all input channels.
    pub fn channel_weight_units(&self) -> usize {
        (self.common.in_channels + VEC_WIDTH - 1) / VEC_WIDTH
    }

    /// Spatial height of the output, or 0 if the filter does not fit the padded map.
    pub fn output_height(&self) -> usize {
        output_extent(self.common.height, self.common.kernel_size, self.pad, self.stride)
            .unwrap_or(0)
    }

    /// Spatial width of the output, or 0 if the filter does not fit the padded map.
    pub fn output_width(&self) -> usize {
        output_extent(self.common.width, self.common.kernel_size, self.pad, self.stride)
            .unwrap_or(0)
    }

    /// Vector units of an activation tensor read by the kernel.
    pub fn input_units(&self) -> usize {
        self.common.height * self.common.width * self.common.total_in_channels() * self.image_units()
    }

    /// Vector units of the output tensor in forward mode.
    pub fn output_units(&self) -> usize {
        self.output_height()
            * self.output_width()
            * self.common.total_out_channels()
            * self.image_units()
    }

    /// Vector units of the packed filters.
    pub fn filter_units(&self) -> usize {
        let taps = self.common.kernel_size * self.common.kernel_size;
        self.common.total_out_channels() * taps * self.channel_weight_units()
    }

    /// Checks the configuration against the bounds of the HWCN kernel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let common = &self.common;
        if common.fully_connected {
            return Err(ConfigError::Unsupported {
                kernel: "hwcn",
                feature: "fully-connected layers",
            });
        }
        check_range("in_channels", common.in_channels, VEC_WIDTH, 2048)?;
        check_range("out_channels", common.out_channels, 1, 2048)?;
        check_range("burst_channels", common.burst_channels, VEC_WIDTH, 2048)?;
        check_multiple("burst_channels", common.burst_channels, VEC_WIDTH)?;
        check_split(
            "burst_channels * read_passes vs in_channels",
            common.burst_channels * common.read_passes,
            common.in_channels,
        )?;
        check_range("height", common.height, 1, 256)?;
        check_range("width", common.width, 1, 256)?;
        check_range("kernel_size", common.kernel_size, 1, 11)?;
        check_range("groups", common.groups, 1, 2)?;
        check_range("images", common.images, VEC_WIDTH, 256)?;
        check_multiple("images", common.images, VEC_WIDTH)?;
        check_range("stride", self.stride, 1, 15)?;
        check_range("pad", self.pad, 0, 15)?;
        if common.height + 2 * self.pad < common.kernel_size
            || common.width + 2 * self.pad < common.kernel_size
        {
            return Err(ConfigError::KernelSize(common.kernel_size));
        }

        let taps = common.kernel_size * common.kernel_size;
        check_capacity(
            "input",
            taps * self.sublane_channels() * self.image_units(),
            HWCN_INPUT_TILE_UNITS,
        )?;
        check_capacity("bias", common.out_channels, BIAS_CAPACITY * 4)?;
        let weight_tile = taps * self.burst_weight_units();
        let (weight_units, output_units) = match common.mode {
            Mode::BackwardWeights => (self.image_units(), weight_tile),
            _ => (weight_tile, self.image_units()),
        };
        check_capacity("weight", weight_units, HWCN_LANE_TILE_UNITS)?;
        check_capacity("output", output_units, HWCN_LANE_TILE_UNITS)
    }
}

/// Output extent of a strided convolution along one axis. Returns `None` if the filter
/// does not fit the padded input or `stride` is zero.
pub fn output_extent(
    input: usize,
    kernel_size: usize,
    pad: usize,
    stride: usize,
) -> Option<usize> {
    let span = (input + 2 * pad).checked_sub(kernel_size)?;
    Some(span.checked_div(stride)? + 1)
}

/// Configuration of the HWCN max-pooling kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolConfig {
    /// Common parameters. `in_channels`, `burst_channels`, `read_passes`, `height`,
    /// `width`, `images` and `mode` are used; `height` and `width` refer to
    /// the unpooled activation map.
    pub common: KernelConfig,
    /// Pooling window size: 2 or 3. The stride is always 2.
    pub pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            common: KernelConfig {
                images: VEC_WIDTH,
                ..KernelConfig::default()
            },
            pool_size: 3,
        }
    }
}

impl PoolConfig {
    /// Pooled extent along an axis of `input` elements. Returns `None` if the axis
    /// is shorter than the pooling window.
    pub fn pooled_extent(&self, input: usize) -> Option<usize> {
        let rest = input.checked_sub(self.pool_size)?;
        Some(if rest % 2 == 1 {
            rest / 2 + 2
        } else {
            rest / 2 + 1
        })
    }

    /// Pooled height, or 0 if the map is shorter than the pooling window.
    pub fn output_height(&self) -> usize {
        self.pooled_extent(self.common.height).unwrap_or(0)
    }

    /// Pooled width, or 0 if the map is narrower than the pooling window.
    pub fn output_width(&self) -> usize {
        self.pooled_extent(self.common.width).unwrap_or(0)
    }

    /// Units packing 16 images each.
    pub fn image_units(&self) -> usize {
        self.common.images / VEC_WIDTH
    }

    /// Checks the configuration against the bounds of the pooling kernel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let common = &self.common;
        if common.mode == Mode::BackwardWeights {
            return Err(ConfigError::Unsupported {
                kernel: "pool",
                feature: "weight gradients",
            });
        }
        check_range("pool_size", self.pool_size, 2, 3)?;
        check_range("height", common.height, self.pool_size, 256)?;
        check_range("width", common.width, self.pool_size, 256)?;
        check_range("in_channels", common.in_channels, 1, 2048)?;
        check_range("burst_channels", common.burst_channels, 1, 2048)?;
        check_split(
            "burst_channels * read_passes vs in_channels",
            common.burst_channels * common.read_passes,
            common.in_channels,
        )?;
        check_range("images", common.images, VEC_WIDTH, 256)?;
        check_multiple("images", common.images, VEC_WIDTH)?;
        check_capacity(
            "pool",
            common.burst_channels * self.image_units(),
            POOL_TILE_UNITS,
        )
    }
}
