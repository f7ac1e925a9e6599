//! Comparison with straightforward CPU implementations of the layers.

use ndarray::{Array, Array1, Array2, Array4, ArrayView4, Dimension, Zip};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use fpga_convolution::{
    buffers::{unpack_hwcn_mask, unpack_rows_mask, unpack_tiled_mask},
    Convolution, DirectConvolution, FeatureMap, FullyConnected, Half, HwcnConfig,
    HwcnConvolution, KernelConfig, MaxPool, PoolConfig,
};

/// Relative tolerance for half-precision results.
const HALF_TOLERANCE: f32 = 0.02;

fn rng() -> XorShiftRng {
    XorShiftRng::from_seed(*b"!seed seed seed!")
}

fn random_array(rng: &mut impl Rng, shape: [usize; 4]) -> Array4<f32> {
    Array4::from_shape_fn(shape, |_| rng.gen_range(-0.5..0.5))
}

fn quantize<D: Dimension>(array: &Array<f32, D>) -> Array<f32, D> {
    array.mapv(|x| Half::from_f32(x).to_f32())
}

fn assert_close<D: Dimension>(actual: &Array<f32, D>, expected: &Array<f32, D>, tolerance: f32) {
    assert_eq!(actual.shape(), expected.shape());
    let max_abs = expected.fold(0.0_f32, |acc, &x| acc.max(x.abs()));
    let mut max_diff = 0.0_f32;
    Zip::from(actual).and(expected).apply(|&x, &y| {
        max_diff = max_diff.max((x - y).abs());
    });
    assert!(
        max_diff <= tolerance * (1.0 + max_abs),
        "max_diff={}, max_abs={}",
        max_diff,
        max_abs
    );
}

/// Checks that the mask flags exactly the non-zero outputs.
fn assert_mask_matches<D: Dimension>(mask: &Array<bool, D>, output: &Array<f32, D>) {
    assert_eq!(mask.shape(), output.shape());
    Zip::from(mask).and(output).apply(|&flag, &y| {
        assert_eq!(flag, y != 0.0, "mask flag {} for output {}", flag, y);
    });
}

fn signed_offset(base: usize, offset: usize, pad: usize, extent: usize) -> Option<usize> {
    (base + offset).checked_sub(pad).filter(|&pos| pos < extent)
}

/// Grouped convolution with zero padding. `filters` have `[out * groups, in, k, k]` shape.
fn slow_conv(
    signal: ArrayView4<'_, f32>,
    filters: ArrayView4<'_, f32>,
    bias: &[f32],
    stride: usize,
    pad: usize,
    groups: usize,
) -> Array4<f32> {
    let (batch_size, _, height, width) = signal.dim();
    let (outputs, inputs, kernel_size, _) = filters.dim();
    let group_outputs = outputs / groups;
    let output_h = (height + 2 * pad - kernel_size) / stride + 1;
    let output_w = (width + 2 * pad - kernel_size) / stride + 1;

    Array4::from_shape_fn([batch_size, outputs, output_h, output_w], |(n, o, o_y, o_x)| {
        let group = o / group_outputs;
        let mut acc = bias[o];
        for k_y in 0..kernel_size {
            let i_y = match signed_offset(o_y * stride, k_y, pad, height) {
                Some(pos) => pos,
                None => continue,
            };
            for k_x in 0..kernel_size {
                let i_x = match signed_offset(o_x * stride, k_x, pad, width) {
                    Some(pos) => pos,
                    None => continue,
                };
                for i in 0..inputs {
                    acc += filters[[o, i, k_y, k_x]] * signal[[n, group * inputs + i, i_y, i_x]];
                }
            }
        }
        acc
    })
}

fn slow_weight_gradient(
    activations: ArrayView4<'_, f32>,
    output_gradient: ArrayView4<'_, f32>,
    filter_shape: [usize; 4],
    stride: usize,
    pad: usize,
    groups: usize,
) -> Array4<f32> {
    let (batch_size, _, height, width) = activations.dim();
    let (_, _, output_h, output_w) = output_gradient.dim();
    let [outputs, inputs, kernel_size, _] = filter_shape;
    let group_outputs = outputs / groups;

    Array4::from_shape_fn(filter_shape, |(o, i, k_y, k_x)| {
        let channel = (o / group_outputs) * inputs + i;
        let mut acc = 0.0;
        for n in 0..batch_size {
            for o_y in 0..output_h {
                let i_y = match signed_offset(o_y * stride, k_y, pad, height) {
                    Some(pos) => pos,
                    None => continue,
                };
                for o_x in 0..output_w {
                    if let Some(i_x) = signed_offset(o_x * stride, k_x, pad, width) {
                        acc += output_gradient[[n, o, o_y, o_x]] * activations[[n, channel, i_y, i_x]];
                    }
                }
            }
        }
        acc
    })
}

/// Input gradient of a unit-stride convolution.
fn slow_input_gradient(
    output_gradient: ArrayView4<'_, f32>,
    filters: ArrayView4<'_, f32>,
    signal_shape: [usize; 4],
    pad: usize,
    groups: usize,
) -> Array4<f32> {
    let (_, _, output_h, output_w) = output_gradient.dim();
    let (outputs, inputs, kernel_size, _) = filters.dim();
    let group_outputs = outputs / groups;

    Array4::from_shape_fn(signal_shape, |(n, c, i_y, i_x)| {
        let group = c / inputs;
        let mut acc = 0.0;
        for o in group * group_outputs..(group + 1) * group_outputs {
            for k_y in 0..kernel_size {
                let o_y = match (i_y + pad).checked_sub(k_y).filter(|&y| y < output_h) {
                    Some(pos) => pos,
                    None => continue,
                };
                for k_x in 0..kernel_size {
                    if let Some(o_x) = (i_x + pad).checked_sub(k_x).filter(|&x| x < output_w) {
                        acc += output_gradient[[n, o, o_y, o_x]] * filters[[o, c % inputs, k_y, k_x]];
                    }
                }
            }
        }
        acc
    })
}

fn relu_gate(gradient: &Array4<f32>, output: &Array4<f32>) -> Array4<f32> {
    let mut gated = gradient.clone();
    Zip::from(&mut gated).and(output).apply(|g, &y| {
        if y == 0.0 {
            *g = 0.0;
        }
    });
    gated
}

#[derive(Debug, Clone, Copy)]
struct ChwCase {
    in_channels: usize,
    out_channels: usize,
    size: [usize; 2],
    kernel_size: usize,
    groups: usize,
    images: usize,
    batch_size: usize,
    relu: bool,
}

impl ChwCase {
    fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            size: [8, 8],
            kernel_size,
            groups: 1,
            images: 1,
            batch_size: 2,
            relu: false,
        }
    }

    fn config(self) -> KernelConfig {
        let [height, width] = self.size;
        let mut config = KernelConfig::conv(
            self.in_channels,
            self.out_channels,
            height,
            width,
            self.kernel_size,
        );
        config.groups = self.groups;
        config.images = self.images;
        config.relu = self.relu;
        config.with_channels(self.in_channels, self.out_channels)
    }
}

fn compare_chw(case: ChwCase, config: KernelConfig) {
    let mut rng = rng();
    let [height, width] = case.size;
    let (total_in, total_out) = (config.total_in_channels(), config.total_out_channels());
    let size = case.kernel_size;
    let pad = size / 2;

    let signal = random_array(&mut rng, [case.batch_size, total_in, height, width]);
    let filters = random_array(&mut rng, [total_out, case.in_channels, size, size]);
    let bias: Vec<f32> = (0..total_out).map(|_| rng.gen_range(-0.5..0.5)).collect();

    let conv = Convolution::new(config).unwrap();
    let pass = conv
        .forward(FeatureMap::nchw(&signal), filters.view(), &bias)
        .unwrap();
    let mut expected = slow_conv(signal.view(), filters.view(), &bias, 1, pad, case.groups);
    if case.relu {
        expected.mapv_inplace(|x| x.max(0.0));
        let mask = unpack_tiled_mask(pass.mask().unwrap(), pass.key().shape, config.tile_pad);
        assert_mask_matches(&mask, pass.output());
    }
    assert_close(pass.output(), &expected, HALF_TOLERANCE);

    let output_gradient = random_array(&mut rng, [case.batch_size, total_out, height, width]);
    let gated = if case.relu {
        relu_gate(&output_gradient, pass.output())
    } else {
        output_gradient.clone()
    };

    let weight_gradient = conv
        .weight_gradient(
            FeatureMap::nchw(&signal),
            FeatureMap::nchw(&gated),
            None,
        )
        .unwrap();
    let expected = slow_weight_gradient(
        signal.view(),
        gated.view(),
        [total_out, case.in_channels, size, size],
        1,
        pad,
        case.groups,
    );
    assert_close(&weight_gradient, &expected, HALF_TOLERANCE);

    let input_gradient = conv
        .input_gradient(
            FeatureMap::nchw(&output_gradient),
            filters.view(),
            Some(&pass).filter(|_| case.relu),
        )
        .unwrap();
    let expected = slow_input_gradient(
        gated.view(),
        filters.view(),
        [case.batch_size, total_in, height, width],
        pad,
        case.groups,
    );
    assert_close(&input_gradient, &expected, HALF_TOLERANCE);
}

fn test_chw(case: ChwCase) {
    compare_chw(case, case.config());
}

#[test]
fn pointwise_convolution() {
    test_chw(ChwCase::new(8, 16, 1));
}

#[test]
fn convolution_3x3() {
    test_chw(ChwCase::new(4, 8, 3));
}

#[test]
fn convolution_5x5() {
    test_chw(ChwCase::new(3, 5, 5));
}

#[test]
fn grouped_convolutions() {
    for &kernel_size in &[1, 3, 5] {
        test_chw(ChwCase {
            groups: 2,
            ..ChwCase::new(3, 4, kernel_size)
        });
    }
}

#[test]
fn convolution_with_relu() {
    for &kernel_size in &[1, 3, 5] {
        test_chw(ChwCase {
            relu: true,
            ..ChwCase::new(4, 4, kernel_size)
        });
    }
}

#[test]
fn wide_maps_with_several_images_per_invocation() {
    test_chw(ChwCase {
        size: [6, 20],
        images: 2,
        batch_size: 4,
        ..ChwCase::new(2, 3, 3)
    });
}

#[test]
fn convolution_5x5_over_wide_maps() {
    for &width in &[18, 20, 36] {
        test_chw(ChwCase {
            size: [6, width],
            ..ChwCase::new(3, 4, 5)
        });
    }
    test_chw(ChwCase {
        size: [5, 33],
        groups: 2,
        relu: true,
        ..ChwCase::new(2, 3, 5)
    });
}

#[test]
fn relu_convolution_with_16_channels() {
    let mut rng = rng();
    let config = KernelConfig {
        relu: true,
        ..KernelConfig::conv(16, 16, 16, 16, 3)
    };
    assert_eq!(config.tile_pad, 8);
    assert_eq!(config.burst_channels, 16);

    let signal = Array4::<f32>::from_shape_fn([1, 16, 16, 16], |_| rng.gen_range(-1.0..1.0));
    let filters = Array4::<f32>::from_shape_fn([16, 16, 3, 3], |_| rng.gen_range(-1.0..1.0));
    let bias: Vec<f32> = (0..16).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let conv = Convolution::new(config).unwrap();
    let pass = conv
        .forward(FeatureMap::nchw(&signal), filters.view(), &bias)
        .unwrap();

    let expected = slow_conv(signal.view(), filters.view(), &bias, 1, 1, 1).mapv(|x| x.max(0.0));
    Zip::from(pass.output()).and(&expected).apply(|&x, &y| {
        assert!((x - y).abs() <= 0.1 * (1.0 + y.abs()), "{} vs {}", x, y);
    });
    let mask = unpack_tiled_mask(pass.mask().unwrap(), pass.key().shape, config.tile_pad);
    assert_mask_matches(&mask, pass.output());
}

#[test]
fn multiple_read_and_tile_passes() {
    for &kernel_size in &[1, 3, 5] {
        let case = ChwCase {
            relu: true,
            ..ChwCase::new(8, 4, kernel_size)
        };
        let config = KernelConfig {
            burst_channels: 2,
            read_passes: 4,
            burst_rows: 2,
            output_tile_passes: 4,
            ..case.config()
        };
        compare_chw(case, config);
    }
}

#[test]
fn direct_convolution() {
    let mut rng = rng();
    for &kernel_size in &[1, 3, 5] {
        let mut config = KernelConfig::conv(3, 12, 7, 9, kernel_size);
        config.groups = 2;
        let signal = random_array(&mut rng, [2, 6, 7, 9]);
        let filters = random_array(&mut rng, [24, 3, kernel_size, kernel_size]);
        let bias: Vec<f32> = (0..24).map(|_| rng.gen_range(-0.5..0.5)).collect();

        let conv = DirectConvolution::new(config).unwrap();
        let output = conv
            .compute(FeatureMap::nchw(&signal), filters.view(), &bias)
            .unwrap();
        let expected = slow_conv(signal.view(), filters.view(), &bias, 1, kernel_size / 2, 2);
        assert_close(&output, &expected, 1e-5);
    }
}

#[test]
fn direct_convolution_over_wide_maps() {
    // A filter picking the rightmost tap shifts each row 2 columns to the left.
    let signal = Array4::from_shape_fn([1, 1, 1, 20], |(_, _, _, x)| x as f32);
    let mut filters = Array4::<f32>::zeros([1, 1, 5, 5]);
    filters[[0, 0, 2, 4]] = 1.0;
    let config = KernelConfig::conv(1, 1, 1, 20, 5);
    let expected = Array4::from_shape_fn([1, 1, 1, 20], |(_, _, _, x)| {
        if x + 2 < 20 {
            (x + 2) as f32
        } else {
            0.0
        }
    });

    let direct = DirectConvolution::new(config).unwrap();
    let output = direct
        .compute(FeatureMap::nchw(&signal), filters.view(), &[0.0])
        .unwrap();
    assert_eq!(output, expected);
    let pass = Convolution::new(config)
        .unwrap()
        .forward(FeatureMap::nchw(&signal), filters.view(), &[0.0])
        .unwrap();
    assert_eq!(*pass.output(), expected);

    let mut rng = rng();
    let mut config = KernelConfig::conv(2, 4, 6, 36, 5);
    config.groups = 2;
    let signal = random_array(&mut rng, [1, 4, 6, 36]);
    let filters = random_array(&mut rng, [8, 2, 5, 5]);
    let bias: Vec<f32> = (0..8).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let output = DirectConvolution::new(config)
        .unwrap()
        .compute(FeatureMap::nchw(&signal), filters.view(), &bias)
        .unwrap();
    let expected = slow_conv(signal.view(), filters.view(), &bias, 1, 2, 2);
    assert_close(&output, &expected, 1e-5);
}

#[test]
fn chained_layers_share_masks() {
    let mut rng = rng();
    let first = Convolution::new(KernelConfig {
        relu: true,
        ..KernelConfig::conv(2, 4, 8, 8, 3)
    })
    .unwrap();
    let second = Convolution::new(KernelConfig::conv(4, 4, 8, 8, 1)).unwrap();

    let signal = random_array(&mut rng, [1, 2, 8, 8]);
    let filters = random_array(&mut rng, [4, 2, 3, 3]);
    let pass = first
        .forward(FeatureMap::nchw(&signal), filters.view(), &[0.1; 4])
        .unwrap();

    let output_gradient = random_array(&mut rng, [1, 4, 8, 8]);
    let activations = pass.output().view();
    let weight_gradient = second
        .weight_gradient(
            FeatureMap::nchw(activations),
            FeatureMap::nchw(&output_gradient),
            Some(&pass),
        )
        .unwrap();
    let expected = slow_weight_gradient(
        activations,
        output_gradient.view(),
        [4, 4, 1, 1],
        1,
        0,
        1,
    );
    assert_close(&weight_gradient, &expected, HALF_TOLERANCE);
}

fn slow_dense(signal: &Array2<f32>, weights: &Array2<f32>, bias: &[f32]) -> Array2<f32> {
    signal.dot(weights) + &Array1::from(bias.to_vec())
}

#[test]
fn fully_connected_layer() {
    let mut rng = rng();
    let config = KernelConfig {
        relu: true,
        ..KernelConfig::dense(32, 48, 2)
    };
    let layer = FullyConnected::new(config).unwrap();
    let signal = Array2::from_shape_fn([4, 32], |_| rng.gen_range(-0.5..0.5));
    let weights = Array2::from_shape_fn([32, 48], |_| rng.gen_range(-0.5..0.5));
    let bias: Vec<f32> = (0..48).map(|_| rng.gen_range(-0.5..0.5)).collect();

    let pass = layer.forward(signal.view(), weights.view(), &bias).unwrap();
    let expected = slow_dense(&signal, &weights, &bias).mapv(|x| x.max(0.0));
    assert_close(pass.output(), &expected, HALF_TOLERANCE);
    assert_mask_matches(&unpack_rows_mask(pass.mask().unwrap(), [4, 48]), pass.output());

    let output_gradient = Array2::from_shape_fn([4, 48], |_| rng.gen_range(-0.5..0.5));
    let mut gated = output_gradient.clone();
    Zip::from(&mut gated).and(pass.output()).apply(|g, &y| {
        if y == 0.0 {
            *g = 0.0;
        }
    });

    let input_gradient = layer
        .input_gradient(output_gradient.view(), weights.view(), Some(&pass))
        .unwrap();
    assert_close(&input_gradient, &gated.dot(&weights.t()), HALF_TOLERANCE);

    let weight_gradient = layer
        .weight_gradient(signal.view(), gated.view(), None)
        .unwrap();
    assert_close(&weight_gradient, &signal.t().dot(&gated), HALF_TOLERANCE);
}

fn hwcn_config(
    in_channels: usize,
    out_channels: usize,
    size: usize,
    kernel_size: usize,
    stride: usize,
    pad: usize,
) -> HwcnConfig {
    HwcnConfig {
        common: KernelConfig {
            in_channels,
            out_channels,
            burst_channels: in_channels,
            read_passes: 1,
            height: size,
            width: size,
            kernel_size,
            images: 16,
            ..KernelConfig::default()
        },
        stride,
        pad,
    }
}

fn compare_hwcn(config: HwcnConfig) {
    let mut rng = rng();
    let common = config.common;
    let (groups, size) = (common.groups, common.kernel_size);
    let (total_in, total_out) = (common.total_in_channels(), common.total_out_channels());
    let signal = random_array(&mut rng, [16, total_in, common.height, common.width]);
    let filters = random_array(&mut rng, [total_out, common.in_channels, size, size]);
    let bias: Vec<f32> = (0..total_out).map(|_| rng.gen_range(-0.5..0.5)).collect();

    let conv = HwcnConvolution::new(config).unwrap();
    let pass = conv
        .forward(FeatureMap::nchw(&signal), filters.view(), &bias)
        .unwrap();
    let mut expected = slow_conv(
        signal.view(),
        filters.view(),
        &bias,
        config.stride,
        config.pad,
        groups,
    );
    if common.relu {
        expected.mapv_inplace(|x| x.max(0.0));
        let mask = unpack_hwcn_mask(pass.mask().unwrap(), pass.key().shape);
        assert_mask_matches(&mask, pass.output());
    }
    assert_close(pass.output(), &expected, HALF_TOLERANCE);

    let output_shape = [16, total_out, config.output_height(), config.output_width()];
    let output_gradient = random_array(&mut rng, output_shape);
    let gated = if common.relu {
        relu_gate(&output_gradient, pass.output())
    } else {
        output_gradient.clone()
    };
    let weight_gradient = conv
        .weight_gradient(FeatureMap::nchw(&signal), FeatureMap::nchw(&gated), None)
        .unwrap();
    let expected = slow_weight_gradient(
        signal.view(),
        gated.view(),
        [total_out, common.in_channels, size, size],
        config.stride,
        config.pad,
        groups,
    );
    assert_close(&weight_gradient, &expected, HALF_TOLERANCE);

    if config.stride == 1 && common.out_channels % 16 == 0 {
        let input_gradient = conv
            .input_gradient(
                FeatureMap::nchw(&output_gradient),
                filters.view(),
                Some(&pass).filter(|_| common.relu),
            )
            .unwrap();
        let expected = slow_input_gradient(
            gated.view(),
            filters.view(),
            [16, total_in, common.height, common.width],
            config.pad,
            groups,
        );
        assert_close(&input_gradient, &expected, HALF_TOLERANCE);
    }
}

#[test]
fn hwcn_convolution_with_stride() {
    compare_hwcn(hwcn_config(16, 4, 7, 3, 2, 1));
    compare_hwcn(hwcn_config(16, 3, 9, 5, 3, 0));
}

#[test]
fn hwcn_grouped_convolution() {
    let mut config = hwcn_config(16, 16, 5, 3, 1, 1);
    config.common.groups = 2;
    compare_hwcn(config);
}

#[test]
fn hwcn_convolution_with_relu_and_bursts() {
    let mut config = hwcn_config(32, 16, 6, 5, 1, 2);
    config.common.burst_channels = 16;
    config.common.read_passes = 2;
    config.common.relu = true;
    compare_hwcn(config);
}

fn slow_pool(signal: &Array4<f32>, pool_size: usize, output_h: usize, output_w: usize) -> Array4<f32> {
    let (batch_size, channels, height, width) = signal.dim();
    Array4::from_shape_fn([batch_size, channels, output_h, output_w], |(n, c, p_y, p_x)| {
        let mut max = f32::NEG_INFINITY;
        for y in (p_y * 2..p_y * 2 + pool_size).filter(|&y| y < height) {
            for x in (p_x * 2..p_x * 2 + pool_size).filter(|&x| x < width) {
                max = max.max(signal[[n, c, y, x]]);
            }
        }
        max
    })
}

/// Routes each pooled gradient to the first position holding the window maximum.
fn slow_pool_backward(signal: &Array4<f32>, pooled_gradient: &Array4<f32>, pool_size: usize) -> Array4<f32> {
    let (_, _, height, width) = signal.dim();
    let mut gradient = Array4::zeros(signal.dim());
    for ((n, c, p_y, p_x), &grad) in pooled_gradient.indexed_iter() {
        let mut best = None;
        for y in (p_y * 2..p_y * 2 + pool_size).filter(|&y| y < height) {
            for x in (p_x * 2..p_x * 2 + pool_size).filter(|&x| x < width) {
                let value = signal[[n, c, y, x]];
                match best {
                    Some((max, _, _)) if value <= max => {}
                    _ => best = Some((value, y, x)),
                }
            }
        }
        if let Some((_, y, x)) = best {
            gradient[[n, c, y, x]] += grad;
        }
    }
    gradient
}

fn compare_pool(pool_size: usize, size: [usize; 2], channels: usize, burst_channels: usize) {
    let mut rng = rng();
    let [height, width] = size;
    let config = PoolConfig {
        common: KernelConfig {
            in_channels: channels,
            burst_channels,
            read_passes: channels / burst_channels,
            height,
            width,
            images: 16,
            ..KernelConfig::default()
        },
        pool_size,
    };
    let pool = MaxPool::new(config).unwrap();
    let signal = quantize(&random_array(&mut rng, [16, channels, height, width]));
    let pass = pool.forward(FeatureMap::nchw(&signal)).unwrap();
    let (output_h, output_w) = (config.output_height(), config.output_width());
    assert_eq!(*pass.output(), slow_pool(&signal, pool_size, output_h, output_w));

    let pooled_gradient = quantize(&random_array(&mut rng, [16, channels, output_h, output_w]));
    let gradient = pool
        .backward(FeatureMap::nchw(&pooled_gradient), &pass)
        .unwrap();
    let expected = slow_pool_backward(&signal, &pooled_gradient, pool_size);
    assert_close(&gradient, &expected, HALF_TOLERANCE);
}

#[test]
fn max_pooling_2x2() {
    compare_pool(2, [8, 8], 4, 4);
    compare_pool(2, [7, 9], 3, 1);
}

#[test]
fn overlapping_max_pooling_3x3() {
    compare_pool(3, [7, 7], 4, 2);
    compare_pool(3, [8, 10], 2, 2);
}
