use criterion::{criterion_group, criterion_main, Bencher, Criterion, ParameterizedBenchmark};
use ndarray::Array4;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use fpga_convolution::{
    Convolution, FeatureMap, HwcnConfig, HwcnConvolution, KernelConfig, MaxPool, PoolConfig,
};

const INPUT_SIZES: &[usize] = &[8, 16, 32];
const CHANNELS: usize = 16;
const SAMPLE_SIZE: usize = 10;

fn random_array(rng: &mut XorShiftRng, shape: [usize; 4]) -> Array4<f32> {
    let mut array = Array4::zeros(shape);
    array.iter_mut().for_each(|v| *v = rng.gen_range(-1.0..1.0));
    array
}

fn run_convolution(bencher: &mut Bencher, input_size: usize) {
    let config = KernelConfig {
        relu: true,
        ..KernelConfig::conv(CHANNELS, CHANNELS, input_size, input_size, 3)
    };
    let convolution = Convolution::new(config).unwrap();
    let mut rng = XorShiftRng::from_seed(*b"!seed seed seed!");
    let signal = random_array(&mut rng, [1, CHANNELS, input_size, input_size]);
    let filters = random_array(&mut rng, [CHANNELS, CHANNELS, 3, 3]);
    let bias = vec![0.0; CHANNELS];

    bencher.iter(|| {
        convolution
            .forward(FeatureMap::nchw(&signal), filters.view(), &bias)
            .unwrap()
    });
}

fn run_hwcn_convolution(bencher: &mut Bencher, input_size: usize) {
    let config = HwcnConfig {
        common: KernelConfig {
            in_channels: CHANNELS,
            out_channels: CHANNELS,
            burst_channels: CHANNELS,
            height: input_size,
            width: input_size,
            kernel_size: 3,
            images: 16,
            ..KernelConfig::default()
        },
        stride: 1,
        pad: 1,
    };
    let convolution = HwcnConvolution::new(config).unwrap();
    let mut rng = XorShiftRng::from_seed(*b"!seed seed seed!");
    let signal = random_array(&mut rng, [16, CHANNELS, input_size, input_size]);
    let filters = random_array(&mut rng, [CHANNELS, CHANNELS, 3, 3]);
    let bias = vec![0.0; CHANNELS];

    bencher.iter(|| {
        convolution
            .forward(FeatureMap::nchw(&signal), filters.view(), &bias)
            .unwrap()
    });
}

fn run_pooling(bencher: &mut Bencher, input_size: usize) {
    let config = PoolConfig {
        common: KernelConfig {
            in_channels: CHANNELS,
            burst_channels: CHANNELS,
            height: input_size,
            width: input_size,
            images: 16,
            ..KernelConfig::default()
        },
        pool_size: 3,
    };
    let pool = MaxPool::new(config).unwrap();
    let mut rng = XorShiftRng::from_seed(*b"!seed seed seed!");
    let signal = random_array(&mut rng, [16, CHANNELS, input_size, input_size]);

    bencher.iter(|| pool.forward(FeatureMap::nchw(&signal)).unwrap());
}

fn basic_benches(criterion: &mut Criterion) {
    criterion.bench(
        "fb_half_conv",
        ParameterizedBenchmark::new(
            "input_size",
            |bencher, &&size| run_convolution(bencher, size),
            INPUT_SIZES,
        )
        .sample_size(SAMPLE_SIZE),
    );
    criterion.bench(
        "hwcn_conv",
        ParameterizedBenchmark::new(
            "input_size",
            |bencher, &&size| run_hwcn_convolution(bencher, size),
            INPUT_SIZES,
        )
        .sample_size(SAMPLE_SIZE),
    );
    criterion.bench(
        "hwcn_pool",
        ParameterizedBenchmark::new(
            "input_size",
            |bencher, &&size| run_pooling(bencher, size),
            INPUT_SIZES,
        )
        .sample_size(SAMPLE_SIZE),
    );
}

criterion_group!(benches, basic_benches);
criterion_main!(benches);
