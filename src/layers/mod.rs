//! Host-side layers: pack `ndarray` tensors, dispatch kernel invocations over image blocks
//! and groups, and unpack the results.

use crate::{params::ConfigError, Half};

mod conv;
mod dense;
mod hwcn;

pub use self::{
    conv::{Convolution, DirectConvolution},
    dense::FullyConnected,
    hwcn::{HwcnConvolution, MaxPool},
};

fn check_shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<(), ConfigError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ConfigError::Shape {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

/// Number of image blocks in a batch.
fn image_blocks(batch_size: usize, images: usize) -> Result<usize, ConfigError> {
    if batch_size == 0 || batch_size % images != 0 {
        return Err(ConfigError::Alignment {
            name: "batch_size",
            value: batch_size,
            factor: images,
        });
    }
    Ok(batch_size / images)
}

fn to_half(values: &[f32]) -> Vec<Half> {
    values.iter().copied().map(Half::from_f32).collect()
}
