//! Invocation scheduling and the bookkeeping shared by forward and backward passes.

use log::debug;
use ndarray::{Array, Dimension, Ix4};

use crate::{buffers::Lanes, params::ConfigError};

/// Slice of the work addressed by a single kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Invocation {
    /// Block of `images` consecutive images.
    pub image_block: usize,
    /// Convolution group.
    pub group: usize,
}

/// Token returned once every invocation of a dispatch has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "outputs may only be read after the dispatch has completed"]
pub struct Completion {
    invocations: usize,
}

impl Completion {
    /// Number of completed invocations.
    pub fn invocations(&self) -> usize {
        self.invocations
    }
}

/// Issues one kernel invocation per `(image block, group)` pair, image blocks being
/// the outer loop.
///
/// Invocations run sequentially; an invocation observes all writes of the preceding ones.
/// The first failing invocation stops the dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatcher {
    image_blocks: usize,
    groups: usize,
}

impl Dispatcher {
    /// Creates a dispatcher over `image_blocks x groups` invocations.
    pub fn new(image_blocks: usize, groups: usize) -> Self {
        Self {
            image_blocks,
            groups,
        }
    }

    /// Iterates over invocations in the dispatch order.
    pub fn invocations(&self) -> impl Iterator<Item = Invocation> {
        let groups = self.groups;
        (0..self.image_blocks).flat_map(move |image_block| {
            (0..groups).map(move |group| Invocation { image_block, group })
        })
    }

    /// Runs `kernel` for every invocation.
    ///
    /// # Errors
    ///
    /// Propagates the error of the first failing invocation. Since kernels check their
    /// arguments before writing, invocations preceding the failing one have completed,
    /// and the following ones have not been issued.
    pub fn dispatch<F>(&self, mut kernel: F) -> Result<Completion, ConfigError>
    where
        F: FnMut(Invocation) -> Result<(), ConfigError>,
    {
        let mut invocations = 0;
        for invocation in self.invocations() {
            kernel(invocation)?;
            invocations += 1;
        }
        debug!(
            "dispatched {} invocations ({} image blocks x {} groups)",
            invocations, self.image_blocks, self.groups
        );
        Ok(Completion { invocations })
    }
}

/// Storage layout of an activation mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskLayout {
    /// Byte per element in the channel-major tiled layout with the given row padding.
    Tiled {
        /// Half of the padded row width.
        tile_pad: usize,
    },
    /// Byte per element in the image-major layout of fully-connected layers.
    Rows,
    /// Bit per image in the HWCN layout.
    Hwcn,
    /// Winning window slot per element of an HWCN max-pooling output.
    PoolArgmax {
        /// Pooling window size.
        pool_size: usize,
    },
}

/// Identifies the tensor an activation mask was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskKey {
    /// Layout of the mask.
    pub layout: MaskLayout,
    /// NCHW shape of the masked tensor; fully-connected activations have shape `[N, C, 1, 1]`.
    pub shape: [usize; 4],
}

/// Result of a forward pass: the output tensor together with the mask recorded
/// by the kernel.
///
/// Backward passes consuming the mask borrow the `ForwardPass`, so a mask can only be read
/// after the forward pass producing it has completed. The [`MaskKey`] is compared with
/// the layout the backward pass reads.
#[derive(Debug, Clone)]
pub struct ForwardPass<D: Dimension = Ix4, M = Lanes<u8>> {
    output: Array<f32, D>,
    mask: Option<Vec<M>>,
    key: MaskKey,
}

impl<D: Dimension, M: Clone> ForwardPass<D, M> {
    pub(crate) fn new(output: Array<f32, D>, mask: Option<Vec<M>>, key: MaskKey) -> Self {
        Self { output, mask, key }
    }

    /// Output of the pass.
    pub fn output(&self) -> &Array<f32, D> {
        &self.output
    }

    /// Consumes the pass, returning its output.
    pub fn into_output(self) -> Array<f32, D> {
        self.output
    }

    /// Packed mask recorded by the pass, if any.
    pub fn mask(&self) -> Option<&[M]> {
        self.mask.as_deref()
    }

    /// Identifies the tensor the mask belongs to.
    pub fn key(&self) -> &MaskKey {
        &self.key
    }

    /// Returns a copy of the mask after checking it against the layout read by
    /// a backward pass.
    pub(crate) fn checked_mask(&self, expected: &MaskKey) -> Result<Vec<M>, ConfigError> {
        if self.key != *expected {
            return Err(ConfigError::MaskMismatch {
                expected: *expected,
                actual: self.key,
            });
        }
        self.mask.clone().ok_or(ConfigError::MissingMask)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;

    #[test]
    fn image_blocks_are_the_outer_loop() {
        let dispatcher = Dispatcher::new(2, 3);
        let order: Vec<_> = dispatcher
            .invocations()
            .map(|inv| (inv.image_block, inv.group))
            .collect();
        assert_eq!(order, [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn dispatch_stops_at_first_error() {
        let dispatcher = Dispatcher::new(2, 2);
        let mut issued = vec![];
        let err = dispatcher
            .dispatch(|inv| {
                issued.push(inv);
                if inv.image_block == 1 {
                    Err(ConfigError::MissingMask)
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingMask);
        assert_eq!(issued.len(), 3);

        let completion = dispatcher.dispatch(|_| Ok(())).unwrap();
        assert_eq!(completion.invocations(), 4);
    }

    #[test]
    fn mask_keys_are_checked() {
        let key = MaskKey {
            layout: MaskLayout::Tiled { tile_pad: 8 },
            shape: [1, 16, 16, 16],
        };
        let pass = ForwardPass::new(Array4::zeros([1, 16, 16, 16]), Some(vec![[1_u8; 16]; 256]), key);
        assert_eq!(pass.checked_mask(&key).unwrap().len(), 256);

        let other = MaskKey {
            layout: MaskLayout::Tiled { tile_pad: 16 },
            ..key
        };
        assert_eq!(
            pass.checked_mask(&other),
            Err(ConfigError::MaskMismatch {
                expected: other,
                actual: key,
            })
        );

        let unmasked = ForwardPass::<Ix4, Lanes<u8>>::new(Array4::zeros([1, 16, 16, 16]), None, key);
        assert_eq!(unmasked.checked_mask(&key), Err(ConfigError::MissingMask));
    }
}
