//! Memory-bounded batching for host execution.
//!
//! The planner only decides how much work is in flight at once. Any batch
//! size at or below its bounds yields the same features.
use crate::{
    architecture::{Architecture, PoolType},
    ImagePrecision,
};
use std::mem::size_of;

const BYTES_PER_VALUE: usize = size_of::<ImagePrecision>();

/// Memory the extraction may occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub bytes: usize,
}

impl MemoryBudget {
    pub fn from_megabytes(megabytes: usize) -> Self {
        Self {
            bytes: megabytes.saturating_mul(1 << 20),
        }
    }
}

impl Default for MemoryBudget {
    /// 2 GiB
    fn default() -> Self {
        Self::from_megabytes(2048)
    }
}

pub struct BatchPlanner<'a> {
    arch: &'a Architecture,
    budget: MemoryBudget,
}

impl<'a> BatchPlanner<'a> {
    pub fn new(arch: &'a Architecture, budget: MemoryBudget) -> Self {
        Self { arch, budget }
    }

    /// Estimated peak number of bytes needed to push one image with
    /// `nvoxels` voxels and `nchannels` bands through every layer, assuming
    /// whole-image patch matrices. Layer outputs stay alive until the end,
    /// since they may feed skip connections.
    pub fn image_footprint(&self, nvoxels: usize, nchannels: usize) -> usize {
        let mut nvoxels = nvoxels.max(1);
        let mut channels = nchannels.max(1);
        let mut retained = nvoxels * channels;
        let mut peak = 0;

        for (index, layer) in self.arch.layers().iter().enumerate() {
            let dim3d = layer.kernel_size[2] > 1 || layer.pooling.size[2] > 1;
            let ntaps = layer.kernel_size[0]
                * layer.kernel_size[1]
                * if dim3d { layer.kernel_size[2] } else { 1 };
            let patch_dim = ntaps * channels;
            let convolved = nvoxels * layer.noutput_channels;
            let in_flight = retained + nvoxels * patch_dim + 2 * convolved;
            peak = peak.max(in_flight);

            if layer.pooling.kind != PoolType::NoPool && !self.arch.apply_intrinsic_atrous() {
                let stride = layer.pooling.stride.max(1);
                let reduction = if dim3d { stride.pow(3) } else { stride.pow(2) };
                nvoxels = (nvoxels / reduction).max(1);
            }
            channels = self.arch.channels_after(index);
            retained += nvoxels * channels;
        }
        peak.max(retained) * BYTES_PER_VALUE
    }

    /// Number of images that may be processed concurrently. Never below 1.
    pub fn batch_size_cpu(&self, nvoxels: usize, nchannels: usize) -> usize {
        let footprint = self.image_footprint(nvoxels, nchannels).max(1);
        (self.budget.bytes / footprint).max(1)
    }

    /// Number of voxels one convolution batch may hold when every worker
    /// thread builds its own patch matrix. Never below 1.
    pub fn voxels_per_batch(&self, patch_dim: usize, nkernels: usize) -> usize {
        voxels_per_batch(self.budget, patch_dim, nkernels)
    }
}

/// See [`BatchPlanner::voxels_per_batch`].
pub fn voxels_per_batch(budget: MemoryBudget, patch_dim: usize, nkernels: usize) -> usize {
    let per_voxel = (patch_dim + nkernels).max(1) * BYTES_PER_VALUE;
    let per_thread = budget.bytes / rayon::current_num_threads().max(1);
    (per_thread / per_voxel).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::LayerSpec;

    fn arch() -> Architecture {
        let layer =
            LayerSpec::new([3, 3, 1], 2, 4, 2).with_pooling(PoolType::AvgPool, [2, 2, 1], 2);
        Architecture::new(vec![layer], 0.1, false).unwrap()
    }

    #[test]
    fn test_footprint_of_single_layer() {
        let arch = arch();
        let planner = BatchPlanner::new(&arch, MemoryBudget::default());
        // input 64, patches 64 * 9, two convolution outputs 2 * 64 * 2
        let expected = (64 + 64 * 9 + 2 * 64 * 2) * 4;
        assert_eq!(planner.image_footprint(64, 1), expected);
    }

    #[test]
    fn test_batch_size_shrinks_with_budget() {
        let arch = arch();
        let large = BatchPlanner::new(&arch, MemoryBudget::from_megabytes(1024));
        let small = BatchPlanner::new(&arch, MemoryBudget { bytes: 10_000 });
        let tiny = BatchPlanner::new(&arch, MemoryBudget { bytes: 1 });
        assert!(large.batch_size_cpu(64, 1) > small.batch_size_cpu(64, 1));
        assert_eq!(small.batch_size_cpu(64, 1), 10_000 / ((64 + 576 + 256) * 4));
        assert_eq!(tiny.batch_size_cpu(64, 1), 1);
    }

    #[test]
    fn test_voxels_per_batch_is_positive() {
        assert_eq!(voxels_per_batch(MemoryBudget { bytes: 0 }, 9, 2), 1);
        assert!(voxels_per_batch(MemoryBudget::default(), 9, 2) > 1000);
    }
}
