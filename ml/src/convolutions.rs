use crate::{
    adjacency::AdjacencyRelation,
    backend::ComputeBackend,
    batch_planner::{voxels_per_batch, MemoryBudget},
    flim_errors::{FlimError, FlimResult},
    kernel_bank::KernelBank,
    multiband_image::MultibandImage,
    patches::PatchSampler,
    ImagePrecision,
};
use log::debug;
use ndarray::*;

/// Convolutional layer applying a learned kernel bank through an adjacency
/// relation.
///
/// Every voxel of the input contributes one normalized patch, which is
/// projected onto every kernel column, so the output keeps the spatial
/// domain of the input and has one band per kernel.
pub struct ConvolutionLayer<'a> {
    bank: &'a KernelBank,
    adjacency: AdjacencyRelation,
    /// Index of the layer in its network, used to report failures.
    layer: usize,
    budget: MemoryBudget,
    batch_voxels: Option<usize>,
}

impl<'a> ConvolutionLayer<'a> {
    pub fn new(bank: &'a KernelBank, adjacency: AdjacencyRelation, layer: usize) -> Self {
        Self {
            bank,
            adjacency,
            layer,
            budget: MemoryBudget::default(),
            batch_voxels: None,
        }
    }

    /// Memory the patch matrices of all worker threads may occupy together.
    pub fn with_budget(mut self, budget: MemoryBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Fixes the number of voxels per batch instead of deriving it from the
    /// memory budget.
    pub fn with_batch_voxels(mut self, batch_voxels: usize) -> Self {
        self.batch_voxels = Some(batch_voxels.max(1));
        self
    }

    pub fn adjacency(&self) -> &AdjacencyRelation {
        &self.adjacency
    }

    /// Performs the convolution. Voxels are processed in batches (im2col
    /// style: one patch row per voxel, then a single matrix product), and the
    /// batches are handed to `backend`.
    pub fn convolve(
        &self,
        image: &MultibandImage,
        backend: &dyn ComputeBackend,
    ) -> FlimResult<MultibandImage> {
        let sampler = PatchSampler::new(&self.adjacency, Some(self.bank.normalization()));
        let patch_dim = sampler.patch_dim(image.nbands());
        if patch_dim != self.bank.patch_dim() {
            return Err(FlimError::DimensionMismatchError {
                layer: self.layer,
                expected: self.bank.patch_dim(),
                found: patch_dim,
            });
        }
        sampler.check_dims(image, self.layer)?;

        let nvoxels = image.nvoxels();
        let batch = self
            .batch_voxels
            .unwrap_or_else(|| voxels_per_batch(self.budget, patch_dim, self.bank.nkernels()));
        let nbatches = (nvoxels + batch - 1) / batch;
        debug!(
            "Layer {}: convolving {} voxels with {} kernels in {} batches on the {} backend",
            self.layer,
            nvoxels,
            self.bank.nkernels(),
            nbatches,
            backend.name()
        );

        let weights = self.bank.weights();
        let bias = self.bank.bias();
        let job = |i: usize| -> Array2<ImagePrecision> {
            let range = i * batch..((i + 1) * batch).min(nvoxels);
            let patches = sampler.im2col(image, range);
            let mut projected = patches.dot(weights);
            if let Some(b) = bias {
                projected += b;
            }
            projected
        };
        let batches = backend.run_batches(nbatches, &job);

        let views: Vec<ArrayView2<ImagePrecision>> = batches.iter().map(|b| b.view()).collect();
        let matrix = if views.is_empty() {
            Array2::zeros((0, self.bank.nkernels()))
        } else {
            concatenate(Axis(0), &views)
                .map_err(|e| FlimError::ArchitectureMismatchError(e.to_string()))?
        };
        MultibandImage::from_voxel_matrix(image.extents(), matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{HostBackend, SerialBackend},
        multiband_image::Voxel,
        patches::PatchNormalization,
    };

    fn bank_3x3(weights: Array2<f32>) -> KernelBank {
        let dim = weights.nrows();
        KernelBank::new(weights, PatchNormalization::identity(dim), None).unwrap()
    }

    #[test]
    fn test_identity_kernel() {
        let img = MultibandImage::from_gray(array![[1., 2., 3.], [4., 5., 6.]].view());
        let mut w = Array2::zeros((9, 1));
        w[[4, 0]] = 1.0;
        let bank = bank_3x3(w);
        let adj = AdjacencyRelation::cuboid([3, 3, 1], [1, 1, 1]).unwrap();
        let out = ConvolutionLayer::new(&bank, adj, 0)
            .convolve(&img, &SerialBackend)
            .unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_box_kernel_with_zero_padding() {
        let img = MultibandImage::from_gray(Array2::from_elem((3, 3), 1.0).view());
        let bank = bank_3x3(Array2::from_elem((9, 1), 1.0));
        let adj = AdjacencyRelation::cuboid([3, 3, 1], [1, 1, 1]).unwrap();
        let out = ConvolutionLayer::new(&bank, adj, 0)
            .convolve(&img, &SerialBackend)
            .unwrap();
        let expected = array![[4., 6., 4.], [6., 9., 6.], [4., 6., 4.]];
        assert_eq!(out, MultibandImage::from_gray(expected.view()));
    }

    #[test]
    fn test_box_kernel_on_volume() {
        let img = MultibandImage::new(Array4::from_elem((3, 3, 3, 1), 1.0));
        let weights = Array2::from_elem((27, 1), 1.0);
        let bank = KernelBank::new(weights, PatchNormalization::identity(27), None).unwrap();
        let adj = AdjacencyRelation::cuboid([3, 3, 3], [1, 1, 1]).unwrap();
        let out = ConvolutionLayer::new(&bank, adj, 0)
            .with_batch_voxels(4)
            .convolve(&img, &HostBackend)
            .unwrap();
        assert_eq!(out.extents(), [3, 3, 3]);
        assert_eq!(out.band_values(&Voxel::new(1, 1, 1))[0], 27.0);
        assert_eq!(out.band_values(&Voxel::new(1, 1, 0))[0], 18.0);
        assert_eq!(out.band_values(&Voxel::new(0, 0, 0))[0], 8.0);
    }

    #[test]
    fn test_output_channels_follow_bank_width_and_bias() {
        let img = MultibandImage::from_gray(Array2::from_elem((4, 5), 2.0).view());
        let bank = KernelBank::new(
            Array2::zeros((1, 3)),
            PatchNormalization::identity(1),
            Some(array![1., 2., 3.]),
        )
        .unwrap();
        let adj = AdjacencyRelation::cuboid([1, 1, 1], [1, 1, 1]).unwrap();
        let out = ConvolutionLayer::new(&bank, adj, 0)
            .convolve(&img, &SerialBackend)
            .unwrap();
        assert_eq!(out.nbands(), 3);
        assert_eq!(out.extents(), [5, 4, 1]);
        assert_eq!(out.band_values(&Voxel::new_2d(4, 3)), array![1., 2., 3.]);
    }

    #[test]
    fn test_mean_patch_projects_to_zero() {
        let mean = array![0.5, -1.0];
        let img = MultibandImage::from_2d(Array3::from_shape_fn((4, 4, 2), |(_, _, b)| mean[b]));
        let adj = AdjacencyRelation::cuboid([3, 3, 1], [1, 1, 1]).unwrap();
        let norm = PatchNormalization::tiled(mean.view(), array![0.3, 2.0].view(), adj.len());
        let weights = Array2::from_shape_fn((18, 4), |(i, j)| ((i * 3 + j) % 7) as f32 - 3.0);
        let bank = KernelBank::new(weights, norm, None).unwrap();
        let out = ConvolutionLayer::new(&bank, adj, 0)
            .convolve(&img, &HostBackend)
            .unwrap();
        assert!(out.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_batching_and_backends_agree() {
        let img = MultibandImage::from_2d(Array3::from_shape_fn((7, 9, 2), |(y, x, b)| {
            ((x * 31 + y * 17 + b * 5) % 13) as f32
        }));
        let weights = Array2::from_shape_fn((18, 3), |(i, j)| ((i + 2 * j) % 5) as f32 - 2.0);
        let bank = bank_3x3(weights);
        let adj = AdjacencyRelation::cuboid([3, 3, 1], [2, 2, 1]).unwrap();
        let whole = ConvolutionLayer::new(&bank, adj.clone(), 0)
            .convolve(&img, &SerialBackend)
            .unwrap();
        let batched = ConvolutionLayer::new(&bank, adj, 0)
            .with_batch_voxels(5)
            .convolve(&img, &HostBackend)
            .unwrap();
        assert_eq!(whole, batched);
    }

    #[test]
    fn test_dimension_mismatch() {
        let img = MultibandImage::zeros(4, 4, 1, 2);
        let bank = bank_3x3(Array2::zeros((9, 2)));
        let adj = AdjacencyRelation::cuboid([3, 3, 1], [1, 1, 1]).unwrap();
        let err = ConvolutionLayer::new(&bank, adj, 5)
            .convolve(&img, &SerialBackend)
            .unwrap_err();
        assert!(matches!(
            err,
            FlimError::DimensionMismatchError {
                layer: 5,
                expected: 9,
                found: 18
            }
        ));
    }
}
