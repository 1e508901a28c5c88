//! Marker-driven kernel estimation.
//!
//! Kernels of a layer are learned in three steps: marker statistics give the
//! normalization of the layer input, the normalized marker patches of every
//! class of every image are clustered into a per-image bank, and the
//! per-image banks are merged into the consensus bank of the layer.
//!
//! Kernels are handled as rows (one flattened kernel per row) while they are
//! being clustered and only transposed into the column layout of
//! [`KernelBank`](crate::kernel_bank::KernelBank) at the end.
use crate::{
    architecture::LayerSpec,
    batch_planner::MemoryBudget,
    clustering::{normalize_rows, principal_axes, KMeans},
    flim_errors::{FlimError, FlimResult},
    markers::{Label, MarkerSet},
    multiband_image::MultibandImage,
    patches::PatchNormalization,
    ImagePrecision, WeightPrecision,
};
use log::{debug, warn};
use ndarray::*;
use std::collections::BTreeMap;

/// Patches and kernels with a norm at or below this are treated as empty.
pub const NORM_EPSILON: WeightPrecision = 1e-6;

/// How per-image banks are merged into the consensus bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusStrategy {
    /// Centroids of a k-means over all per-image kernels.
    KMeans,
    /// Top principal axes of all per-image kernels.
    Pca,
}

impl Default for ConsensusStrategy {
    fn default() -> Self {
        ConsensusStrategy::KMeans
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingConfig {
    pub seed: u64,
    /// Upper bound on Lloyd iterations of every k-means run.
    pub max_iterations: usize,
    pub consensus: ConsensusStrategy,
    /// Memory the forward passes between layers may use.
    pub budget: MemoryBudget,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            max_iterations: 100,
            consensus: ConsensusStrategy::KMeans,
            budget: MemoryBudget::default(),
        }
    }
}

/// Mixes `parts` into `seed` (splitmix64 finalizer per part), so that every
/// clustering call gets its own reproducible stream.
pub fn derive_seed(seed: u64, parts: &[u64]) -> u64 {
    parts.iter().fold(seed, |acc, &part| {
        let mut z = (acc ^ part).wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    })
}

/// Per-band mean and population standard deviation over the marked voxels
/// of every image, tiled over the `ntaps` taps of the layer's adjacency.
///
/// The deviation is widened by `stdev_factor`; a deviation that stays at or
/// below [`NORM_EPSILON`] is replaced by 1.
pub fn marker_statistics(
    samples: &[(&MultibandImage, &MarkerSet)],
    ntaps: usize,
    stdev_factor: f32,
    layer: usize,
) -> FlimResult<PatchNormalization> {
    let nbands = samples.first().map(|(img, _)| img.nbands()).unwrap_or(0);
    let mut sum = Array1::<f64>::zeros(nbands);
    let mut sum_sq = Array1::<f64>::zeros(nbands);
    let mut count = 0usize;

    for (image_index, (image, markers)) in samples.iter().enumerate() {
        if image.nbands() != nbands {
            return Err(FlimError::DimensionMismatchError {
                layer,
                expected: nbands,
                found: image.nbands(),
            });
        }
        if markers.is_empty() {
            return Err(FlimError::InsufficientMarkersError {
                image: image_index,
                layer,
                class: None,
            });
        }
        for (label, voxels) in markers.by_class_within(image) {
            if voxels.is_empty() {
                return Err(FlimError::InsufficientMarkersError {
                    image: image_index,
                    layer,
                    class: Some(label),
                });
            }
            for voxel in &voxels {
                for (b, &v) in image.band_values(voxel).iter().enumerate() {
                    sum[b] += v as f64;
                    sum_sq[b] += (v as f64) * (v as f64);
                }
            }
            count += voxels.len();
        }
    }
    if count == 0 {
        return Err(FlimError::EmptyPatchSetError(format!(
            "layer {}: no marked voxel in any training image",
            layer
        )));
    }

    let n = count as f64;
    let mean = sum.mapv(|s| s / n);
    let stdev = Zip::from(&sum_sq).and(&mean).map_collect(|&sq, &m| {
        let var = (sq / n - m * m).max(0.0);
        let s = var.sqrt() as WeightPrecision + stdev_factor;
        if s <= NORM_EPSILON {
            1.0
        } else {
            s
        }
    });
    let mean = mean.mapv(|m| m as WeightPrecision);
    debug!(
        "Layer {}: marker statistics over {} voxels, mean {}, stdev {}",
        layer, count, mean, stdev
    );
    Ok(PatchNormalization::tiled(mean.view(), stdev.view(), ntaps))
}

/// Keeps the patches with a usable norm and scales them to unit norm.
pub fn valid_patches(patches: ArrayView2<ImagePrecision>) -> Array2<WeightPrecision> {
    let keep: Vec<usize> = patches
        .rows()
        .into_iter()
        .enumerate()
        .filter(|(_, row)| row.dot(row).sqrt() > NORM_EPSILON)
        .map(|(i, _)| i)
        .collect();
    normalize_rows(patches.select(Axis(0), &keep), NORM_EPSILON)
}

/// Learns kernels for one layer from normalized marker patches.
pub struct KernelEstimator<'a> {
    spec: &'a LayerSpec,
    layer: usize,
    config: &'a TrainingConfig,
}

impl<'a> KernelEstimator<'a> {
    pub fn new(spec: &'a LayerSpec, layer: usize, config: &'a TrainingConfig) -> Self {
        Self {
            spec,
            layer,
            config,
        }
    }

    fn cluster(
        &self,
        data: ArrayView2<WeightPrecision>,
        k: usize,
        seed: u64,
    ) -> Array2<WeightPrecision> {
        let mut kmeans = KMeans::new(k, seed).with_max_iter(self.config.max_iterations);
        kmeans.fit(data);
        normalize_rows(kmeans.into_centroids(), NORM_EPSILON)
    }

    /// Kernel bank of one training image, one kernel per row.
    ///
    /// Every class contributes up to `nkernels_per_marker` centroids, classes
    /// in ascending label order. A bank wider than `nkernels_per_image` is
    /// clustered down to that width.
    pub fn image_bank(
        &self,
        patches: &BTreeMap<Label, Array2<ImagePrecision>>,
        image_index: usize,
    ) -> FlimResult<Array2<WeightPrecision>> {
        let nclasses = patches.len();
        let per_class = self.spec.nkernels_per_marker;
        if nclasses == 0 {
            return Err(FlimError::InsufficientMarkersError {
                image: image_index,
                layer: self.layer,
                class: None,
            });
        }
        if self.spec.nkernels_per_image % (per_class * nclasses) != 0 {
            warn!(
                "Layer {}, image {}: nkernels_per_image = {} is not a multiple of \
                 {} kernels per marker times {} classes",
                self.layer,
                image_index,
                self.spec.nkernels_per_image,
                per_class,
                nclasses
            );
        }

        let mut class_kernels = Vec::with_capacity(nclasses);
        for (&label, class_patches) in patches {
            let valid = valid_patches(class_patches.view());
            if valid.nrows() == 0 {
                return Err(FlimError::EmptyPatchSetError(format!(
                    "layer {}, image {}, class {}: every patch vanishes after normalization",
                    self.layer, image_index, label
                )));
            }
            if valid.nrows() < per_class {
                warn!(
                    "Layer {}, image {}, class {}: only {} valid patches for {} kernels per \
                     marker; the class contributes {} kernels",
                    self.layer,
                    image_index,
                    label,
                    valid.nrows(),
                    per_class,
                    valid.nrows()
                );
            }
            let seed = derive_seed(
                self.config.seed,
                &[self.layer as u64, image_index as u64, label as u64],
            );
            class_kernels.push(self.cluster(valid.view(), per_class, seed));
        }
        let views: Vec<ArrayView2<WeightPrecision>> =
            class_kernels.iter().map(|k| k.view()).collect();
        let bank = concatenate(Axis(0), &views)
            .map_err(|e| FlimError::ArchitectureMismatchError(e.to_string()))?;

        if bank.nrows() > self.spec.nkernels_per_image {
            let seed = derive_seed(
                self.config.seed,
                &[self.layer as u64, image_index as u64, u64::MAX],
            );
            Ok(self.cluster(bank.view(), self.spec.nkernels_per_image, seed))
        } else {
            Ok(bank)
        }
    }

    /// Consensus bank of exactly `noutput_channels` kernels, one kernel per row.
    ///
    /// The per-image banks are stacked in image order, which is the order
    /// clustering sees them in: with equal distances, earlier kernels win.
    pub fn consensus(
        &self,
        image_banks: &[Array2<WeightPrecision>],
    ) -> FlimResult<Array2<WeightPrecision>> {
        let target = self.spec.noutput_channels;
        let views: Vec<ArrayView2<WeightPrecision>> =
            image_banks.iter().map(|b| b.view()).collect();
        if views.is_empty() {
            return Err(FlimError::EmptyPatchSetError(format!(
                "layer {}: no per-image kernel bank to merge",
                self.layer
            )));
        }
        let union = concatenate(Axis(0), &views)
            .map_err(|e| FlimError::ArchitectureMismatchError(e.to_string()))?;
        if union.nrows() < target {
            return Err(FlimError::ArchitectureMismatchError(format!(
                "layer {}: {} output channels requested, but the training images only provide {} kernels",
                self.layer,
                target,
                union.nrows()
            )));
        }
        if union.nrows() == target {
            return Ok(union);
        }
        match self.config.consensus {
            ConsensusStrategy::KMeans => {
                let seed = derive_seed(self.config.seed, &[self.layer as u64, u64::MAX]);
                Ok(self.cluster(union.view(), target, seed))
            }
            ConsensusStrategy::Pca => {
                if target > union.ncols() {
                    return Err(FlimError::ArchitectureMismatchError(format!(
                        "layer {}: {} principal axes requested from {}-dimensional kernels",
                        self.layer,
                        target,
                        union.ncols()
                    )));
                }
                Ok(principal_axes(union.view(), target))
            }
        }
    }
}

/// Column layout of a row-wise kernel set.
pub fn kernels_as_columns(rows: Array2<WeightPrecision>) -> Array2<WeightPrecision> {
    rows.reversed_axes().as_standard_layout().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiband_image::Voxel;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_marker_statistics() {
        let img = MultibandImage::from_gray(array![[1., 3.], [5., 100.]].view());
        let mut markers = MarkerSet::new();
        markers.push(Voxel::new_2d(0, 0), 1);
        markers.push(Voxel::new_2d(1, 0), 2);
        markers.push(Voxel::new_2d(0, 1), 2);
        markers.push(Voxel::new_2d(9, 9), 2);
        let norm = marker_statistics(&[(&img, &markers)], 2, 0.5, 0).unwrap();
        // values 1, 3, 5: mean 3, population variance 8/3
        assert_abs_diff_eq!(norm.mean[0], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(norm.stdev[0], (8.0f32 / 3.0).sqrt() + 0.5, epsilon = 1e-5);
        assert_eq!(norm.len(), 2);
        assert_eq!(norm.mean[0], norm.mean[1]);
    }

    #[test]
    fn test_constant_markers_get_unit_stdev() {
        let img = MultibandImage::from_gray(Array2::from_elem((3, 3), 2.0).view());
        let mut markers = MarkerSet::new();
        markers.push(Voxel::new_2d(1, 1), 1);
        let norm = marker_statistics(&[(&img, &markers)], 1, 0.0, 0).unwrap();
        assert_eq!(norm.stdev, array![1.0]);
        assert_eq!(norm.mean, array![2.0]);
    }

    #[test]
    fn test_statistics_need_markers() {
        let img = MultibandImage::zeros(3, 3, 1, 1);
        let err = marker_statistics(&[(&img, &MarkerSet::new())], 1, 0.1, 3).unwrap_err();
        assert!(matches!(
            err,
            FlimError::InsufficientMarkersError {
                image: 0,
                layer: 3,
                class: None
            }
        ));
    }

    #[test]
    fn test_valid_patches_drop_empty_rows() {
        let valid = valid_patches(array![[0., 0.], [3., 4.], [1e-8, 0.]].view());
        assert_eq!(valid, array![[0.6, 0.8]]);
    }

    #[test]
    fn test_derived_seeds_differ() {
        let a = derive_seed(42, &[0, 0, 1]);
        let b = derive_seed(42, &[0, 0, 2]);
        let c = derive_seed(42, &[0, 1, 1]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, derive_seed(42, &[0, 0, 1]));
    }

    fn patches() -> BTreeMap<Label, Array2<f32>> {
        let mut patches = BTreeMap::new();
        patches.insert(
            1,
            array![[1., 0.1, 0.], [1., 0., 0.1], [0., 1., 0.], [0.1, 1., 0.]],
        );
        patches.insert(2, array![[0., 0., 1.], [0., 0.1, 1.], [-1., 0., 0.]]);
        patches
    }

    #[test]
    fn test_image_bank_width_and_norm() {
        let spec = LayerSpec::new([3, 1, 1], 2, 4, 2);
        let config = TrainingConfig::default();
        let estimator = KernelEstimator::new(&spec, 0, &config);
        let bank = estimator.image_bank(&patches(), 0).unwrap();
        assert_eq!(bank.dim(), (4, 3));
        for row in bank.rows() {
            assert_abs_diff_eq!(row.dot(&row), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_image_bank_is_reduced_to_nkernels_per_image() {
        let spec = LayerSpec::new([3, 1, 1], 2, 3, 2);
        let config = TrainingConfig::default();
        let bank = KernelEstimator::new(&spec, 0, &config)
            .image_bank(&patches(), 0)
            .unwrap();
        assert_eq!(bank.nrows(), 3);
    }

    #[test]
    fn test_sparse_class_contributes_fewer_kernels() {
        let spec = LayerSpec::new([3, 1, 1], 2, 4, 2);
        let config = TrainingConfig::default();
        let mut p = patches();
        p.insert(2, array![[0., 0., 2.]]);
        let bank = KernelEstimator::new(&spec, 0, &config)
            .image_bank(&p, 0)
            .unwrap();
        assert_eq!(bank.nrows(), 3);
        assert_eq!(bank.row(2), array![0., 0., 1.]);
    }

    #[test]
    fn test_image_bank_rejects_vanishing_class() {
        let spec = LayerSpec::new([3, 1, 1], 2, 4, 2);
        let config = TrainingConfig::default();
        let mut p = patches();
        p.insert(5, Array2::zeros((2, 3)));
        assert!(matches!(
            KernelEstimator::new(&spec, 0, &config).image_bank(&p, 0),
            Err(FlimError::EmptyPatchSetError(_))
        ));
    }

    #[test]
    fn test_consensus() {
        let spec = LayerSpec::new([3, 1, 1], 2, 4, 2);
        let banks = vec![
            array![[1., 0., 0.], [0., 1., 0.]],
            array![[0.9, 0.1, 0.], [0., 0., 1.]],
        ];
        let config = TrainingConfig::default();
        let estimator = KernelEstimator::new(&spec, 0, &config);
        assert_eq!(estimator.consensus(&banks).unwrap().dim(), (2, 3));

        let pca = TrainingConfig {
            consensus: ConsensusStrategy::Pca,
            ..TrainingConfig::default()
        };
        assert_eq!(
            KernelEstimator::new(&spec, 0, &pca).consensus(&banks).unwrap().dim(),
            (2, 3)
        );

        let wide = LayerSpec::new([3, 1, 1], 2, 4, 5);
        assert!(matches!(
            KernelEstimator::new(&wide, 0, &config).consensus(&banks),
            Err(FlimError::ArchitectureMismatchError(_))
        ));
    }

    #[test]
    fn test_estimation_is_deterministic() {
        let spec = LayerSpec::new([3, 1, 1], 2, 4, 3);
        let config = TrainingConfig {
            seed: 7,
            ..TrainingConfig::default()
        };
        let run = || {
            let estimator = KernelEstimator::new(&spec, 1, &config);
            let banks = vec![
                estimator.image_bank(&patches(), 0).unwrap(),
                estimator.image_bank(&patches(), 1).unwrap(),
            ];
            estimator.consensus(&banks).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_kernels_as_columns() {
        let cols = kernels_as_columns(array![[1., 2., 3.], [4., 5., 6.]]);
        assert_eq!(cols, array![[1., 4.], [2., 5.], [3., 6.]]);
        assert!(cols.is_standard_layout());
    }
}
