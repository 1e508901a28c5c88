//! Learning the kernel banks of a FLIM network from marked training images.
//!
//! Layers are learned one after the other. Once the bank of a layer is
//! known, every training image is pushed through that layer and its markers
//! are carried over to the pooled grid, which gives the training set of the
//! next layer.
use crate::{
    adjacency::AdjacencyRelation,
    architecture::Architecture,
    backend::{ComputeBackend, HostBackend},
    flim_errors::{FlimError, FlimResult},
    kernel_bank::KernelBank,
    kernel_estimation::{kernels_as_columns, marker_statistics, KernelEstimator, TrainingConfig},
    markers::MarkerSet,
    multiband_image::{MultibandImage, Voxel},
    patches::PatchSampler,
    pipeline::forward_layer,
    WeightPrecision,
};
use log::info;
use ndarray::Array2;
use rayon::prelude::*;

/// A training image with its markers, both in the input space of the layer
/// being learned.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub image: MultibandImage,
    pub markers: MarkerSet,
}

impl TrainingSample {
    pub fn new(image: MultibandImage, markers: MarkerSet) -> Self {
        Self { image, markers }
    }
}

pub struct FlimTrainer<'a> {
    arch: &'a Architecture,
    config: TrainingConfig,
    backend: Box<dyn ComputeBackend>,
}

impl<'a> FlimTrainer<'a> {
    pub fn new(arch: &'a Architecture, config: TrainingConfig) -> Self {
        Self {
            arch,
            config,
            backend: Box::new(HostBackend),
        }
    }

    /// Backend running the forward passes between layers.
    pub fn with_backend(mut self, backend: Box<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Learns the bank of layer `index` from samples given in that layer's
    /// input space (the training images for layer 0, the activations of
    /// layer `index - 1` otherwise).
    pub fn learn_layer(
        &self,
        index: usize,
        samples: &[TrainingSample],
    ) -> FlimResult<KernelBank> {
        let spec = self.arch.layer(index)?;
        let first = samples.first().ok_or_else(|| {
            FlimError::EmptyPatchSetError(format!("layer {}: no training image", index))
        })?;
        let dim3d = first.image.is_3d();
        let adjacency = AdjacencyRelation::adaptive_from_layer(
            spec,
            self.arch.atrous_factor_at(index),
            dim3d,
        )?;

        let pairs: Vec<(&MultibandImage, &MarkerSet)> =
            samples.iter().map(|s| (&s.image, &s.markers)).collect();
        let normalization =
            marker_statistics(&pairs, adjacency.len(), self.arch.stdev_factor(), index)?;

        let sampler = PatchSampler::new(&adjacency, Some(&normalization));
        let estimator = KernelEstimator::new(spec, index, &self.config);
        let image_banks: FlimResult<Vec<Array2<WeightPrecision>>> = samples
            .par_iter()
            .enumerate()
            .map(|(image_index, sample)| {
                let patches =
                    sampler.sample_markers(&sample.image, &sample.markers, image_index, index)?;
                estimator.image_bank(&patches, image_index)
            })
            .collect();
        let image_banks = image_banks?;
        let consensus = estimator.consensus(&image_banks)?;

        info!(
            "Layer {}: learned {} kernels of dimension {} from {} images ({} per-image kernels)",
            index,
            consensus.nrows(),
            consensus.ncols(),
            samples.len(),
            image_banks.iter().map(|b| b.nrows()).sum::<usize>()
        );
        KernelBank::new(kernels_as_columns(consensus), normalization, None)
    }

    /// Learns the banks of every layer, in layer order.
    pub fn learn_model(&self, samples: &[TrainingSample]) -> FlimResult<Vec<KernelBank>> {
        let nlayers = self.arch.nlayers();
        let mut banks = Vec::with_capacity(nlayers);
        let mut current = samples.to_vec();
        let mut history: Vec<Vec<MultibandImage>> =
            vec![Vec::with_capacity(nlayers); samples.len()];

        for index in 0..nlayers {
            let bank = self.learn_layer(index, &current)?;
            if index + 1 < nlayers {
                let mut next = Vec::with_capacity(current.len());
                for (sample, earlier) in current.iter().zip(history.iter_mut()) {
                    let output = forward_layer(
                        self.arch,
                        index,
                        &bank,
                        &sample.image,
                        earlier,
                        self.backend.as_ref(),
                        self.config.budget,
                    )?;
                    let extents = output.features.extents();
                    let markers = match &output.pooling {
                        Some(geometry) => sample
                            .markers
                            .map_voxels(|v: &Voxel| geometry.map_voxel(v, extents)),
                        None => sample.markers.clone(),
                    };
                    earlier.push(output.features.clone());
                    next.push(TrainingSample::new(output.features, markers));
                }
                current = next;
            }
            banks.push(bank);
        }
        Ok(banks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        architecture::{LayerSpec, PoolType},
        kernel_estimation::ConsensusStrategy,
        pipeline::{FeatureExtractor, FlimNetwork},
    };
    use approx::assert_abs_diff_eq;
    use ndarray::*;

    /// 8x8 image, dark left half with a bright diagonal stripe on the right.
    fn image() -> MultibandImage {
        MultibandImage::from_gray(
            Array2::from_shape_fn((8, 8), |(y, x)| {
                if x < 4 {
                    (x * y % 3) as f32 * 0.1
                } else if (x + y) % 3 == 0 {
                    1.0
                } else {
                    0.6
                }
            })
            .view(),
        )
    }

    fn markers() -> MarkerSet {
        let mut markers = MarkerSet::new();
        for &(x, y) in &[(1, 1), (2, 2), (1, 5), (2, 6)] {
            markers.push(Voxel::new_2d(x, y), 1);
        }
        for &(x, y) in &[(5, 1), (6, 2), (5, 5), (6, 6)] {
            markers.push(Voxel::new_2d(x, y), 2);
        }
        markers
    }

    fn single_layer() -> Architecture {
        let layer =
            LayerSpec::new([3, 3, 1], 2, 4, 2).with_pooling(PoolType::AvgPool, [2, 2, 1], 2);
        Architecture::new(vec![layer], 0.1, false).unwrap()
    }

    #[test]
    fn test_end_to_end() {
        let arch = single_layer();
        let trainer = FlimTrainer::new(&arch, TrainingConfig::default());
        let banks = trainer
            .learn_model(&[TrainingSample::new(image(), markers())])
            .unwrap();
        assert_eq!(banks.len(), 1);
        assert_eq!(banks[0].nkernels(), 2);
        assert_eq!(banks[0].patch_dim(), 9);

        let net = FlimNetwork::new(arch, banks).unwrap();
        let features = net.extract_features(&image()).unwrap();
        assert_eq!(features.extents(), [4, 4, 1]);
        assert_eq!(features.nbands(), 2);
    }

    #[test]
    fn test_learned_mean_patch_projects_to_zero() {
        let arch = single_layer();
        let banks = FlimTrainer::new(&arch, TrainingConfig::default())
            .learn_model(&[TrainingSample::new(image(), markers())])
            .unwrap();
        let mean = banks[0].normalization().mean[0];
        let flat = MultibandImage::from_gray(Array2::from_elem((8, 8), mean).view());
        let no_pool =
            Architecture::new(vec![LayerSpec::new([3, 3, 1], 2, 4, 2)], 0.1, false).unwrap();
        let net = FlimNetwork::new(no_pool, banks).unwrap();
        let out = net.extract_features(&flat).unwrap();
        for &v in out.data().iter() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_training_is_deterministic() {
        let arch = single_layer();
        let samples = vec![
            TrainingSample::new(image(), markers()),
            TrainingSample::new(image().map_values(|v| 1.0 - v), markers()),
        ];
        let config = TrainingConfig {
            seed: 1234,
            ..TrainingConfig::default()
        };
        let a = FlimTrainer::new(&arch, config).learn_model(&samples).unwrap();
        let b = FlimTrainer::new(&arch, config).learn_model(&samples).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_two_layers_with_pca_consensus() {
        let layers = vec![
            LayerSpec::new([3, 3, 1], 2, 4, 3)
                .with_pooling(PoolType::MaxPool, [2, 2, 1], 2)
                .with_relu(true),
            LayerSpec::new([3, 3, 1], 1, 2, 2),
        ];
        let arch = Architecture::new(layers, 0.01, false).unwrap();
        let config = TrainingConfig {
            consensus: ConsensusStrategy::Pca,
            ..TrainingConfig::default()
        };
        let samples = vec![
            TrainingSample::new(image(), markers()),
            TrainingSample::new(image().map_values(|v| v * 0.5), markers()),
        ];
        let banks = FlimTrainer::new(&arch, config).learn_model(&samples).unwrap();
        assert_eq!(banks[0].nkernels(), 3);
        assert_eq!(banks[1].patch_dim(), 9 * 3);
        assert_eq!(banks[1].nkernels(), 2);

        let net = FlimNetwork::new(arch, banks).unwrap();
        let outputs = net.extract(&image()).unwrap();
        assert_eq!(outputs[1].extents(), [4, 4, 1]);
        assert_eq!(outputs[1].nbands(), 2);
    }

    #[test]
    fn test_too_few_kernels_for_consensus() {
        // a single class yields 2 kernels per image, below the 3 requested
        let layer = LayerSpec::new([3, 3, 1], 2, 4, 3);
        let arch = Architecture::new(vec![layer], 0.1, false).unwrap();
        let mut markers = MarkerSet::new();
        for &(x, y) in &[(1, 1), (2, 2), (5, 5), (6, 6)] {
            markers.push(Voxel::new_2d(x, y), 1);
        }
        let err = FlimTrainer::new(&arch, TrainingConfig::default())
            .learn_model(&[TrainingSample::new(image(), markers)])
            .unwrap_err();
        assert!(matches!(err, FlimError::ArchitectureMismatchError(_)));
    }

    #[test]
    fn test_image_without_markers() {
        let arch = single_layer();
        let err = FlimTrainer::new(&arch, TrainingConfig::default())
            .learn_model(&[
                TrainingSample::new(image(), markers()),
                TrainingSample::new(image(), MarkerSet::new()),
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            FlimError::InsufficientMarkersError {
                image: 1,
                layer: 0,
                class: None
            }
        ));
        assert!(FlimTrainer::new(&arch, TrainingConfig::default())
            .learn_layer(0, &[])
            .is_err());
    }

    /// 6x6x6 volume, bright in the upper half of z with a checker pattern.
    fn volume() -> MultibandImage {
        MultibandImage::new(Array4::from_shape_fn((6, 6, 6, 1), |(z, y, x, _)| {
            let base = if z < 3 { 0.1 } else { 0.8 };
            base + ((x + y + z) % 2) as f32 * 0.1
        }))
    }

    fn volume_markers() -> MarkerSet {
        let mut markers = MarkerSet::new();
        for &(x, y, z) in &[(1, 1, 1), (3, 2, 0), (4, 4, 2), (2, 4, 1)] {
            markers.push(Voxel::new(x, y, z), 1);
        }
        for &(x, y, z) in &[(1, 1, 4), (3, 2, 5), (4, 4, 3), (2, 4, 4)] {
            markers.push(Voxel::new(x, y, z), 2);
        }
        markers
    }

    #[test]
    fn test_volume_with_skip_connection() {
        let layers = vec![
            LayerSpec::new([3, 3, 3], 2, 4, 3).with_pooling(PoolType::AvgPool, [2, 2, 2], 2),
            LayerSpec::new([3, 3, 3], 1, 2, 2).with_skip_connection(vec![0]),
        ];
        let arch = Architecture::new(layers, 0.1, false).unwrap();
        let samples = vec![
            TrainingSample::new(volume(), volume_markers()),
            TrainingSample::new(volume().map_values(|v| v * 0.5), volume_markers()),
        ];
        let banks = FlimTrainer::new(&arch, TrainingConfig::default())
            .learn_model(&samples)
            .unwrap();
        assert_eq!(banks[0].weights().dim(), (27, 3));
        // the second layer sees the 3 bands of the first
        assert_eq!(banks[1].weights().dim(), (27 * 3, 2));

        let net = FlimNetwork::new(arch, banks).unwrap();
        let out = net.extract_features(&volume()).unwrap();
        assert!(out.is_3d());
        assert_eq!(out.extents(), [3, 3, 3]);
        // own 2 kernels plus the 3 skipped bands of layer 0
        assert_eq!(out.nbands(), 5);
    }

    #[test]
    fn test_skip_connection_feeds_the_next_layer() {
        let layers = vec![
            LayerSpec::new([3, 3, 1], 2, 4, 2),
            LayerSpec::new([3, 3, 1], 2, 4, 2).with_skip_connection(vec![0]),
            LayerSpec::new([3, 3, 1], 1, 2, 2),
        ];
        let arch = Architecture::new(layers, 0.1, false).unwrap();
        let banks = FlimTrainer::new(&arch, TrainingConfig::default())
            .learn_model(&[TrainingSample::new(image(), markers())])
            .unwrap();
        assert_eq!(banks[1].patch_dim(), 9 * 2);
        // layer 1 hands on its own 2 bands and the 2 of layer 0
        assert_eq!(banks[2].patch_dim(), 9 * 4);
    }
}
