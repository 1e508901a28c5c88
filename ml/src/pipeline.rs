//! Forward pass of a learned FLIM network.
use crate::{
    activation_functions::ReluLayer,
    adjacency::AdjacencyRelation,
    architecture::{Architecture, PoolType},
    backend::{backend_for, ComputeBackend, Device, HostBackend},
    batch_planner::{BatchPlanner, MemoryBudget},
    convolutions::ConvolutionLayer,
    flim_errors::{FlimError, FlimResult},
    kernel_bank::{load_model, KernelBank},
    multiband_image::MultibandImage,
    pooling::{pool, PoolingGeometry},
    weight_loader::WeightLoader,
    ImagePrecision,
};
use log::{debug, info};
use ndarray::{Array4, Axis, Zip};
use rayon::prelude::*;

/// General model trait for feature extraction
pub trait FeatureExtractor {
    fn extract_features(&self, input: &MultibandImage) -> FlimResult<MultibandImage>;
}

/// Result of pushing one image through one layer.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub features: MultibandImage,
    /// Pooling applied by the layer, if any.
    pub pooling: Option<PoolingGeometry>,
}

/// Runs layer `index` on `input`: convolution through the atrous-corrected
/// adjacency, optional relu, pooling, then concatenation of the outputs of
/// the layers listed as skip connections. `earlier` holds the final outputs
/// of the layers before `index`. Convolution batches are sized after `budget`.
pub fn forward_layer(
    arch: &Architecture,
    index: usize,
    bank: &KernelBank,
    input: &MultibandImage,
    earlier: &[MultibandImage],
    backend: &dyn ComputeBackend,
    budget: MemoryBudget,
) -> FlimResult<LayerOutput> {
    let layer = arch.layer(index)?;
    let dim3d = input.is_3d();
    let atrous_factor = arch.atrous_factor_at(index);
    let adjacency = AdjacencyRelation::adaptive_from_layer(layer, atrous_factor, dim3d)?;

    let mut features = ConvolutionLayer::new(bank, adjacency, index)
        .with_budget(budget)
        .convolve(input, backend)?;
    if layer.relu {
        features = ReluLayer::new().activate(&features);
    }
    let pooling =
        PoolingGeometry::of_layer(layer, atrous_factor, arch.apply_intrinsic_atrous(), dim3d);
    if let Some(geometry) = &pooling {
        features = pool(&features, layer.pooling.kind, geometry, index)?;
    }
    for &skip in &layer.skip_connection {
        let other = earlier.get(skip).ok_or_else(|| {
            FlimError::ArchitectureMismatchError(format!(
                "layer {} concatenates the output of layer {}, which is not available",
                index, skip
            ))
        })?;
        features = features.concat_bands(other).map_err(|_| {
            FlimError::ArchitectureMismatchError(format!(
                "layer {}: output extents {:?} differ from the {:?} of skipped layer {}",
                index,
                features.extents(),
                other.extents(),
                skip
            ))
        })?;
    }
    debug!(
        "Layer {}: {} -> {} bands, extents {:?} -> {:?}",
        index,
        input.nbands(),
        features.nbands(),
        input.extents(),
        features.extents()
    );
    Ok(LayerOutput { features, pooling })
}

/// Object mask of an image: a voxel belongs to the object when any band of
/// the mask is nonzero there.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMask {
    inside: MultibandImage,
}

impl ObjectMask {
    pub fn new(mask: &MultibandImage) -> Self {
        let shape = (mask.zsize(), mask.ysize(), mask.xsize(), 1);
        let mut inside = Array4::<ImagePrecision>::zeros(shape);
        Zip::from(inside.lanes_mut(Axis(3)))
            .and(mask.data().lanes(Axis(3)))
            .for_each(|mut flag, bands| {
                if bands.iter().any(|&v| v != 0.0) {
                    flag.fill(1.0);
                }
            });
        Self {
            inside: MultibandImage::new(inside),
        }
    }

    pub fn extents(&self) -> [usize; 3] {
        self.inside.extents()
    }

    /// Number of voxels inside the object.
    pub fn count(&self) -> usize {
        self.inside.values().iter().filter(|&&v| v > 0.0).count()
    }

    /// Mask on the output grid of a pooling layer: an output voxel is inside
    /// when its window touches the object.
    pub fn pooled(&self, geometry: &PoolingGeometry, layer: usize) -> FlimResult<ObjectMask> {
        Ok(Self {
            inside: pool(&self.inside, PoolType::MaxPool, geometry, layer)?,
        })
    }

    /// Zeroes the features of every voxel outside the object.
    pub fn apply(&self, features: &MultibandImage, layer: usize) -> FlimResult<MultibandImage> {
        if !features.same_domain(&self.inside) {
            return Err(FlimError::ObjectMaskError {
                layer,
                expected: features.extents(),
                found: self.extents(),
            });
        }
        let mut data = features.data().clone();
        Zip::from(data.lanes_mut(Axis(3)))
            .and(self.inside.data().lanes(Axis(3)))
            .for_each(|mut bands, flag| {
                if flag[0] == 0.0 {
                    bands.fill(0.0);
                }
            });
        Ok(MultibandImage::new(data))
    }
}

/// A FLIM network ready for extraction: an architecture and one kernel bank
/// per layer. Banks and architecture are only read, so one network can serve
/// many images at once.
pub struct FlimNetwork {
    arch: Architecture,
    banks: Vec<KernelBank>,
    backend: Box<dyn ComputeBackend>,
    budget: MemoryBudget,
}

impl FlimNetwork {
    pub fn new(arch: Architecture, banks: Vec<KernelBank>) -> FlimResult<Self> {
        if banks.len() != arch.nlayers() {
            return Err(FlimError::ArchitectureMismatchError(format!(
                "{} kernel banks given for {} layers",
                banks.len(),
                arch.nlayers()
            )));
        }
        Ok(Self {
            arch,
            banks,
            backend: Box::new(HostBackend),
            budget: MemoryBudget::default(),
        })
    }

    /// Loads the banks of every layer from a parameter store.
    pub fn from_parameters<L: WeightLoader>(
        arch: Architecture,
        loader: &mut L,
    ) -> FlimResult<Self> {
        let banks = load_model(loader, arch.nlayers())?;
        Self::new(arch, banks)
    }

    pub fn with_device(self, device: Device) -> Self {
        self.with_backend(backend_for(device))
    }

    pub fn with_backend(mut self, backend: Box<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Memory a single extraction may use for its convolution batches.
    pub fn with_budget(mut self, budget: MemoryBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    pub fn banks(&self) -> &[KernelBank] {
        &self.banks
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    /// Output of every layer, in layer order.
    pub fn extract(&self, image: &MultibandImage) -> FlimResult<Vec<MultibandImage>> {
        self.run(image, None, self.budget)
    }

    /// Output of every layer with the features outside the object zeroed.
    /// The mask follows the image through every pooling layer.
    pub fn extract_masked(
        &self,
        image: &MultibandImage,
        mask: &ObjectMask,
    ) -> FlimResult<Vec<MultibandImage>> {
        self.run(image, Some(mask), self.budget)
    }

    fn run(
        &self,
        image: &MultibandImage,
        mask: Option<&ObjectMask>,
        budget: MemoryBudget,
    ) -> FlimResult<Vec<MultibandImage>> {
        let mut outputs: Vec<MultibandImage> = Vec::with_capacity(self.arch.nlayers());
        let mut mask = mask.cloned();
        for (index, bank) in self.banks.iter().enumerate() {
            let input = outputs.last().unwrap_or(image);
            let output = forward_layer(
                &self.arch,
                index,
                bank,
                input,
                &outputs,
                self.backend.as_ref(),
                budget,
            )?;
            let mut features = output.features;
            if let Some(current) = mask.take() {
                let current = match &output.pooling {
                    Some(geometry) => current.pooled(geometry, index)?,
                    None => current,
                };
                features = current.apply(&features, index)?;
                mask = Some(current);
            }
            outputs.push(features);
        }
        Ok(outputs)
    }

    /// Applies layer `index` alone to `activation`, the output of layer
    /// `index - 1` (or the input image for layer 0). Layers with skip
    /// connections cannot be run this way.
    pub fn extract_from_layer(
        &self,
        activation: &MultibandImage,
        index: usize,
    ) -> FlimResult<MultibandImage> {
        let bank = self.banks.get(index).ok_or_else(|| {
            FlimError::ArchitectureMismatchError(format!(
                "layer {} requested, but the network has {} layers",
                index,
                self.banks.len()
            ))
        })?;
        let output = forward_layer(
            &self.arch,
            index,
            bank,
            activation,
            &[],
            self.backend.as_ref(),
            self.budget,
        )?;
        Ok(output.features)
    }

    /// Every layer output of every image, in input order. Images are
    /// processed concurrently in groups no larger than the batch size the
    /// planner allows for `budget`, and the convolutions of every image keep
    /// their batches within `budget` as well.
    pub fn extract_batch(
        &self,
        images: &[MultibandImage],
        budget: MemoryBudget,
    ) -> FlimResult<Vec<Vec<MultibandImage>>> {
        self.run_batch(images, None, budget)
    }

    /// Same as `extract_batch`, with one object mask per image.
    pub fn extract_batch_masked(
        &self,
        images: &[MultibandImage],
        masks: &[ObjectMask],
        budget: MemoryBudget,
    ) -> FlimResult<Vec<Vec<MultibandImage>>> {
        if masks.len() != images.len() {
            return Err(FlimError::ArchitectureMismatchError(format!(
                "{} object masks given for {} images",
                masks.len(),
                images.len()
            )));
        }
        self.run_batch(images, Some(masks), budget)
    }

    fn run_batch(
        &self,
        images: &[MultibandImage],
        masks: Option<&[ObjectMask]>,
        budget: MemoryBudget,
    ) -> FlimResult<Vec<Vec<MultibandImage>>> {
        let planner = BatchPlanner::new(&self.arch, budget);
        let largest = images.iter().max_by_key(|img| img.nvoxels() * img.nbands());
        let group = match largest {
            Some(img) => planner.batch_size_cpu(img.nvoxels(), img.nbands()),
            None => return Ok(Vec::new()),
        };
        info!(
            "Extracting features of {} images, {} at a time, on the {} backend",
            images.len(),
            group,
            self.backend.name()
        );

        let mut features = Vec::with_capacity(images.len());
        for (start, chunk) in (0..images.len()).step_by(group).zip(images.chunks(group)) {
            let outputs: FlimResult<Vec<Vec<MultibandImage>>> = chunk
                .par_iter()
                .enumerate()
                .map(|(i, img)| {
                    let mask = masks.map(|m| &m[start + i]);
                    self.run(img, mask, budget)
                })
                .collect();
            features.extend(outputs?);
        }
        Ok(features)
    }
}

impl FeatureExtractor for FlimNetwork {
    /// Output of the last layer.
    fn extract_features(&self, input: &MultibandImage) -> FlimResult<MultibandImage> {
        let mut outputs = self.extract(input)?;
        outputs.pop().ok_or_else(|| {
            FlimError::ArchitectureMismatchError("network without layers".to_string())
        })
    }
}
