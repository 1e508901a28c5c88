//! Network architecture of a FLIM model: an ordered list of layer
//! descriptions plus the two global hyperparameters.
//!
//! The JSON document is parsed into [`ArchitectureDescription`] first and
//! only becomes an [`Architecture`] after validation, so an `Architecture`
//! value always satisfies the layer invariants.
use crate::flim_errors::{FlimError, FlimResult};
use serde_derive::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    fs::{self, File},
    io::BufWriter,
    path::Path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    NoPool,
    AvgPool,
    MaxPool,
}

impl Default for PoolType {
    fn default() -> Self {
        PoolType::NoPool
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingSpec {
    #[serde(rename = "type", default)]
    pub kind: PoolType,
    #[serde(default = "unit_sizes")]
    pub size: [usize; 3],
    #[serde(default = "unit_stride")]
    pub stride: usize,
}

impl Default for PoolingSpec {
    fn default() -> Self {
        Self {
            kind: PoolType::NoPool,
            size: unit_sizes(),
            stride: 1,
        }
    }
}

fn unit_sizes() -> [usize; 3] {
    [1, 1, 1]
}

fn unit_stride() -> usize {
    1
}

/// Parameters of one convolutional layer.
///
/// Sizes and rates are given along x, y and z. For 2D data the z entries are
/// ignored, so documents written for 2D models may leave them at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kernel_size: [usize; 3],
    #[serde(default = "unit_sizes")]
    pub dilation_rate: [usize; 3],
    pub nkernels_per_image: usize,
    pub nkernels_per_marker: usize,
    /// Width of the consensus bank learned from all training images.
    pub noutput_channels: usize,
    #[serde(default)]
    pub relu: bool,
    #[serde(default)]
    pub pooling: PoolingSpec,
    /// Earlier layers whose outputs are concatenated onto this layer's output.
    #[serde(default)]
    pub skip_connection: Vec<usize>,
}

impl LayerSpec {
    /// Layer with the given kernel geometry and kernel counts, unit dilation,
    /// no activation, no pooling and no skip connections.
    pub fn new(
        kernel_size: [usize; 3],
        nkernels_per_marker: usize,
        nkernels_per_image: usize,
        noutput_channels: usize,
    ) -> Self {
        Self {
            kernel_size,
            dilation_rate: unit_sizes(),
            nkernels_per_image,
            nkernels_per_marker,
            noutput_channels,
            relu: false,
            pooling: PoolingSpec::default(),
            skip_connection: Vec::new(),
        }
    }

    pub fn with_relu(mut self, relu: bool) -> Self {
        self.relu = relu;
        self
    }

    pub fn with_dilation(mut self, dilation_rate: [usize; 3]) -> Self {
        self.dilation_rate = dilation_rate;
        self
    }

    pub fn with_pooling(mut self, kind: PoolType, size: [usize; 3], stride: usize) -> Self {
        self.pooling = PoolingSpec { kind, size, stride };
        self
    }

    pub fn with_skip_connection(mut self, layers: Vec<usize>) -> Self {
        self.skip_connection = layers;
        self
    }

    fn validate(&self, index: usize) -> FlimResult<()> {
        let fail = |msg: String| {
            Err(FlimError::ArchitectureMismatchError(format!(
                "layer {}: {}",
                index, msg
            )))
        };
        if self.kernel_size[0] == 0 || self.kernel_size[1] == 0 {
            return fail(format!("kernel size {:?} is not positive", self.kernel_size));
        }
        if self.dilation_rate[0] == 0 || self.dilation_rate[1] == 0 {
            return fail(format!(
                "dilation rate {:?} is not positive",
                self.dilation_rate
            ));
        }
        if self.nkernels_per_marker == 0 || self.nkernels_per_image == 0 {
            return fail("kernel counts must be positive".to_string());
        }
        if self.noutput_channels == 0 {
            return fail("noutput_channels must be positive".to_string());
        }
        if self.noutput_channels > self.nkernels_per_image {
            return fail(format!(
                "noutput_channels ({}) exceeds nkernels_per_image ({}); a consensus layer can only reduce",
                self.noutput_channels, self.nkernels_per_image
            ));
        }
        if self.nkernels_per_marker > self.nkernels_per_image {
            return fail(format!(
                "nkernels_per_marker ({}) exceeds nkernels_per_image ({})",
                self.nkernels_per_marker, self.nkernels_per_image
            ));
        }
        if self.pooling.kind != PoolType::NoPool {
            if self.pooling.size[0] == 0 || self.pooling.size[1] == 0 {
                return fail(format!(
                    "pooling size {:?} is not positive",
                    self.pooling.size
                ));
            }
            if self.pooling.stride == 0 {
                return fail("pooling stride must be positive".to_string());
            }
        }
        if let Some(&target) = self.skip_connection.iter().find(|&&j| j >= index) {
            return fail(format!(
                "skip connection to layer {} does not point to an earlier layer",
                target
            ));
        }
        Ok(())
    }
}

/// Serialized form of an architecture, as found in the JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nlayers: Option<usize>,
    pub stdev_factor: f32,
    #[serde(default)]
    pub apply_intrinsic_atrous: bool,
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "ArchitectureDescription")]
pub struct Architecture {
    layers: Vec<LayerSpec>,
    stdev_factor: f32,
    apply_intrinsic_atrous: bool,
}

impl Architecture {
    pub fn new(
        layers: Vec<LayerSpec>,
        stdev_factor: f32,
        apply_intrinsic_atrous: bool,
    ) -> FlimResult<Self> {
        if layers.is_empty() {
            return Err(FlimError::ArchitectureMismatchError(
                "an architecture needs at least one layer".to_string(),
            ));
        }
        if !stdev_factor.is_finite() || stdev_factor < 0.0 {
            return Err(FlimError::ArchitectureMismatchError(format!(
                "stdev_factor must be a non-negative number, got {}",
                stdev_factor
            )));
        }
        for (index, layer) in layers.iter().enumerate() {
            layer.validate(index)?;
        }
        Ok(Self {
            layers,
            stdev_factor,
            apply_intrinsic_atrous,
        })
    }

    pub fn from_json_str(json: &str) -> FlimResult<Self> {
        let description: ArchitectureDescription = serde_json::from_str(json)?;
        Architecture::try_from(description)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> FlimResult<Self> {
        let raw_file = fs::read_to_string(path)?;
        Self::from_json_str(&raw_file)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> FlimResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn nlayers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    /// Returns the layer at `index`, or an error naming the valid range.
    pub fn layer(&self, index: usize) -> FlimResult<&LayerSpec> {
        self.layers.get(index).ok_or_else(|| {
            FlimError::ArchitectureMismatchError(format!(
                "layer {} requested, but the architecture has {} layers",
                index,
                self.layers.len()
            ))
        })
    }

    pub fn stdev_factor(&self) -> f32 {
        self.stdev_factor
    }

    pub fn apply_intrinsic_atrous(&self) -> bool {
        self.apply_intrinsic_atrous
    }

    /// Atrous factor in effect at the input of layer `index`: the product of
    /// the pooling strides of all earlier pooling layers when intrinsic atrous
    /// is enabled, 1 otherwise.
    pub fn atrous_factor_at(&self, index: usize) -> usize {
        if !self.apply_intrinsic_atrous {
            return 1;
        }
        self.layers
            .iter()
            .take(index)
            .filter(|layer| layer.pooling.kind != PoolType::NoPool)
            .map(|layer| layer.pooling.stride)
            .product()
    }

    /// Channels leaving layer `index` once its skip connections are concatenated.
    pub fn output_channels(&self, index: usize) -> FlimResult<usize> {
        self.layer(index)?;
        Ok(self.channels_after(index))
    }

    /// Skip connections only point backwards, so every index reached from a
    /// valid `index` is valid as well.
    pub(crate) fn channels_after(&self, index: usize) -> usize {
        let layer = &self.layers[index];
        layer.noutput_channels
            + layer
                .skip_connection
                .iter()
                .map(|&j| self.channels_after(j))
                .sum::<usize>()
    }
}

impl TryFrom<ArchitectureDescription> for Architecture {
    type Error = FlimError;

    fn try_from(description: ArchitectureDescription) -> FlimResult<Self> {
        if let Some(nlayers) = description.nlayers {
            if nlayers != description.layers.len() {
                return Err(FlimError::ArchitectureMismatchError(format!(
                    "nlayers is {} but {} layers are described",
                    nlayers,
                    description.layers.len()
                )));
            }
        }
        Architecture::new(
            description.layers,
            description.stdev_factor,
            description.apply_intrinsic_atrous,
        )
    }
}

impl From<Architecture> for ArchitectureDescription {
    fn from(arch: Architecture) -> Self {
        Self {
            nlayers: Some(arch.layers.len()),
            stdev_factor: arch.stdev_factor,
            apply_intrinsic_atrous: arch.apply_intrinsic_atrous,
            layers: arch.layers,
        }
    }
}
