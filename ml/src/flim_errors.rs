use crate::{markers::Label, weight_loader::WeightError};
use thiserror::Error;

pub type FlimResult<T> = Result<T, FlimError>;

#[derive(Error, Debug)]
pub enum FlimError {
    #[error("Layer {layer}: {} in training image {image}. Add markers or drop the image.", describe_class(.class))]
    InsufficientMarkersError {
        image: usize,
        layer: usize,
        class: Option<Label>,
    },
    #[error("No valid patches to cluster: {0}")]
    EmptyPatchSetError(String),
    #[error("Architecture mismatch: {0}")]
    ArchitectureMismatchError(String),
    #[error("Layer {layer}: kernel bank expects patches of dimension {expected}, but the input yields {found}")]
    DimensionMismatchError {
        layer: usize,
        expected: usize,
        found: usize,
    },
    #[error("Layer {layer}: pooling window spanning {span} voxels with stride {stride} does not fit the {axis} axis of extent {extent}")]
    InvalidPoolingGeometryError {
        layer: usize,
        axis: char,
        extent: usize,
        span: usize,
        stride: usize,
    },
    #[error("Layer {layer}: object mask of extents {found:?} does not cover features of extents {expected:?}")]
    ObjectMaskError {
        layer: usize,
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error("Kernel index {index} is out of range for a bank of {width} kernels")]
    IndexOutOfRangeError { index: usize, width: usize },
    #[error("Marker file is malformed at line {line}: {reason}")]
    MarkerFormatError { line: usize, reason: String },
    #[error("Could not parse JSON document:\n {0}")]
    JsonFormatError(#[from] serde_json::Error),
    #[error("Parameter store failed:\n {0}")]
    ParameterError(#[from] WeightError),
    #[error("File could not be accessed. Filesystem reported error\n {0}.")]
    IoError(#[from] std::io::Error),
}

fn describe_class(class: &Option<Label>) -> String {
    match class {
        Some(label) => format!("class {} has no marked voxels", label),
        None => "there are no marked voxels".to_string(),
    }
}
