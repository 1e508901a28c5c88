//! Manual kernel selection: keep only hand-picked columns of a kernel bank.
use crate::{
    flim_errors::{FlimError, FlimResult},
    WeightPrecision,
};
use ndarray::*;
use serde_derive::Deserialize;
use std::{fs, path::Path};

/// Kernel indices read from a JSON document, either a bare array
/// `[2, 0]` or an object `{"selected_kernels": [2, 0]}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum SelectionDocument {
    Plain(Vec<usize>),
    Keyed { selected_kernels: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedKernels {
    indices: Vec<usize>,
}

impl SelectedKernels {
    pub fn new(indices: Vec<usize>) -> Self {
        Self { indices }
    }

    pub fn from_json_str(json: &str) -> FlimResult<Self> {
        let indices = match serde_json::from_str(json)? {
            SelectionDocument::Plain(indices) => indices,
            SelectionDocument::Keyed { selected_kernels } => selected_kernels,
        };
        Ok(Self { indices })
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> FlimResult<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

/// Keeps the kernels (columns) of `bank` listed in `indices`, in the order
/// they are listed.
pub fn select_kernels_manual(
    bank: &Array2<WeightPrecision>,
    indices: &[usize],
) -> FlimResult<Array2<WeightPrecision>> {
    let width = bank.ncols();
    if let Some(&index) = indices.iter().find(|&&i| i >= width) {
        return Err(FlimError::IndexOutOfRangeError { index, width });
    }
    Ok(bank.select(Axis(1), indices))
}
