//! Patch extraction: flattening the receptive field of a voxel into a vector.
//!
//! A patch is laid out tap-major, `patch[tap * nbands + band]`, following the
//! tap order of the adjacency relation. Taps falling outside the image domain
//! contribute 0 to the normalized patch; training and extraction share this
//! border policy since both go through this module.
use crate::{
    adjacency::AdjacencyRelation,
    flim_errors::{FlimError, FlimResult},
    markers::{Label, MarkerSet},
    multiband_image::{MultibandImage, Voxel},
    ImagePrecision, WeightPrecision,
};
use ndarray::*;
use std::{collections::BTreeMap, ops::Range};

/// Per-element mean and standard deviation applied to patches before they
/// are projected onto kernels. Both vectors have the patch dimensionality.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchNormalization {
    pub mean: Array1<WeightPrecision>,
    pub stdev: Array1<WeightPrecision>,
}

impl PatchNormalization {
    pub fn new(mean: Array1<WeightPrecision>, stdev: Array1<WeightPrecision>) -> Self {
        Self { mean, stdev }
    }

    /// Mean 0 and deviation 1 everywhere.
    pub fn identity(patch_dim: usize) -> Self {
        Self {
            mean: Array1::zeros(patch_dim),
            stdev: Array1::ones(patch_dim),
        }
    }

    /// Repeats per-band statistics for every tap of an adjacency with `ntaps` taps.
    pub fn tiled(
        band_mean: ArrayView1<WeightPrecision>,
        band_stdev: ArrayView1<WeightPrecision>,
        ntaps: usize,
    ) -> Self {
        let tile = |v: ArrayView1<WeightPrecision>| {
            Array1::from_iter((0..ntaps).flat_map(|_| v.iter().copied()))
        };
        Self {
            mean: tile(band_mean),
            stdev: tile(band_stdev),
        }
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}

pub struct PatchSampler<'a> {
    adjacency: &'a AdjacencyRelation,
    normalization: Option<&'a PatchNormalization>,
}

impl<'a> PatchSampler<'a> {
    pub fn new(
        adjacency: &'a AdjacencyRelation,
        normalization: Option<&'a PatchNormalization>,
    ) -> Self {
        Self {
            adjacency,
            normalization,
        }
    }

    pub fn patch_dim(&self, nbands: usize) -> usize {
        self.adjacency.len() * nbands
    }

    /// Checks that the normalization vectors fit patches of `image`.
    pub fn check_dims(&self, image: &MultibandImage, layer: usize) -> FlimResult<()> {
        if let Some(norm) = self.normalization {
            let found = self.patch_dim(image.nbands());
            if norm.mean.len() != found || norm.stdev.len() != found {
                return Err(FlimError::DimensionMismatchError {
                    layer,
                    expected: norm.mean.len(),
                    found,
                });
            }
        }
        Ok(())
    }

    /// Writes the patch of `voxel` into `out`, which must hold `patch_dim` values.
    pub fn write_patch(
        &self,
        image: &MultibandImage,
        voxel: &Voxel,
        mut out: ArrayViewMut1<ImagePrecision>,
    ) {
        let nbands = image.nbands();
        let [xsize, ysize, zsize] = image.extents();
        let values = image.values();
        for (tap, offset) in self.adjacency.offsets().iter().enumerate() {
            let x = voxel.x as isize + offset[0];
            let y = voxel.y as isize + offset[1];
            let z = voxel.z as isize + offset[2];
            let inside = x >= 0
                && y >= 0
                && z >= 0
                && (x as usize) < xsize
                && (y as usize) < ysize
                && (z as usize) < zsize;
            let first = tap * nbands;
            if !inside {
                out.slice_mut(s![first..first + nbands]).fill(0.0);
                continue;
            }
            let start = (((z as usize) * ysize + y as usize) * xsize + x as usize) * nbands;
            for b in 0..nbands {
                let v = values[start + b];
                out[first + b] = match self.normalization {
                    Some(norm) => (v - norm.mean[first + b]) / norm.stdev[first + b],
                    None => v,
                };
            }
        }
    }

    pub fn patch(&self, image: &MultibandImage, voxel: &Voxel) -> Array1<ImagePrecision> {
        let mut out = Array1::zeros(self.patch_dim(image.nbands()));
        self.write_patch(image, voxel, out.view_mut());
        out
    }

    /// One patch per row, in the order of `voxels`.
    pub fn patches(&self, image: &MultibandImage, voxels: &[Voxel]) -> Array2<ImagePrecision> {
        let mut out = Array2::zeros((voxels.len(), self.patch_dim(image.nbands())));
        for (voxel, row) in voxels.iter().zip(out.rows_mut()) {
            self.write_patch(image, voxel, row);
        }
        out
    }

    /// Patch matrix of the voxels whose raster indices fall in `range`
    /// (im2col style: one row per voxel).
    pub fn im2col(&self, image: &MultibandImage, range: Range<usize>) -> Array2<ImagePrecision> {
        let mut out = Array2::zeros((range.len(), self.patch_dim(image.nbands())));
        for (index, row) in range.zip(out.rows_mut()) {
            self.write_patch(image, &image.voxel_at(index), row);
        }
        out
    }

    /// Patches of every marked voxel, grouped by class in ascending label order.
    ///
    /// Markers outside the image are ignored. Fails when the image has no
    /// markers, or when one of its classes has no voxel inside the domain.
    pub fn sample_markers(
        &self,
        image: &MultibandImage,
        markers: &MarkerSet,
        image_index: usize,
        layer: usize,
    ) -> FlimResult<BTreeMap<Label, Array2<ImagePrecision>>> {
        self.check_dims(image, layer)?;
        if markers.is_empty() {
            return Err(FlimError::InsufficientMarkersError {
                image: image_index,
                layer,
                class: None,
            });
        }
        let mut patches = BTreeMap::new();
        for (label, voxels) in markers.by_class_within(image) {
            if voxels.is_empty() {
                return Err(FlimError::InsufficientMarkersError {
                    image: image_index,
                    layer,
                    class: Some(label),
                });
            }
            patches.insert(label, self.patches(image, &voxels));
        }
        Ok(patches)
    }
}
