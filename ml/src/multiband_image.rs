//! Multiband images: 2D or 3D grids of voxels, every voxel holding a vector of
//! band (channel) values.
//!
//! The buffer is an `Array4` in `(z, y, x, band)` order and always kept in
//! standard layout, so the bands of one voxel are contiguous. A 2D image has
//! a depth of 1.
use crate::{
    flim_errors::{FlimError, FlimResult},
    ImagePrecision,
};
use ndarray::*;

/// Coordinates of a voxel. For 2D images `z` is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Voxel {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Voxel {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    pub fn new_2d(x: usize, y: usize) -> Self {
        Self { x, y, z: 0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultibandImage {
    data: Array4<ImagePrecision>,
}

impl MultibandImage {
    /// Wraps an array of shape `(zsize, ysize, xsize, nbands)`.
    pub fn new(data: Array4<ImagePrecision>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Self { data }
    }

    pub fn zeros(xsize: usize, ysize: usize, zsize: usize, nbands: usize) -> Self {
        Self {
            data: Array4::zeros((zsize, ysize, xsize, nbands)),
        }
    }

    /// Builds a 2D image from an array in `(y, x, band)` order.
    pub fn from_2d(data: Array3<ImagePrecision>) -> Self {
        Self::new(data.insert_axis(Axis(0)))
    }

    /// Builds a 2D image from an array in Pytorch layout `(band, y, x)`.
    pub fn from_channels_first(data: ArrayView3<ImagePrecision>) -> Self {
        Self::new(data.permuted_axes([1, 2, 0]).insert_axis(Axis(0)).to_owned())
    }

    /// Builds a single band 2D image from an array in `(y, x)` order.
    pub fn from_gray(data: ArrayView2<ImagePrecision>) -> Self {
        Self::new(data.insert_axis(Axis(2)).insert_axis(Axis(0)).to_owned())
    }

    pub fn xsize(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn ysize(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn zsize(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn nbands(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    pub fn nvoxels(&self) -> usize {
        self.xsize() * self.ysize() * self.zsize()
    }

    pub fn is_3d(&self) -> bool {
        self.zsize() > 1
    }

    /// Spatial extents as `[x, y, z]`.
    pub fn extents(&self) -> [usize; 3] {
        [self.xsize(), self.ysize(), self.zsize()]
    }

    pub fn same_domain(&self, other: &MultibandImage) -> bool {
        self.extents() == other.extents()
    }

    pub fn contains(&self, voxel: &Voxel) -> bool {
        voxel.x < self.xsize() && voxel.y < self.ysize() && voxel.z < self.zsize()
    }

    /// Linear index of a voxel in raster order (x fastest).
    pub fn voxel_index(&self, voxel: &Voxel) -> usize {
        (voxel.z * self.ysize() + voxel.y) * self.xsize() + voxel.x
    }

    /// Inverse of `voxel_index`.
    pub fn voxel_at(&self, index: usize) -> Voxel {
        let plane = self.xsize() * self.ysize();
        Voxel {
            z: index / plane,
            y: (index % plane) / self.xsize(),
            x: index % self.xsize(),
        }
    }

    /// Band values of a voxel, or `None` when the coordinates fall outside the domain.
    pub fn get(&self, x: isize, y: isize, z: isize) -> Option<ArrayView1<ImagePrecision>> {
        if x < 0 || y < 0 || z < 0 {
            return None;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= self.xsize() || y >= self.ysize() || z >= self.zsize() {
            return None;
        }
        Some(self.data.slice(s![z, y, x, ..]))
    }

    pub fn band_values(&self, voxel: &Voxel) -> ArrayView1<ImagePrecision> {
        self.data.slice(s![voxel.z, voxel.y, voxel.x, ..])
    }

    pub fn data(&self) -> &Array4<ImagePrecision> {
        &self.data
    }

    pub fn into_inner(self) -> Array4<ImagePrecision> {
        self.data
    }

    /// Raw buffer: voxels in raster order, the bands of a voxel contiguous.
    pub fn values(&self) -> &[ImagePrecision] {
        self.data
            .as_slice()
            .expect("multiband buffers are kept in standard layout")
    }

    /// View of the buffer as one row per voxel (raster order), one column per band.
    pub fn voxel_matrix(&self) -> ArrayView2<ImagePrecision> {
        let (nvoxels, nbands) = (self.nvoxels(), self.nbands());
        self.data
            .view()
            .into_shape((nvoxels, nbands))
            .expect("multiband buffers are kept in standard layout")
    }

    /// Builds an image with the given spatial extents from a `(nvoxels, nbands)` matrix.
    pub fn from_voxel_matrix(
        extents: [usize; 3],
        matrix: Array2<ImagePrecision>,
    ) -> FlimResult<Self> {
        let [xsize, ysize, zsize] = extents;
        let nbands = matrix.len_of(Axis(1));
        if matrix.len_of(Axis(0)) != xsize * ysize * zsize {
            return Err(FlimError::ArchitectureMismatchError(format!(
                "{} voxel rows do not fill a {}x{}x{} domain",
                matrix.len_of(Axis(0)),
                xsize,
                ysize,
                zsize
            )));
        }
        let matrix = matrix.as_standard_layout().into_owned();
        let data = matrix
            .into_shape((zsize, ysize, xsize, nbands))
            .map_err(|e| FlimError::ArchitectureMismatchError(e.to_string()))?;
        Ok(Self { data })
    }

    /// Channel-wise concatenation. Both images must share the same spatial domain.
    pub fn concat_bands(&self, other: &MultibandImage) -> FlimResult<MultibandImage> {
        if !self.same_domain(other) {
            return Err(FlimError::ArchitectureMismatchError(format!(
                "cannot concatenate a {:?} image with a {:?} image",
                self.extents(),
                other.extents()
            )));
        }
        let data = concatenate(Axis(3), &[self.data.view(), other.data.view()])
            .map_err(|e| FlimError::ArchitectureMismatchError(e.to_string()))?;
        Ok(Self::new(data))
    }

    /// Returns a new image with `f` applied to every value.
    pub fn map_values<F>(&self, f: F) -> MultibandImage
    where
        F: Fn(ImagePrecision) -> ImagePrecision,
    {
        Self {
            data: self.data.mapv(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts_agree() {
        let chw = array![[[1., 2.], [3., 4.]], [[5., 6.], [7., 8.]]];
        let img = MultibandImage::from_channels_first(chw.view());
        assert_eq!(img.extents(), [2, 2, 1]);
        assert_eq!(img.nbands(), 2);
        assert_eq!(img.band_values(&Voxel::new_2d(1, 0)), array![2., 6.]);
        assert_eq!(img.band_values(&Voxel::new_2d(0, 1)), array![3., 7.]);

        let gray = MultibandImage::from_gray(array![[1., 2., 3.]].view());
        assert_eq!(gray.extents(), [3, 1, 1]);
        assert!(!gray.is_3d());
    }

    #[test]
    fn test_voxel_indexing_round_trips() {
        let img = MultibandImage::zeros(4, 3, 2, 1);
        for i in 0..img.nvoxels() {
            assert_eq!(img.voxel_index(&img.voxel_at(i)), i);
        }
        assert_eq!(img.voxel_index(&Voxel::new(1, 2, 1)), 12 + 8 + 1);
        assert!(img.get(-1, 0, 0).is_none());
        assert!(img.get(0, 3, 0).is_none());
        assert!(img.get(3, 2, 1).is_some());
    }

    #[test]
    fn test_voxel_matrix_is_raster_order() {
        let img = MultibandImage::from_2d(array![[[1., 10.], [2., 20.]], [[3., 30.], [4., 40.]]]);
        let m = img.voxel_matrix();
        assert_eq!(m.row(1), array![2., 20.]);
        assert_eq!(m.row(2), array![3., 30.]);

        let rebuilt = MultibandImage::from_voxel_matrix(img.extents(), m.to_owned()).unwrap();
        assert_eq!(rebuilt, img);
    }

    #[test]
    fn test_concat_bands() {
        let a = MultibandImage::from_gray(array![[1., 2.]].view());
        let b = MultibandImage::from_gray(array![[3., 4.]].view());
        let c = a.concat_bands(&b).unwrap();
        assert_eq!(c.nbands(), 2);
        assert_eq!(c.band_values(&Voxel::new_2d(1, 0)), array![2., 4.]);

        let d = MultibandImage::zeros(3, 1, 1, 1);
        assert!(matches!(
            a.concat_bands(&d),
            Err(FlimError::ArchitectureMismatchError(_))
        ));
    }
}
