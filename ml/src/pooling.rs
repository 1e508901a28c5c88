//! Average and max pooling with atrous (dilated) windows.
//!
//! A window of `size` taps per axis, spaced by the atrous factor, slides
//! with the given stride over the valid part of the image, so an axis of
//! extent `dim` yields `(dim - span) / stride + 1` outputs, where
//! `span = (size - 1) * atrous_factor + 1`.
use crate::{
    architecture::{LayerSpec, PoolType},
    flim_errors::{FlimError, FlimResult},
    multiband_image::{MultibandImage, Voxel},
    ImagePrecision,
};
use ndarray::*;

const AXES: [char; 3] = ['x', 'y', 'z'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingGeometry {
    size: [usize; 3],
    dilation: usize,
    stride: [usize; 3],
}

impl PoolingGeometry {
    /// In 2D the z axis is left alone: one tap, unit stride.
    pub fn new(size: [usize; 3], atrous_factor: usize, stride: usize, dim3d: bool) -> Self {
        let stride = stride.max(1);
        let size = [
            size[0].max(1),
            size[1].max(1),
            if dim3d { size[2].max(1) } else { 1 },
        ];
        Self {
            size,
            dilation: atrous_factor.max(1),
            stride: [stride, stride, if dim3d { stride } else { 1 }],
        }
    }

    /// Pooling geometry of a layer, or `None` when the layer does not pool.
    ///
    /// With intrinsic atrous the image is never downsampled: the window is
    /// dilated by the current atrous factor and slides with stride 1, the
    /// stride being accounted for by the atrous factor of later layers.
    pub fn of_layer(
        layer: &LayerSpec,
        atrous_factor: usize,
        intrinsic_atrous: bool,
        dim3d: bool,
    ) -> Option<Self> {
        if layer.pooling.kind == PoolType::NoPool {
            return None;
        }
        let (dilation, stride) = if intrinsic_atrous {
            (atrous_factor, 1)
        } else {
            (1, layer.pooling.stride)
        };
        Some(Self::new(layer.pooling.size, dilation, stride, dim3d))
    }

    pub fn span(&self) -> [usize; 3] {
        let mut span = [1; 3];
        for (axis, s) in span.iter_mut().enumerate() {
            *s = (self.size[axis] - 1) * self.dilation + 1;
        }
        span
    }

    pub fn stride(&self) -> [usize; 3] {
        self.stride
    }

    pub fn output_extents(&self, extents: [usize; 3], layer: usize) -> FlimResult<[usize; 3]> {
        let span = self.span();
        let mut out = [0; 3];
        for axis in 0..3 {
            if extents[axis] < span[axis] {
                return Err(FlimError::InvalidPoolingGeometryError {
                    layer,
                    axis: AXES[axis],
                    extent: extents[axis],
                    span: span[axis],
                    stride: self.stride[axis],
                });
            }
            out[axis] = (extents[axis] - span[axis]) / self.stride[axis] + 1;
        }
        Ok(out)
    }

    /// Output voxel whose window is centered closest to the input `voxel`.
    pub fn map_voxel(&self, voxel: &Voxel, out_extents: [usize; 3]) -> Voxel {
        let span = self.span();
        let coords = [voxel.x, voxel.y, voxel.z];
        let mut mapped = [0; 3];
        for axis in 0..3 {
            let shifted = coords[axis].saturating_sub((span[axis] - 1) / 2);
            mapped[axis] = (shifted / self.stride[axis]).min(out_extents[axis].saturating_sub(1));
        }
        Voxel::new(mapped[0], mapped[1], mapped[2])
    }
}

/// Pools `image` with the given geometry. `NoPool` returns a copy.
pub fn pool(
    image: &MultibandImage,
    kind: PoolType,
    geometry: &PoolingGeometry,
    layer: usize,
) -> FlimResult<MultibandImage> {
    if kind == PoolType::NoPool {
        return Ok(image.clone());
    }
    let [ox, oy, oz] = geometry.output_extents(image.extents(), layer)?;
    let size = geometry.size;
    let dilation = geometry.dilation;
    let stride = geometry.stride;
    let count = (size[0] * size[1] * size[2]) as ImagePrecision;
    let data = image.data();

    let mut out = Array4::<ImagePrecision>::zeros((oz, oy, ox, image.nbands()));
    Zip::indexed(&mut out).par_for_each(|(z, y, x, b), value| {
        let mut sum = 0.0;
        let mut max = ImagePrecision::NEG_INFINITY;
        for kz in 0..size[2] {
            let iz = z * stride[2] + kz * dilation;
            for ky in 0..size[1] {
                let iy = y * stride[1] + ky * dilation;
                for kx in 0..size[0] {
                    let ix = x * stride[0] + kx * dilation;
                    let v = data[[iz, iy, ix, b]];
                    sum += v;
                    max = max.max(v);
                }
            }
        }
        *value = match kind {
            PoolType::MaxPool => max,
            _ => sum / count,
        };
    });
    Ok(MultibandImage::new(out))
}

/// Average pooling with a `size` window dilated by `atrous_factor`.
pub fn atrous_average_pooling(
    image: &MultibandImage,
    size: [usize; 3],
    atrous_factor: usize,
    stride: usize,
    layer: usize,
) -> FlimResult<MultibandImage> {
    let geometry = PoolingGeometry::new(size, atrous_factor, stride, image.is_3d());
    pool(image, PoolType::AvgPool, &geometry, layer)
}

/// Max pooling with a `size` window dilated by `atrous_factor`.
pub fn atrous_max_pooling(
    image: &MultibandImage,
    size: [usize; 3],
    atrous_factor: usize,
    stride: usize,
    layer: usize,
) -> FlimResult<MultibandImage> {
    let geometry = PoolingGeometry::new(size, atrous_factor, stride, image.is_3d());
    pool(image, PoolType::MaxPool, &geometry, layer)
}
