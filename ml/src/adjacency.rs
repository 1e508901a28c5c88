//! Receptive fields of convolutional layers as sets of voxel offsets.
use crate::{
    architecture::LayerSpec,
    flim_errors::{FlimError, FlimResult},
};

/// Offset triple `(dx, dy, dz)` of one kernel tap.
pub type Offset = [isize; 3];

/// Displacements sampled by a kernel around its center voxel, in z-major,
/// then y, then x order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyRelation {
    offsets: Vec<Offset>,
}

impl AdjacencyRelation {
    /// Evenly spaced, origin-centered offsets: along an axis of size `k` and
    /// step `d`, the offsets are `(i - k/2) * d` for `i` in `0..k`.
    pub fn cuboid(sizes: [usize; 3], steps: [usize; 3]) -> FlimResult<Self> {
        if sizes.iter().any(|&s| s == 0) || steps.iter().any(|&d| d == 0) {
            return Err(FlimError::ArchitectureMismatchError(format!(
                "adjacency needs positive sizes and steps, got sizes {:?} and steps {:?}",
                sizes, steps
            )));
        }
        let axis = |k: usize, d: usize| -> Vec<isize> {
            (0..k)
                .map(|i| (i as isize - (k / 2) as isize) * d as isize)
                .collect()
        };
        let (xs, ys, zs) = (
            axis(sizes[0], steps[0]),
            axis(sizes[1], steps[1]),
            axis(sizes[2], steps[2]),
        );
        let mut offsets = Vec::with_capacity(sizes.iter().product());
        for &dz in &zs {
            for &dy in &ys {
                for &dx in &xs {
                    offsets.push([dx, dy, dz]);
                }
            }
        }
        Ok(Self { offsets })
    }

    /// Adjacency of a layer's kernel without atrous correction.
    pub fn from_layer(layer: &LayerSpec, dim3d: bool) -> FlimResult<Self> {
        Self::adaptive_from_layer(layer, 1, dim3d)
    }

    /// Adjacency of a layer's kernel with its dilation multiplied by the
    /// accumulated `atrous_factor` of earlier pooling layers.
    pub fn adaptive_from_layer(
        layer: &LayerSpec,
        atrous_factor: usize,
        dim3d: bool,
    ) -> FlimResult<Self> {
        let atrous_factor = atrous_factor.max(1);
        let (zsize, zrate) = if dim3d {
            (layer.kernel_size[2], layer.dilation_rate[2])
        } else {
            (1, 1)
        };
        let sizes = [layer.kernel_size[0], layer.kernel_size[1], zsize];
        let steps = [
            layer.dilation_rate[0] * atrous_factor,
            layer.dilation_rate[1] * atrous_factor,
            zrate * atrous_factor,
        ];
        Self::cuboid(sizes, steps)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> &[Offset] {
        &self.offsets
    }

    /// Number of voxels covered along each axis, from the lowest to the highest offset.
    pub fn span(&self) -> [usize; 3] {
        let mut span = [1; 3];
        for (axis, s) in span.iter_mut().enumerate() {
            let min = self.offsets.iter().map(|o| o[axis]).min().unwrap_or(0);
            let max = self.offsets.iter().map(|o| o[axis]).max().unwrap_or(0);
            *s = (max - min) as usize + 1;
        }
        span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_3x3_offsets() {
        let adj = AdjacencyRelation::cuboid([3, 3, 1], [1, 1, 1]).unwrap();
        assert_eq!(adj.len(), 9);
        assert_eq!(adj.offsets()[0], [-1, -1, 0]);
        assert_eq!(adj.offsets()[4], [0, 0, 0]);
        assert_eq!(adj.offsets()[8], [1, 1, 0]);
    }

    #[test]
    fn test_2d_mode_ignores_depth() {
        let layer = LayerSpec::new([3, 3, 0], 1, 1, 1).with_dilation([1, 1, 0]);
        let adj = AdjacencyRelation::from_layer(&layer, false).unwrap();
        assert_eq!(adj.len(), 9);
        assert_eq!(adj.span(), [3, 3, 1]);
        assert!(AdjacencyRelation::from_layer(&layer, true).is_err());
    }

    #[test]
    fn test_3d_taps() {
        let layer = LayerSpec::new([3, 3, 3], 1, 1, 1);
        let adj = AdjacencyRelation::from_layer(&layer, true).unwrap();
        assert_eq!(adj.len(), 27);
        assert_eq!(adj.span(), [3, 3, 3]);
    }

    #[test]
    fn test_atrous_receptive_field_growth() {
        for &k in &[1usize, 2, 3, 5] {
            for &dilation in &[1usize, 2, 3] {
                for &atrous in &[1usize, 2, 4] {
                    let layer =
                        LayerSpec::new([k, k, 1], 1, 1, 1).with_dilation([dilation, dilation, 1]);
                    let adj =
                        AdjacencyRelation::adaptive_from_layer(&layer, atrous, false).unwrap();
                    let expected = (k - 1) * dilation * atrous + 1;
                    assert_eq!(adj.span(), [expected, expected, 1]);
                    assert_eq!(adj.len(), k * k);
                }
            }
        }
    }

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(matches!(
            AdjacencyRelation::cuboid([0, 3, 1], [1, 1, 1]),
            Err(FlimError::ArchitectureMismatchError(_))
        ));
    }
}
