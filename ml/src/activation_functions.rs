//! Rectification applied to convolution outputs before pooling.
//!
//! Exposed as a layer as well as a free function.
use ndarray::*;

use crate::{multiband_image::MultibandImage, ImagePrecision};

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| if x > 0. { x } else { 0. })
}

/// Relu as a layer, acting on every band of every voxel.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReluLayer {}

impl ReluLayer {
    pub fn new() -> Self {
        Self {}
    }

    pub fn activate(&self, x: &MultibandImage) -> MultibandImage {
        MultibandImage::new(relu(x.data()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu() {
        let x = Array::from_shape_vec((1, 2, 2), vec![1., -2., 3., -4.]).unwrap();
        let out = Array::from_shape_vec((1, 2, 2), vec![1., 0., 3., 0.]).unwrap();
        assert_eq!(relu(&x), out);
    }

    #[test]
    fn test_relu_layer() {
        let x = MultibandImage::from_2d(array![[[1., -2.], [3., -4.]]]);
        let out = MultibandImage::from_2d(array![[[1., 0.], [3., 0.]]]);
        let relu_layer = ReluLayer::new();
        assert_eq!(relu_layer.activate(&x), out);
    }
}
