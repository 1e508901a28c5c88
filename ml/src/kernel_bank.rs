//! Learned convolution filters of one layer together with the statistics
//! used to normalize patches before projection.
use crate::{
    flim_errors::{FlimError, FlimResult},
    patches::PatchNormalization,
    weight_loader::{WeightLoader, WeightWriter},
    WeightPrecision,
};
use ndarray::*;

/// Kernel bank of a layer.
///
/// `weights` has one flattened kernel per column, so its row count is the
/// patch dimensionality (`#taps * #input bands`) and its column count is the
/// number of channels the layer produces.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelBank {
    weights: Array2<WeightPrecision>,
    normalization: PatchNormalization,
    bias: Option<Array1<WeightPrecision>>,
}

impl KernelBank {
    pub fn new(
        weights: Array2<WeightPrecision>,
        normalization: PatchNormalization,
        bias: Option<Array1<WeightPrecision>>,
    ) -> FlimResult<Self> {
        let (rows, cols) = weights.dim();
        if normalization.mean.len() != rows || normalization.stdev.len() != rows {
            return Err(FlimError::ArchitectureMismatchError(format!(
                "kernel bank has {} rows but normalization vectors of length {} and {}",
                rows,
                normalization.mean.len(),
                normalization.stdev.len()
            )));
        }
        if let Some(b) = &bias {
            if b.len() != cols {
                return Err(FlimError::ArchitectureMismatchError(format!(
                    "kernel bank has {} kernels but a bias of length {}",
                    cols,
                    b.len()
                )));
            }
        }
        Ok(Self {
            weights,
            normalization,
            bias,
        })
    }

    /// Patch dimensionality expected by this bank.
    pub fn patch_dim(&self) -> usize {
        self.weights.nrows()
    }

    /// Number of kernels, i.e. output channels.
    pub fn nkernels(&self) -> usize {
        self.weights.ncols()
    }

    pub fn weights(&self) -> &Array2<WeightPrecision> {
        &self.weights
    }

    pub fn normalization(&self) -> &PatchNormalization {
        &self.normalization
    }

    pub fn bias(&self) -> Option<&Array1<WeightPrecision>> {
        self.bias.as_ref()
    }

    pub fn with_bias(self, bias: Array1<WeightPrecision>) -> FlimResult<Self> {
        Self::new(self.weights, self.normalization, Some(bias))
    }

    /// Bank made of the given columns, in the given order. Normalization is
    /// kept as is, the bias (if any) follows its kernels.
    pub fn select(&self, indices: &[usize]) -> FlimResult<Self> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.nkernels()) {
            return Err(FlimError::IndexOutOfRangeError {
                index,
                width: self.nkernels(),
            });
        }
        Ok(Self {
            weights: self.weights.select(Axis(1), indices),
            normalization: self.normalization.clone(),
            bias: self.bias.as_ref().map(|b| b.select(Axis(0), indices)),
        })
    }

    pub fn kernels_name(layer: usize) -> String {
        format!("conv{}-kernels", layer)
    }

    pub fn mean_name(layer: usize) -> String {
        format!("conv{}-mean", layer)
    }

    pub fn stdev_name(layer: usize) -> String {
        format!("conv{}-stdev", layer)
    }

    pub fn bias_name(layer: usize) -> String {
        format!("conv{}-bias", layer)
    }

    /// Loads the bank of `layer`. The bias is optional in the store.
    pub fn load<L: WeightLoader>(loader: &mut L, layer: usize) -> FlimResult<Self> {
        let weights: Array2<WeightPrecision> = loader.get_weight(&Self::kernels_name(layer))?;
        let mean: Array1<WeightPrecision> = loader.get_weight(&Self::mean_name(layer))?;
        let stdev: Array1<WeightPrecision> = loader.get_weight(&Self::stdev_name(layer))?;
        let bias = if loader.has_weight(&Self::bias_name(layer)) {
            Some(loader.get_weight::<Ix1>(&Self::bias_name(layer))?)
        } else {
            None
        };

        let rows = weights.nrows();
        if mean.len() != rows || stdev.len() != rows {
            return Err(FlimError::DimensionMismatchError {
                layer,
                expected: rows,
                found: mean.len().min(stdev.len()),
            });
        }
        if let Some(b) = &bias {
            if b.len() != weights.ncols() {
                return Err(FlimError::DimensionMismatchError {
                    layer,
                    expected: weights.ncols(),
                    found: b.len(),
                });
            }
        }
        Self::new(weights, PatchNormalization::new(mean, stdev), bias)
    }

    pub fn save<W: WeightWriter>(&self, writer: &mut W, layer: usize) -> FlimResult<()> {
        writer.put_weight(&Self::kernels_name(layer), self.weights.view())?;
        writer.put_weight(&Self::mean_name(layer), self.normalization.mean.view())?;
        writer.put_weight(&Self::stdev_name(layer), self.normalization.stdev.view())?;
        if let Some(b) = &self.bias {
            writer.put_weight(&Self::bias_name(layer), b.view())?;
        }
        Ok(())
    }
}

/// Loads the banks of layers `0..nlayers`.
pub fn load_model<L: WeightLoader>(loader: &mut L, nlayers: usize) -> FlimResult<Vec<KernelBank>> {
    (0..nlayers).map(|l| KernelBank::load(loader, l)).collect()
}

pub fn save_model<W: WeightWriter>(writer: &mut W, banks: &[KernelBank]) -> FlimResult<()> {
    for (layer, bank) in banks.iter().enumerate() {
        bank.save(writer, layer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight_loader::{NpyDirStore, NpzWeightLoader, NpzWeightWriter};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn bank() -> KernelBank {
        KernelBank::new(
            array![[1., 2., 3.], [4., 5., 6.]],
            PatchNormalization::new(array![0.5, 0.25], array![1., 2.]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_shape_checks() {
        assert!(KernelBank::new(
            Array2::zeros((3, 2)),
            PatchNormalization::identity(2),
            None
        )
        .is_err());
        assert!(bank().with_bias(array![1., 2.]).is_err());
        assert!(bank().with_bias(array![1., 2., 3.]).is_ok());
    }

    #[test]
    fn test_select_keeps_requested_order() {
        let b = bank().with_bias(array![10., 20., 30.]).unwrap();
        let s = b.select(&[2, 0]).unwrap();
        assert_eq!(s.weights(), &array![[3., 1.], [6., 4.]]);
        assert_eq!(s.bias(), Some(&array![30., 10.]));
        assert_eq!(s.normalization(), b.normalization());
        assert!(matches!(
            b.select(&[0, 3]),
            Err(FlimError::IndexOutOfRangeError { index: 3, width: 3 })
        ));
    }

    #[test]
    fn test_folder_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = NpyDirStore::new(dir.path()).unwrap();
        let biased = bank().with_bias(array![0., 1., 2.]).unwrap();
        save_model(&mut store, &[bank(), biased.clone()]).unwrap();

        let loaded = load_model(&mut store, 2).unwrap();
        assert_eq!(loaded, vec![bank(), biased]);
        assert!(load_model(&mut store, 3).is_err());
        dir.close().unwrap();
    }

    #[test]
    fn test_npz_round_trip() {
        let mut writer = NpzWeightWriter::new(Cursor::new(Vec::new()));
        bank().save(&mut writer, 0).unwrap();
        let buffer = writer.finish().unwrap().into_inner();
        let mut loader = NpzWeightLoader::from_buffer(&buffer);
        assert_eq!(KernelBank::load(&mut loader, 0).unwrap(), bank());
    }

    #[test]
    fn test_load_rejects_inconsistent_statistics() {
        let dir = tempdir().unwrap();
        let mut store = NpyDirStore::new(dir.path()).unwrap();
        bank().save(&mut store, 0).unwrap();
        let short: Array1<f32> = array![1.];
        store.put_weight(&KernelBank::mean_name(0), short.view()).unwrap();
        assert!(matches!(
            KernelBank::load(&mut store, 0),
            Err(FlimError::DimensionMismatchError { layer: 0, .. })
        ));
        dir.close().unwrap();
    }
}
