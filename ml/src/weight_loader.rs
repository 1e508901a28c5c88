use crate::WeightPrecision;
use ndarray::{Array, ArrayBase, ArrayView, Dimension, ShapeError};
use ndarray_npy::{
    read_npy, write_npy, NpzReader, NpzWriter, ReadNpyError, ReadNpzError, WriteNpyError,
    WriteNpzError,
};
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type WeightResult<T> = Result<T, WeightError>;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("No weights with name {0} found")]
    WeightKeyError(String),
    #[error("Weight file not found. Filesystem reported error\n {0}.")]
    WeightFileNotFoundError(#[from] std::io::Error),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpzError(#[from] ReadNpzError),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpyError(#[from] ReadNpyError),
    #[error("Weights could not be written:\n {0}.")]
    WeightWriteNpyError(#[from] WriteNpyError),
    #[error("Weights could not be written:\n {0}.")]
    WeightWriteNpzError(#[from] WriteNpzError),
    #[error("Wrong shape for weight:\n {0}.")]
    WeightShapeError(#[from] ShapeError),
}

/// Read access to named parameter arrays.
pub trait WeightLoader {
    fn get_weight<D>(&mut self, param_name: &str) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension;

    fn has_weight(&mut self, param_name: &str) -> bool;
}

/// Write access to named parameter arrays.
pub trait WeightWriter {
    fn put_weight<D>(
        &mut self,
        param_name: &str,
        weights: ArrayView<WeightPrecision, D>,
    ) -> WeightResult<()>
    where
        D: Dimension;
}

/// Parameters stored as one `<name>.npy` file per array inside a folder.
pub struct NpyDirStore {
    dir: PathBuf,
}

impl NpyDirStore {
    /// Opens (and creates, if needed) the parameter folder.
    pub fn new<P: AsRef<Path>>(dir: P) -> WeightResult<NpyDirStore> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(NpyDirStore {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path_of(&self, param_name: &str) -> PathBuf {
        self.dir.join(format!("{}.npy", param_name))
    }
}

impl WeightLoader for NpyDirStore {
    fn get_weight<D>(&mut self, param_name: &str) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
    {
        let path = self.path_of(param_name);
        if !path.exists() {
            return Err(WeightError::WeightKeyError(param_name.to_string()));
        }
        Ok(read_npy(path)?)
    }

    fn has_weight(&mut self, param_name: &str) -> bool {
        self.path_of(param_name).exists()
    }
}

impl WeightWriter for NpyDirStore {
    fn put_weight<D>(
        &mut self,
        param_name: &str,
        weights: ArrayView<WeightPrecision, D>,
    ) -> WeightResult<()>
    where
        D: Dimension,
    {
        write_npy(self.path_of(param_name), &weights)?;
        Ok(())
    }
}

pub struct NpzWeightLoader<R>
where
    R: Seek + Read,
{
    handle: R,
}

impl NpzWeightLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightLoader<std::fs::File>> {
        let handle = std::fs::File::open(path)?;
        Ok(NpzWeightLoader { handle })
    }
}

impl<'a> NpzWeightLoader<Cursor<&'a [u8]>> {
    pub fn from_buffer(bytes_array: &'a [u8]) -> NpzWeightLoader<Cursor<&'a [u8]>> {
        NpzWeightLoader {
            handle: Cursor::new(bytes_array),
        }
    }
}

impl<R> WeightLoader for NpzWeightLoader<R>
where
    R: Seek + Read,
{
    fn get_weight<D>(&mut self, param_name: &str) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
    {
        // The npz reader borrows the handle mutably, so it is recreated per lookup.
        let mut reader = NpzReader::new(&mut self.handle)?;
        if !reader.names()?.iter().any(|n| same_array_name(n, param_name)) {
            return Err(WeightError::WeightKeyError(param_name.to_string()));
        }
        let arr: ArrayBase<_, D> = reader.by_name(param_name)?;
        Ok(arr)
    }

    fn has_weight(&mut self, param_name: &str) -> bool {
        NpzReader::new(&mut self.handle)
            .and_then(|mut reader| reader.names())
            .map(|names| names.iter().any(|n| same_array_name(n, param_name)))
            .unwrap_or(false)
    }
}

/// Archive entries may carry the `.npy` suffix of the member file.
fn same_array_name(entry: &str, param_name: &str) -> bool {
    entry == param_name || entry.strip_suffix(".npy") == Some(param_name)
}

/// Collects named arrays into a single `.npz` archive.
pub struct NpzWeightWriter<W>
where
    W: Write + Seek,
{
    npz: NpzWriter<W>,
}

impl NpzWeightWriter<std::fs::File> {
    pub fn create<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightWriter<std::fs::File>> {
        let file = std::fs::File::create(path)?;
        Ok(NpzWeightWriter {
            npz: NpzWriter::new(file),
        })
    }
}

impl<W> NpzWeightWriter<W>
where
    W: Write + Seek,
{
    pub fn new(handle: W) -> Self {
        Self {
            npz: NpzWriter::new(handle),
        }
    }

    /// Writes the archive directory. Must be called once all arrays are added.
    pub fn finish(self) -> WeightResult<W> {
        Ok(self.npz.finish()?)
    }
}

impl<W> WeightWriter for NpzWeightWriter<W>
where
    W: Write + Seek,
{
    fn put_weight<D>(
        &mut self,
        param_name: &str,
        weights: ArrayView<WeightPrecision, D>,
    ) -> WeightResult<()>
    where
        D: Dimension,
    {
        self.npz.add_array(param_name, &weights)?;
        Ok(())
    }
}
