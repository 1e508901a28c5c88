//! File-system side of the FLIM command line: decoding images, enumerating
//! image lists, pairing images with marker files and writing feature maps.
use image::io::Reader as ImageReader;
use log::{info, warn};
use ml::{
    markers::MarkerSet,
    multiband_image::MultibandImage,
    pipeline::ObjectMask,
    training::TrainingSample,
    FlimError, ImagePrecision,
};
use ndarray::{ArrayD, Ix2, Ix3, Ix4};
use ndarray_npy::{read_npy, write_npy, ReadNpyError, WriteNpyError};
use nshare::{ToNdarray2, ToNdarray3};
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type CliIoResult<T> = Result<T, CliIoError>;

#[derive(Error, Debug)]
pub enum CliIoError {
    #[error("Image {0} has an unrecognized type. Only .jpg, .png and .npy are supported.")]
    UnsupportedImageError(PathBuf),
    #[error("Array in {path} has {ndim} dimensions, expected (y, x), (y, x, c) or (z, y, x, c).")]
    ArrayShapeError { path: PathBuf, ndim: usize },
    #[error("Image could not be decoded:\n {0}.")]
    ImageDecodeError(#[from] image::ImageError),
    #[error("Array file not readable:\n {0}.")]
    NpyReadError(#[from] ReadNpyError),
    #[error("Array file could not be written:\n {0}.")]
    NpyWriteError(#[from] WriteNpyError),
    #[error("Filesystem reported error\n {0}.")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    FlimError(#[from] FlimError),
    #[error("No training image in {0} has a marker file.")]
    NoTrainingImagesError(PathBuf),
    #[error("No object mask for {image} in {dir}.")]
    MissingObjectMaskError { dir: PathBuf, image: PathBuf },
}

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "npy"];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|e| e.to_ascii_lowercase())
}

/// File name without extension, used to pair images with markers and outputs.
pub fn image_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .to_string()
}

/// Loads an image as a multiband image.
///
/// Grey `.png`/`.jpg` files give one band, every other colour type three RGB
/// bands, all scaled to [0, 1]. `.npy` arrays are taken as is, in
/// `(y, x)`, `(y, x, c)` or `(z, y, x, c)` order.
pub fn load_image(path: &Path) -> CliIoResult<MultibandImage> {
    match extension(path).as_deref() {
        Some("npy") => {
            let array: ArrayD<ImagePrecision> = read_npy(path)?;
            let ndim = array.ndim();
            let shape_error = |_| CliIoError::ArrayShapeError {
                path: path.to_path_buf(),
                ndim,
            };
            match ndim {
                2 => Ok(MultibandImage::from_gray(
                    array.into_dimensionality::<Ix2>().map_err(shape_error)?.view(),
                )),
                3 => Ok(MultibandImage::from_2d(
                    array.into_dimensionality::<Ix3>().map_err(shape_error)?,
                )),
                4 => Ok(MultibandImage::new(
                    array.into_dimensionality::<Ix4>().map_err(shape_error)?,
                )),
                _ => Err(CliIoError::ArrayShapeError {
                    path: path.to_path_buf(),
                    ndim,
                }),
            }
        }
        Some("png") | Some("jpg") | Some("jpeg") => {
            let img = ImageReader::open(path)?.decode()?;
            if img.color().channel_count() <= 2 {
                let gray = img
                    .to_luma8()
                    .into_ndarray2()
                    .mapv(|x| x as ImagePrecision / 255.0);
                Ok(MultibandImage::from_gray(gray.view()))
            } else {
                // nshare gives (C, H, W)
                let rgb = img
                    .to_rgb8()
                    .into_ndarray3()
                    .mapv(|x| x as ImagePrecision / 255.0);
                Ok(MultibandImage::from_channels_first(rgb.view()))
            }
        }
        _ => Err(CliIoError::UnsupportedImageError(path.to_path_buf())),
    }
}

/// Image files of `dir`, sorted by name.
pub fn list_images(dir: &Path) -> CliIoResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = extension(&path)
            .map(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
            .unwrap_or(false);
        if path.is_file() && supported {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Reads an image list: one file name per line, or comma separated with the
/// file name in the first column. A leading line holding only the entry
/// count is skipped, as are blank lines.
pub fn read_image_list(path: &Path) -> CliIoResult<Vec<String>> {
    let content = fs::read_to_string(path)?;
    let mut names = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let name = line.split(',').next().unwrap_or_default().trim();
        if name.is_empty() || (number == 0 && name.parse::<usize>().is_ok()) {
            continue;
        }
        names.push(name.to_string());
    }
    Ok(names)
}

/// Marker file belonging to `image`: `<markers_dir>/<stem>-seeds.txt`.
pub fn markers_path(markers_dir: &Path, image: &Path) -> PathBuf {
    markers_dir.join(format!("{}-seeds.txt", image_stem(image)))
}

/// Object mask of `image` in `object_dir`: the file with the same name, or
/// else any supported image file with the same stem.
pub fn load_object_mask(object_dir: &Path, image: &Path) -> CliIoResult<ObjectMask> {
    let same_name = image.file_name().map(|name| object_dir.join(name));
    let same_stem = IMAGE_EXTENSIONS
        .iter()
        .map(|ext| object_dir.join(format!("{}.{}", image_stem(image), ext)));
    let path = same_name
        .into_iter()
        .chain(same_stem)
        .find(|p| p.is_file())
        .ok_or_else(|| CliIoError::MissingObjectMaskError {
            dir: object_dir.to_path_buf(),
            image: image.to_path_buf(),
        })?;
    let mask = ObjectMask::new(&load_image(&path)?);
    info!("Object mask {}: {} voxels inside", path.display(), mask.count());
    Ok(mask)
}

/// Every image of `images_dir` that has a marker file in `markers_dir`, in
/// file name order. Images without markers are skipped.
pub fn load_training_samples(
    images_dir: &Path,
    markers_dir: &Path,
) -> CliIoResult<Vec<(String, TrainingSample)>> {
    let mut samples = Vec::new();
    for path in list_images(images_dir)? {
        let marker_file = markers_path(markers_dir, &path);
        if !marker_file.exists() {
            warn!("No markers for {}, skipping it.", path.display());
            continue;
        }
        let image = load_image(&path)?;
        let markers = MarkerSet::from_file(&marker_file)?;
        info!(
            "Training image {}: {:?} voxels, {} bands, {} markers",
            path.display(),
            image.extents(),
            image.nbands(),
            markers.len()
        );
        samples.push((image_stem(&path), TrainingSample::new(image, markers)));
    }
    if samples.is_empty() {
        return Err(CliIoError::NoTrainingImagesError(images_dir.to_path_buf()));
    }
    Ok(samples)
}

/// Output file of layer `layer` for the image with the given stem.
pub fn feature_path(feat_dir: &Path, stem: &str, layer: usize) -> PathBuf {
    feat_dir.join(format!("{}-layer{}.npy", stem, layer))
}

/// Writes a feature map as a `(z, y, x, c)` array.
pub fn write_features(path: &Path, features: &MultibandImage) -> CliIoResult<()> {
    write_npy(path, features.data())?;
    Ok(())
}
