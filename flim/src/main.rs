//! This crate ties in all the parts of the project and provides a command line
//! interface to learn FLIM networks from markers and extract features with them.

use env_logger::Builder;
use flim::{
    feature_path, image_stem, load_image, load_object_mask, load_training_samples,
    read_image_list, write_features,
};
use log::{info, warn};
use ml::{
    backend::{backend_for, Device},
    batch_planner::{BatchPlanner, MemoryBudget},
    kernel_bank::save_model,
    kernel_estimation::{ConsensusStrategy, TrainingConfig},
    kernel_selection::{select_kernels_manual, SelectedKernels},
    pipeline::{forward_layer, FlimNetwork, ObjectMask},
    training::{FlimTrainer, TrainingSample},
    weight_loader::NpyDirStore,
    Architecture, MultibandImage, WeightPrecision,
};
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use quicli::prelude::*;
use std::{fs, path::PathBuf};
use structopt::StructOpt;

/// Learns the kernel banks of every layer from marked training images
#[derive(Debug, StructOpt)]
struct LearnOpts {
    /// Folder with the training images
    #[structopt(parse(from_os_str))]
    orig_dir: PathBuf,
    /// Folder with one <image stem>-seeds.txt marker file per training image
    #[structopt(parse(from_os_str))]
    markers_dir: PathBuf,
    /// Architecture description (JSON)
    #[structopt(parse(from_os_str))]
    arch: PathBuf,
    /// Output folder for the learned parameters
    #[structopt(parse(from_os_str))]
    param_dir: PathBuf,
    /// Builds the consensus banks from principal components instead of k-means
    #[structopt(long)]
    pca: bool,
    /// Seed of every clustering run
    #[structopt(long = "seed", default_value = "42")]
    seed: u64,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Learns the kernel bank of a single layer from the activations of the
/// previous layer
#[derive(Debug, StructOpt)]
struct LearnLayerOpts {
    /// Folder with the layer inputs (training images for layer 0)
    #[structopt(parse(from_os_str))]
    activ_dir: PathBuf,
    /// Folder with marker files, in the coordinates of the layer inputs
    #[structopt(parse(from_os_str))]
    markers_dir: PathBuf,
    #[structopt(parse(from_os_str))]
    arch: PathBuf,
    #[structopt(parse(from_os_str))]
    param_dir: PathBuf,
    #[structopt(short = "l", long = "layer")]
    layer: usize,
    /// Writes the layer outputs and the carried over markers here, ready to
    /// learn the next layer
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    #[structopt(long = "seed", default_value = "42")]
    seed: u64,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Extracts features of the listed images with a learned network
#[derive(Debug, StructOpt)]
struct ExtractOpts {
    /// Folder with the images
    #[structopt(parse(from_os_str))]
    orig_dir: PathBuf,
    /// File listing the images to process
    #[structopt(parse(from_os_str))]
    image_list: PathBuf,
    #[structopt(parse(from_os_str))]
    arch: PathBuf,
    #[structopt(parse(from_os_str))]
    param_dir: PathBuf,
    /// Output folder, receives <image stem>-layer<l>.npy files
    #[structopt(parse(from_os_str))]
    feat_dir: PathBuf,
    /// Device index, negative for the host
    #[structopt(short = "d", long = "device", default_value = "-1")]
    device: i32,
    /// Writes the output of every layer instead of the last one only
    #[structopt(long = "all-layers")]
    all_layers: bool,
    /// Memory the extraction may use, in megabytes
    #[structopt(long = "budget-mb", default_value = "2048")]
    budget_mb: usize,
    /// Folder with one object mask per image, named like the image; features
    /// outside the object are set to zero
    #[structopt(long = "object-dir", parse(from_os_str))]
    object_dir: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Applies a single layer to activations of the previous layer
#[derive(Debug, StructOpt)]
struct ExtractLayerOpts {
    #[structopt(parse(from_os_str))]
    activ_dir: PathBuf,
    #[structopt(parse(from_os_str))]
    image_list: PathBuf,
    #[structopt(parse(from_os_str))]
    arch: PathBuf,
    #[structopt(parse(from_os_str))]
    param_dir: PathBuf,
    #[structopt(parse(from_os_str))]
    feat_dir: PathBuf,
    #[structopt(short = "l", long = "layer")]
    layer: usize,
    #[structopt(short = "d", long = "device", default_value = "-1")]
    device: i32,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Keeps hand-picked kernels of a kernel bank
#[derive(Debug, StructOpt)]
struct SelectKernelsOpts {
    /// Kernel bank, one kernel per column
    #[structopt(parse(from_os_str))]
    bank: PathBuf,
    /// JSON document with the indices to keep
    #[structopt(parse(from_os_str))]
    selection: PathBuf,
    #[structopt(parse(from_os_str))]
    output: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Prints how many images may be processed at once
#[derive(Debug, StructOpt)]
struct BatchSizeOpts {
    #[structopt(parse(from_os_str))]
    arch: PathBuf,
    #[structopt(long = "nvoxels")]
    nvoxels: usize,
    #[structopt(long = "nchannels")]
    nchannels: usize,
    #[structopt(long = "budget-mb", default_value = "2048")]
    budget_mb: usize,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Learn convolutional features from a few image markers.
#[derive(Debug, StructOpt)]
#[structopt(name = "flim")]
enum Flim {
    #[structopt(name = "learn", about = "Learns a FLIM network from marked images.")]
    Learn(LearnOpts),
    #[structopt(
        name = "learn-layer",
        about = "Learns one layer of a FLIM network from the previous layer's activations."
    )]
    LearnLayer(LearnLayerOpts),
    #[structopt(name = "extract", about = "Extracts features with a learned network.")]
    Extract(ExtractOpts),
    #[structopt(name = "extract-layer", about = "Applies a single layer of a learned network.")]
    ExtractLayer(ExtractLayerOpts),
    #[structopt(
        name = "select-kernels",
        about = "Keeps the listed kernels of a kernel bank, in the listed order."
    )]
    SelectKernels(SelectKernelsOpts),
    #[structopt(
        name = "batch-size",
        about = "Prints the number of images that fit into the memory budget."
    )]
    BatchSize(BatchSizeOpts),
}

/// Trait for the subcommands that flim uses
trait FlimOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

fn training_config(seed: u64, pca: bool) -> TrainingConfig {
    TrainingConfig {
        seed,
        consensus: if pca {
            ConsensusStrategy::Pca
        } else {
            ConsensusStrategy::KMeans
        },
        ..TrainingConfig::default()
    }
}

impl FlimOpts for LearnOpts {
    fn run(&self) -> CliResult {
        let arch = Architecture::from_json_file(&self.arch)?;
        let samples: Vec<TrainingSample> =
            load_training_samples(&self.orig_dir, &self.markers_dir)?
                .into_iter()
                .map(|(_, sample)| sample)
                .collect();
        let trainer = FlimTrainer::new(&arch, training_config(self.seed, self.pca));
        let banks = trainer.learn_model(&samples)?;

        let mut store = NpyDirStore::new(&self.param_dir)?;
        save_model(&mut store, &banks)?;
        arch.to_json_file(self.param_dir.join("arch.json"))?;
        info!("Saved {} layers to {}", banks.len(), self.param_dir.display());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl FlimOpts for LearnLayerOpts {
    fn run(&self) -> CliResult {
        let arch = Architecture::from_json_file(&self.arch)?;
        let named = load_training_samples(&self.activ_dir, &self.markers_dir)?;
        let samples: Vec<TrainingSample> = named.iter().map(|(_, s)| s.clone()).collect();
        let trainer = FlimTrainer::new(&arch, training_config(self.seed, false));
        let bank = trainer.learn_layer(self.layer, &samples)?;

        let mut store = NpyDirStore::new(&self.param_dir)?;
        bank.save(&mut store, self.layer)?;
        info!(
            "Saved layer {} ({} kernels) to {}",
            self.layer,
            bank.nkernels(),
            self.param_dir.display()
        );

        if let Some(output) = &self.output {
            fs::create_dir_all(output)?;
            let backend = backend_for(Device::Host);
            for (stem, sample) in &named {
                let out = forward_layer(
                    &arch,
                    self.layer,
                    &bank,
                    &sample.image,
                    &[],
                    backend.as_ref(),
                    MemoryBudget::default(),
                )?;
                let extents = out.features.extents();
                let markers = match &out.pooling {
                    Some(geometry) => sample
                        .markers
                        .map_voxels(|v| geometry.map_voxel(v, extents)),
                    None => sample.markers.clone(),
                };
                write_features(&output.join(format!("{}.npy", stem)), &out.features)?;
                markers.to_file(
                    output.join(format!("{}-seeds.txt", stem)),
                    out.features.is_3d(),
                )?;
            }
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl FlimOpts for ExtractOpts {
    fn run(&self) -> CliResult {
        let arch = Architecture::from_json_file(&self.arch)?;
        let mut store = NpyDirStore::new(&self.param_dir)?;
        let budget = MemoryBudget::from_megabytes(self.budget_mb);
        let net = FlimNetwork::from_parameters(arch, &mut store)?
            .with_device(Device::from(self.device))
            .with_budget(budget);
        fs::create_dir_all(&self.feat_dir)?;

        let paths: Vec<PathBuf> = read_image_list(&self.image_list)?
            .iter()
            .map(|name| self.orig_dir.join(name))
            .collect();
        let first = match paths.first() {
            Some(path) => load_image(path)?,
            None => {
                warn!("{} lists no images", self.image_list.display());
                return Ok(());
            }
        };
        // images are loaded group by group, sized after the first one
        let group = BatchPlanner::new(net.architecture(), budget)
            .batch_size_cpu(first.nvoxels(), first.nbands());
        drop(first);

        let nlayers = net.architecture().nlayers();
        for chunk in paths.chunks(group) {
            let images: Vec<MultibandImage> =
                chunk.iter().map(|p| load_image(p)).collect::<Result<_, _>>()?;
            let features = match &self.object_dir {
                Some(dir) => {
                    let masks: Vec<ObjectMask> = chunk
                        .iter()
                        .map(|p| load_object_mask(dir, p))
                        .collect::<Result<_, _>>()?;
                    net.extract_batch_masked(&images, &masks, budget)?
                }
                None => net.extract_batch(&images, budget)?,
            };
            for (path, layers) in chunk.iter().zip(features) {
                let stem = image_stem(path);
                for (layer, output) in layers.iter().enumerate() {
                    if self.all_layers || layer + 1 == nlayers {
                        write_features(&feature_path(&self.feat_dir, &stem, layer), output)?;
                    }
                }
                info!("Extracted features of {}", path.display());
            }
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl FlimOpts for ExtractLayerOpts {
    fn run(&self) -> CliResult {
        let arch = Architecture::from_json_file(&self.arch)?;
        let mut store = NpyDirStore::new(&self.param_dir)?;
        let net = FlimNetwork::from_parameters(arch, &mut store)?
            .with_device(Device::from(self.device));
        fs::create_dir_all(&self.feat_dir)?;

        for name in read_image_list(&self.image_list)? {
            let path = self.activ_dir.join(&name);
            let activation = load_image(&path)?;
            let output = net.extract_from_layer(&activation, self.layer)?;
            write_features(
                &feature_path(&self.feat_dir, &image_stem(&path), self.layer),
                &output,
            )?;
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl FlimOpts for SelectKernelsOpts {
    fn run(&self) -> CliResult {
        let bank: Array2<WeightPrecision> = read_npy(&self.bank)?;
        let selection = SelectedKernels::from_json_file(&self.selection)?;
        let reduced = select_kernels_manual(&bank, selection.indices())?;
        write_npy(&self.output, &reduced)?;
        info!("Kept {} of {} kernels", reduced.ncols(), bank.ncols());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl FlimOpts for BatchSizeOpts {
    fn run(&self) -> CliResult {
        let arch = Architecture::from_json_file(&self.arch)?;
        let planner = BatchPlanner::new(&arch, MemoryBudget::from_megabytes(self.budget_mb));
        println!("{}", planner.batch_size_cpu(self.nvoxels, self.nchannels));
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl FlimOpts for Flim {
    fn run(&self) -> CliResult {
        match self {
            Flim::Learn(c) => c.run(),
            Flim::LearnLayer(c) => c.run(),
            Flim::Extract(c) => c.run(),
            Flim::ExtractLayer(c) => c.run(),
            Flim::SelectKernels(c) => c.run(),
            Flim::BatchSize(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Flim::Learn(c) => c.get_verbosity(),
            Flim::LearnLayer(c) => c.get_verbosity(),
            Flim::Extract(c) => c.get_verbosity(),
            Flim::ExtractLayer(c) => c.get_verbosity(),
            Flim::SelectKernels(c) => c.get_verbosity(),
            Flim::BatchSize(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Flim::from_args();
    args.setup_env_logger()?;
    args.run()
}
