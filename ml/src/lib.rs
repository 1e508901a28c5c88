//! Feature Learning from Image Markers.
//!
//! Kernels of a small convolutional network are estimated from a few
//! user-drawn markers, without backpropagation, and the learned network is
//! then used to extract per-voxel feature maps.
pub mod activation_functions;
pub mod adjacency;
pub mod architecture;
pub mod backend;
pub mod batch_planner;
pub mod clustering;
pub mod convolutions;
pub mod flim_errors;
pub mod kernel_bank;
pub mod kernel_estimation;
pub mod kernel_selection;
pub mod markers;
pub mod multiband_image;
pub mod patches;
pub mod pipeline;
pub mod pooling;
pub mod training;
pub mod weight_loader;

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

pub use architecture::{Architecture, LayerSpec, PoolType};
pub use backend::Device;
pub use flim_errors::{FlimError, FlimResult};
pub use kernel_bank::KernelBank;
pub use kernel_estimation::{ConsensusStrategy, TrainingConfig};
pub use markers::MarkerSet;
pub use multiband_image::{MultibandImage, Voxel};
pub use pipeline::{FeatureExtractor, FlimNetwork, ObjectMask};
pub use training::{FlimTrainer, TrainingSample};
