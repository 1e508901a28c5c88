//! Compute backends executing the independent voxel batches of a convolution.
use crate::ImagePrecision;
use log::warn;
use ndarray::Array2;
use rayon::prelude::*;

/// Where convolutions should run, as selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Host,
    Accelerator(u32),
}

impl From<i32> for Device {
    /// Negative values select the host, others an accelerator by index.
    fn from(index: i32) -> Self {
        if index < 0 {
            Device::Host
        } else {
            Device::Accelerator(index as u32)
        }
    }
}

/// Runs batch jobs. Every job is independent and produces the rows of one
/// voxel batch; results come back in job order.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn run_batches(
        &self,
        nbatches: usize,
        job: &(dyn Fn(usize) -> Array2<ImagePrecision> + Sync),
    ) -> Vec<Array2<ImagePrecision>>;
}

/// Fans batches out over the rayon thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl ComputeBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn run_batches(
        &self,
        nbatches: usize,
        job: &(dyn Fn(usize) -> Array2<ImagePrecision> + Sync),
    ) -> Vec<Array2<ImagePrecision>> {
        (0..nbatches).into_par_iter().map(|i| job(i)).collect()
    }
}

/// Runs batches one after the other on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialBackend;

impl ComputeBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn run_batches(
        &self,
        nbatches: usize,
        job: &(dyn Fn(usize) -> Array2<ImagePrecision> + Sync),
    ) -> Vec<Array2<ImagePrecision>> {
        (0..nbatches).map(|i| job(i)).collect()
    }
}

/// Backend serving `device`. No accelerator driver is built in, so
/// accelerator requests are served by the host.
pub fn backend_for(device: Device) -> Box<dyn ComputeBackend> {
    match device {
        Device::Host => Box::new(HostBackend),
        Device::Accelerator(index) => {
            warn!(
                "Accelerator {} requested, but no accelerator backend is available; running on the host.",
                index
            );
            Box::new(HostBackend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_selector() {
        assert_eq!(Device::from(-1), Device::Host);
        assert_eq!(Device::from(0), Device::Accelerator(0));
        assert_eq!(Device::from(3), Device::Accelerator(3));
    }

    #[test]
    fn test_backends_keep_job_order() {
        let job = |i: usize| Array2::from_elem((1, 1), i as f32);
        let host = HostBackend.run_batches(64, &job);
        let serial = SerialBackend.run_batches(64, &job);
        assert_eq!(host, serial);
        assert_eq!(host[17][[0, 0]], 17.0);
        assert_eq!(backend_for(Device::Accelerator(1)).name(), "host");
    }
}
