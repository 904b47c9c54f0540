// sift-wgpu: GPU SIFT keypoint and descriptor extraction on wgpu
//
// Host-side modules hold the numeric policy and data types; everything that
// touches the device lives under `gpu`.
//
//   let gpu = Arc::new(GpuDevice::new()?);
//   let kernels = Arc::new(SiftKernels::new(&gpu)?);
//   let mut sift = SiftExtractor::new(kernels, Stream::new(gpu, "main"), w, h, SiftConfig::default())?;
//   let result = sift.extract(&image, HostSync::CopyKeypoints)?;
//   for kp in sift.keypoints() { ... }

pub mod config;
pub mod counters;
pub mod error;
pub mod image;
pub mod keypoint;
pub mod normalizer;
pub mod scale_space;

pub mod gpu;

#[cfg(test)]
mod test_support;

pub use config::{HostSync, SiftConfig};
pub use counters::{AppendOutcome, BoundedAppend, OctaveSlice, PointCounters};
pub use error::{Result, SiftError};
pub use gpu::device::{DeviceProfile, GpuDevice};
pub use gpu::image::{DeviceImage, DeviceImageView};
pub use gpu::kernels::SiftKernels;
pub use gpu::pipeline::{Extraction, ImageSource, PipelineState, SiftExtractor};
pub use gpu::stream::Stream;
pub use image::Image;
pub use keypoint::{Keypoint, DESCRIPTOR_SIZE};
pub use normalizer::{DescriptorNormalizer, NormalizerStep};
