// gpu/mod.rs — wgpu compute layer of the extractor.
//
// Bottom-up:
//
//   device      adapter selection, device profiles, workgroup baking
//   stream      ordered submissions with a per-stream synchronize
//   image       pitched device views, uploads and readbacks
//   arena       one allocation for the pyramid, textures and counters
//   kernels     compiled pipelines shared between extractors
//   scale_space downsample / upsample / low-pass stage
//   dog         blurred levels and difference-of-Gaussian stack
//   extrema     extremum detection with bounded appends
//   descriptor  orientation and descriptor, dispatched indirectly
//   keypoints   fixed-capacity keypoint buffer with a host mirror
//   pipeline    the `SiftExtractor` orchestrator
//
// Stages record into a caller-provided encoder and never submit on their
// own; the orchestrator submits once per extraction.

pub mod arena;
pub mod descriptor;
pub mod device;
pub mod dog;
pub mod extrema;
pub mod image;
pub mod kernels;
pub mod keypoints;
pub mod pipeline;
pub mod scale_space;
pub mod stream;
