// error.rs — error taxonomy for the extraction pipeline.
//
// Fatal conditions (no adapter, device request, allocation or texture
// failure) are returned as `Err` and abort the pipeline instance.
//
// Non-fatal conditions never reach this type:
//   - capacity exceeded: keypoints beyond `max_points` are dropped, visible
//     only as `Extraction::raw_count > Extraction::count`.
//   - invalid input to a stage (empty view): logged with `log::warn!` and
//     the stage encodes nothing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiftError {
    /// No hardware adapter was found. CPU/software renderers are not used.
    #[error("no suitable GPU adapter found (CPU/software renderers are not used)")]
    NoSuitableAdapter,

    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    /// Requested workgroup size exceeds the profile's invocation limit.
    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    /// A device allocation did not fit the device limits or the driver
    /// reported out-of-memory.
    #[error("out of device memory allocating {what} ({bytes} bytes, limit {limit})")]
    ResourceExhausted {
        what: &'static str,
        bytes: u64,
        limit: u64,
    },

    /// Creating a sampling texture failed validation.
    #[error("texture creation failed for {what}: {reason}")]
    TextureCreation { what: String, reason: String },

    /// Shader compilation or compute pipeline creation failed validation.
    #[error("pipeline creation failed for {what}: {reason}")]
    PipelineCreation { what: &'static str, reason: String },

    /// Configuration values out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed descriptor normalizer step list.
    #[error("invalid descriptor normalizer: {0}")]
    InvalidNormalizer(String),

    /// The source image does not match the dimensions the arena was sized for.
    #[error("image is {got_width}x{got_height} but the pipeline was built for {want_width}x{want_height}")]
    ImageSizeMismatch {
        got_width: u32,
        got_height: u32,
        want_width: u32,
        want_height: u32,
    },

    /// A counter array did not have the `2*n + 1` layout.
    #[error("counter array must hold 2*n+1 entries, got {0}")]
    MalformedCounters(usize),

    /// Mapping a readback buffer failed.
    #[error("readback failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),

    /// The map callback was dropped without reporting a result.
    #[error("readback callback never fired")]
    ReadbackLost,
}

pub type Result<T> = std::result::Result<T, SiftError>;
