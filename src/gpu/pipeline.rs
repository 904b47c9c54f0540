// gpu/pipeline.rs — SIFT extraction orchestrator.
//
// One `SiftExtractor` owns everything a single extraction touches: its
// stream, pyramid arena, keypoint buffer and parameter cache. Several
// extractors can share one device and one set of compiled kernels and run
// on different threads.
//
// PER-EXTRACTION FLOW
// ───────────────────
//   upload      source image → arena source slot (host write or device copy)
//   octave 0    low-pass of the source, or bilinear 2x upsample + low-pass
//   octaves 1+  downsample of the previous octave (variance 0.5)
//   textures    refresh every octave texture from the arena
//   per octave  coarse to fine: DoG stack → open/detect/close → orientation
//               + descriptor (indirect, sized by close_octave)
//   readback    synchronize the stream, read the counters, optionally copy
//               the stored keypoints to the host mirror
//
// Everything up to the readback is recorded into one encoder and submitted
// once. The only blocking points are the counter read and the optional
// keypoint copy.
//
// PARAMETER CACHE
// ───────────────
// Kernel parameters that depend on the configuration (coefficient buffers,
// the Laplace table, the normalizer program) live in a per-extractor
// `ParamCache` and are re-uploaded only when their value changes. Nothing
// is shared between extractors, so concurrent extractors with different
// configurations cannot disturb each other.

use std::sync::Arc;

use crate::config::{HostSync, SiftConfig};
use crate::counters::{BoundedAppend, OctaveSlice, PointCounters};
use crate::error::{Result, SiftError};
use crate::gpu::arena::{ArenaLayout, ImageSlot, PyramidArena};
use crate::gpu::descriptor::{describe_octave, NormalizerBuffer};
use crate::gpu::device::GpuDevice;
use crate::gpu::dog::{compute_difference_stack, LaplaceTable};
use crate::gpu::extrema::{detect_octave, DetectionParams};
use crate::gpu::image::{encode_copy_image, write_image, DeviceImage};
use crate::gpu::kernels::{SiftKernels, StageContext};
use crate::gpu::keypoints::KeypointBuffer;
use crate::gpu::scale_space::ScaleSpaceBuilder;
use crate::gpu::stream::Stream;
use crate::image::Image;
use crate::keypoint::Keypoint;
use crate::scale_space::{DOWNSAMPLE_VARIANCE, MIN_LOWPASS_SIGMA};

/// Input of one extraction.
#[derive(Clone, Copy)]
pub enum ImageSource<'a> {
    /// Host pixels, uploaded through the queue.
    Host(&'a Image<f32>),
    /// An image already on the device; copied into the arena on the GPU.
    Device(&'a DeviceImage),
}

impl ImageSource<'_> {
    fn size(&self) -> (u32, u32) {
        match self {
            ImageSource::Host(img) => (img.width() as u32, img.height() as u32),
            ImageSource::Device(img) => (img.view().width, img.view().height),
        }
    }
}

impl<'a> From<&'a Image<f32>> for ImageSource<'a> {
    fn from(img: &'a Image<f32>) -> Self {
        ImageSource::Host(img)
    }
}

impl<'a> From<&'a DeviceImage> for ImageSource<'a> {
    fn from(img: &'a DeviceImage) -> Self {
        ImageSource::Device(img)
    }
}

/// Where the orchestrator is within an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    /// Octaves still to be built below the current one.
    BuildingPyramid { remaining: usize },
    ExtractingOctave(usize),
    Done,
}

/// Summary of one extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Stored keypoints, never above the capacity.
    pub count: u32,
    /// Accepted detections including those dropped for lack of capacity.
    pub raw_count: u32,
    /// Per-octave slices of the keypoint buffer, finest first.
    pub octaves: Vec<OctaveSlice>,
}

impl Extraction {
    pub fn dropped(&self) -> u32 {
        self.raw_count - self.count
    }
}

/// Per-extractor kernel parameters, keyed by value.
pub struct ParamCache {
    scale_space: ScaleSpaceBuilder,
    laplace: LaplaceTable,
    normalizer: NormalizerBuffer,
    detection: DetectionParams,
}

impl ParamCache {
    fn new(gpu: &GpuDevice, layout: &ArenaLayout, config: &SiftConfig) -> Self {
        ParamCache {
            scale_space: ScaleSpaceBuilder::new(),
            laplace: LaplaceTable::new(&gpu.device, layout.plan()),
            normalizer: NormalizerBuffer::new(gpu, &config.normalizer),
            detection: detection_params(config),
        }
    }

    /// Bring every entry in line with `layout` and `config`.
    fn refresh(&mut self, gpu: &GpuDevice, layout: &ArenaLayout, config: &SiftConfig) {
        if self.laplace.plan() != layout.plan() {
            log::debug!("Laplace table rebuilt for {} octaves", layout.num_octaves());
            self.laplace = LaplaceTable::new(&gpu.device, layout.plan());
        }
        self.normalizer.update(gpu, &config.normalizer);
        self.detection = detection_params(config);
    }

    pub fn detection(&self) -> &DetectionParams {
        &self.detection
    }

    pub fn scale_space(&self) -> &ScaleSpaceBuilder {
        &self.scale_space
    }

    pub fn laplace(&self) -> &LaplaceTable {
        &self.laplace
    }

    pub fn normalizer(&self) -> &NormalizerBuffer {
        &self.normalizer
    }
}

fn detection_params(config: &SiftConfig) -> DetectionParams {
    DetectionParams {
        threshold: config.threshold,
        edge_bound: config.edge_ratio_bound(),
        min_scale: config.min_scale,
        max_points: config.max_points,
    }
}

// ---------------------------------------------------------------------------
// SiftExtractor
// ---------------------------------------------------------------------------

pub struct SiftExtractor {
    kernels: Arc<SiftKernels>,
    stream: Stream,
    width: u32,
    height: u32,
    config: SiftConfig,
    arena: PyramidArena,
    keypoints: KeypointBuffer,
    cache: ParamCache,
    state: PipelineState,
}

impl SiftExtractor {
    /// Allocate the arena, keypoint buffer and parameter cache for
    /// `width × height` sources.
    pub fn new(
        kernels: Arc<SiftKernels>,
        stream: Stream,
        width: u32,
        height: u32,
        config: SiftConfig,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(SiftError::InvalidConfig(format!(
                "image size must be non-zero, got {width}x{height}"
            )));
        }
        config.validate()?;
        let gpu = stream.gpu().clone();
        let layout = ArenaLayout::new(width, height, config.num_octaves, config.upscale);
        if layout.num_octaves() < config.num_octaves {
            log::debug!(
                "{width}x{height}: {} of {} octaves fit",
                layout.num_octaves(),
                config.num_octaves
            );
        }
        let cache = ParamCache::new(&gpu, &layout, &config);
        let arena = PyramidArena::new(&gpu, layout)?;
        let keypoints = KeypointBuffer::new(&gpu, config.max_points)?;
        log::info!(
            "extractor '{}': {width}x{height}, {} octaves, capacity {}",
            stream.label(),
            arena.layout().num_octaves(),
            config.max_points
        );

        Ok(SiftExtractor {
            kernels,
            stream,
            width,
            height,
            config,
            arena,
            keypoints,
            cache,
            state: PipelineState::Idle,
        })
    }

    pub fn config(&self) -> &SiftConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    pub fn arena(&self) -> &PyramidArena {
        &self.arena
    }

    pub fn cache(&self) -> &ParamCache {
        &self.cache
    }

    pub fn image_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Keypoints copied by the last `HostSync::CopyKeypoints` extraction.
    pub fn keypoints(&self) -> &[Keypoint] {
        self.keypoints.host()
    }

    pub fn keypoint_buffer(&self) -> &KeypointBuffer {
        &self.keypoints
    }

    pub fn keypoint_buffer_mut(&mut self) -> &mut KeypointBuffer {
        &mut self.keypoints
    }

    /// Replace the configuration.
    ///
    /// A new capacity reallocates the keypoint buffer; a new octave count or
    /// upscale flag reallocates the arena. Other changes only refresh the
    /// parameter cache on the next extraction.
    pub fn set_config(&mut self, config: SiftConfig) -> Result<()> {
        config.validate()?;
        let gpu = self.stream.gpu().clone();
        // Allocate everything before replacing anything, so a failed
        // allocation leaves the extractor on its previous configuration.
        let arena = if self.config.changes_layout(&config) {
            let layout = ArenaLayout::new(self.width, self.height, config.num_octaves, config.upscale);
            Some(PyramidArena::new(&gpu, layout)?)
        } else {
            None
        };
        let keypoints = if config.max_points != self.keypoints.capacity() {
            Some(KeypointBuffer::new(&gpu, config.max_points)?)
        } else {
            None
        };
        if let Some(arena) = arena {
            self.arena = arena;
            log::debug!("arena rebuilt: {} octaves", self.arena.layout().num_octaves());
        }
        if let Some(keypoints) = keypoints {
            self.keypoints = keypoints;
        }
        self.cache.refresh(&gpu, self.arena.layout(), &config);
        self.config = config;
        Ok(())
    }

    /// Run one full extraction.
    ///
    /// Blocks until the counters are read back (and, with
    /// `HostSync::CopyKeypoints`, until the keypoints are copied).
    pub fn extract<'s>(&mut self, source: impl Into<ImageSource<'s>>, host_sync: HostSync) -> Result<Extraction> {
        let source = source.into();
        let (w, h) = source.size();
        if (w, h) != (self.width, self.height) {
            return Err(SiftError::ImageSizeMismatch {
                got_width: w,
                got_height: h,
                want_width: self.width,
                want_height: self.height,
            });
        }

        let gpu = self.stream.gpu().clone();
        self.cache.refresh(&gpu, self.arena.layout(), &self.config);
        let n = self.arena.layout().num_octaves();
        let src_view = self.arena.image_view(ImageSlot::Source);
        let sigma = self.config.init_blur.max(MIN_LOWPASS_SIGMA);

        let mut encoder = self.stream.encoder("sift extract");
        match source {
            ImageSource::Host(img) => write_image(&gpu, self.arena.buffer(), src_view, img),
            ImageSource::Device(img) => {
                encode_copy_image(&mut encoder, img.buffer(), img.view(), self.arena.buffer(), src_view)
            }
        }
        self.arena.encode_refresh_texture(&mut encoder, ImageSlot::Source);
        self.arena.encode_clear_counters(&mut encoder);

        {
            let cache = &mut self.cache;
            let keypoints = &self.keypoints;
            let label = self.stream.label();
            let state = &mut self.state;
            let mut ctx = StageContext {
                gpu: &gpu,
                kernels: &self.kernels,
                arena: &self.arena,
                encoder: &mut encoder,
            };

            // Pyramid, finest first.
            for o in 0..n {
                advance(state, label, PipelineState::BuildingPyramid { remaining: n - 1 - o });
                let dst = ctx.arena.octave_view(o);
                if o == 0 {
                    let temp = ctx.arena.row_blur_view(0, 0);
                    if ctx.arena.layout().plan().upscale() {
                        cache.scale_space.upsample(&mut ctx, dst, ImageSlot::Source);
                        cache.scale_space.low_pass(&mut ctx, dst, dst, temp, sigma);
                    } else {
                        cache.scale_space.low_pass(&mut ctx, dst, src_view, temp, sigma);
                    }
                } else {
                    let prev = ctx.arena.octave_view(o - 1);
                    cache.scale_space.downsample(&mut ctx, dst, prev, DOWNSAMPLE_VARIANCE);
                }
            }
            for o in 0..n {
                ctx.arena.encode_refresh_texture(ctx.encoder, ImageSlot::Octave(o));
            }

            // Detection and description, coarse to fine.
            for o in (0..n).rev() {
                advance(state, label, PipelineState::ExtractingOctave(o));
                compute_difference_stack(&mut ctx, o, &cache.laplace);
                detect_octave(&mut ctx, o, keypoints, &cache.detection);
                describe_octave(&mut ctx, o, keypoints, &cache.normalizer);
            }
        }
        self.stream.submit(encoder);

        let counters = PointCounters::new(self.arena.read_counters(&mut self.stream)?, self.keypoints.capacity())?;
        advance(&mut self.state, self.stream.label(), PipelineState::Done);
        if counters.dropped() > 0 {
            log::warn!(
                "'{}': {} keypoints dropped (capacity {})",
                self.stream.label(),
                counters.dropped(),
                counters.capacity()
            );
        }

        if host_sync == HostSync::CopyKeypoints {
            self.keypoints.sync_to_host(&mut self.stream, counters.count())?;
        }

        let extraction = Extraction {
            count: counters.count(),
            raw_count: counters.raw_total(),
            octaves: counters.octave_slices(),
        };
        log::debug!(
            "'{}': {} keypoints ({} raw) over {n} octaves",
            self.stream.label(),
            extraction.count,
            extraction.raw_count
        );
        Ok(extraction)
    }
}

fn advance(state: &mut PipelineState, label: &str, next: PipelineState) {
    log::trace!("'{label}': {state:?} -> {next:?}");
    *state = next;
}

impl std::fmt::Debug for SiftExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiftExtractor")
            .field("stream", &self.stream)
            .field("size", &(self.width, self.height))
            .field("octaves", &self.arena.layout().num_octaves())
            .field("state", &self.state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
