// gpu/arena.rs — one allocation for the whole scale-space pyramid.
//
// All image data of one extractor lives in a single storage buffer, carved
// into pitched slots by a pure layout function:
//
//   ┌────────┬──────────────────────────────────────────┬──────────────┐
//   │ source │ octave 0                                 │ octave 1 ... │
//   │        │ image │ row-blur 0..8      │ DoG 0..7     │              │
//   └────────┴──────────────────────────────────────────┴──────────────┘
//
// Within an octave every slot has the octave's pitch and height, so the
// scratch levels are evenly spaced by `level_stride = pitch * height` and a
// kernel can address level `l` as `base + l * level_stride`.
//
// Slots never overlap and every slot starts on a 512-byte boundary (pitches
// are multiples of 128 floats, so every slot length is too).
//
// Next to the buffer the arena owns:
//   - one R32Float texture per image slot (source + each octave), refreshed
//     from the buffer with `copy_buffer_to_texture` before it is sampled;
//   - the point-counter buffer (2n+1 u32, see counters.rs);
//   - the indirect-dispatch buffer (one [x, y, z] triple per octave).
//
// Kernels bind the arena buffer whole and read_write in every dispatch:
// binding two ranges of one buffer with different access in the same
// dispatch is a usage conflict in wgpu.
//
// Textures are sampled with `textureLoad` on clamped integer coordinates;
// R32Float is not filterable, so bilinear interpolation is done in WGSL.

use crate::counters::counter_len;
use crate::error::{Result, SiftError};
use crate::gpu::device::GpuDevice;
use crate::gpu::image::{pitch_for, read_buffer, read_image, DeviceImageView};
use crate::gpu::stream::Stream;
use crate::image::Image;
use crate::scale_space::{OctavePlan, DOG_LEVELS, LEVELS_PER_OCTAVE};

/// An image slot: the uploaded source or the base image of an octave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    Source,
    Octave(usize),
}

/// Bytes per indirect dispatch triple.
pub const DISPATCH_ARGS_BYTES: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OctaveSlots {
    image: DeviceImageView,
    scratch_base: u32,
}

// ---------------------------------------------------------------------------
// ArenaLayout
// ---------------------------------------------------------------------------

/// Deterministic slot offsets for one source size and octave plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ArenaLayout {
    plan: OctavePlan,
    source: DeviceImageView,
    octaves: Vec<OctaveSlots>,
    total_elements: u64,
}

impl ArenaLayout {
    /// Layout for a `width × height` source. Octave 0 is `2w × 2h` when
    /// upscaling; every further octave halves with rounding up.
    pub fn new(width: u32, height: u32, num_octaves: usize, upscale: bool) -> Self {
        Self::from_plan(OctavePlan::new(width, height, num_octaves, upscale, 0.0))
    }

    pub fn from_plan(plan: OctavePlan) -> Self {
        let (sw, sh) = plan.source_size();
        let mut cursor: u64 = 0;
        let mut take = |len: u64| {
            let at = cursor;
            cursor += len;
            at as u32
        };

        let source_pitch = pitch_for(sw);
        let source = DeviceImageView {
            offset: take(source_pitch as u64 * sh as u64),
            width: sw,
            height: sh,
            pitch: source_pitch,
        };

        let mut octaves = Vec::with_capacity(plan.len());
        for oct in plan.iter() {
            let pitch = pitch_for(oct.width);
            let stride = pitch as u64 * oct.height as u64;
            let image = DeviceImageView {
                offset: take(stride),
                width: oct.width,
                height: oct.height,
                pitch,
            };
            let scratch_base = take(stride * (LEVELS_PER_OCTAVE + DOG_LEVELS) as u64);
            octaves.push(OctaveSlots { image, scratch_base });
        }

        ArenaLayout { plan, source, octaves, total_elements: cursor }
    }

    pub fn plan(&self) -> &OctavePlan {
        &self.plan
    }

    pub fn num_octaves(&self) -> usize {
        self.octaves.len()
    }

    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_elements * 4
    }

    pub fn image(&self, slot: ImageSlot) -> DeviceImageView {
        match slot {
            ImageSlot::Source => self.source,
            ImageSlot::Octave(o) => self.octaves[o].image,
        }
    }

    /// Spacing between consecutive scratch levels of `octave`, in elements.
    pub fn level_stride(&self, octave: usize) -> u32 {
        let img = self.octaves[octave].image;
        img.pitch * img.height
    }

    /// Offset of row-blur level 0 of `octave`.
    pub fn scratch_base(&self, octave: usize) -> u32 {
        self.octaves[octave].scratch_base
    }

    /// Offset of DoG level 0 of `octave`.
    pub fn dog_base(&self, octave: usize) -> u32 {
        self.scratch_base(octave) + LEVELS_PER_OCTAVE as u32 * self.level_stride(octave)
    }

    pub fn row_blur(&self, octave: usize, level: usize) -> DeviceImageView {
        debug_assert!(level < LEVELS_PER_OCTAVE);
        DeviceImageView {
            offset: self.scratch_base(octave) + level as u32 * self.level_stride(octave),
            ..self.octaves[octave].image
        }
    }

    pub fn dog(&self, octave: usize, level: usize) -> DeviceImageView {
        debug_assert!(level < DOG_LEVELS);
        DeviceImageView {
            offset: self.dog_base(octave) + level as u32 * self.level_stride(octave),
            ..self.octaves[octave].image
        }
    }

    /// Source followed by every octave.
    pub fn image_slots(&self) -> impl Iterator<Item = ImageSlot> {
        std::iter::once(ImageSlot::Source).chain((0..self.octaves.len()).map(ImageSlot::Octave))
    }

    /// Index of the texture backing `slot`.
    pub fn texture_index(slot: ImageSlot) -> usize {
        match slot {
            ImageSlot::Source => 0,
            ImageSlot::Octave(o) => o + 1,
        }
    }
}

// ---------------------------------------------------------------------------
// PyramidArena
// ---------------------------------------------------------------------------

struct SlotTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// Device resources of one extractor's pyramid. Dropped as a unit.
pub struct PyramidArena {
    layout: ArenaLayout,
    buffer: wgpu::Buffer,
    textures: Vec<SlotTexture>,
    counters: wgpu::Buffer,
    dispatch_args: wgpu::Buffer,
}

impl PyramidArena {
    /// Allocate the buffer, textures, counters and indirect arguments.
    ///
    /// Sizes are checked against the device limits up front; allocations
    /// run inside wgpu error scopes so a driver out-of-memory is reported
    /// as `ResourceExhausted` instead of a later validation panic.
    pub fn new(gpu: &GpuDevice, layout: ArenaLayout) -> Result<Self> {
        let bytes = layout.total_bytes().max(4);
        let limit = gpu.max_storage_bytes();
        if bytes > limit || layout.total_elements() > u32::MAX as u64 {
            return Err(SiftError::ResourceExhausted { what: "pyramid arena", bytes, limit });
        }

        let buffer = gpu.with_error_scope(|| {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("PyramidArena"),
                size: bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })
        .map_err(|_| SiftError::ResourceExhausted { what: "pyramid arena", bytes, limit })?;

        let max_dim = gpu.limits.max_texture_dimension_2d;
        let mut textures = Vec::with_capacity(layout.num_octaves() + 1);
        for slot in layout.image_slots() {
            let view = layout.image(slot);
            let what = format!("{slot:?} texture ({}x{})", view.width, view.height);
            if view.is_empty() || view.width > max_dim || view.height > max_dim {
                return Err(SiftError::TextureCreation {
                    what,
                    reason: format!("dimensions must be in 1..={max_dim}"),
                });
            }
            let texture = gpu.with_error_scope(|| {
                gpu.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("PyramidArena slot"),
                    size: wgpu::Extent3d {
                        width: view.width,
                        height: view.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu::TextureFormat::R32Float,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_DST
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                })
            })
            .map_err(|reason| SiftError::TextureCreation { what, reason })?;
            let tex_view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            textures.push(SlotTexture { texture, view: tex_view });
        }

        let counters = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("PyramidArena counters"),
            size: (counter_len(layout.num_octaves()) * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let dispatch_args = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("PyramidArena dispatch args"),
            size: DISPATCH_ARGS_BYTES * layout.num_octaves().max(1) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        log::debug!(
            "arena: {} octaves, {:.1} MiB, {} textures",
            layout.num_octaves(),
            bytes as f64 / (1u64 << 20) as f64,
            textures.len()
        );

        Ok(PyramidArena { layout, buffer, textures, counters, dispatch_args })
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn image_view(&self, slot: ImageSlot) -> DeviceImageView {
        self.layout.image(slot)
    }

    pub fn octave_view(&self, octave: usize) -> DeviceImageView {
        self.layout.image(ImageSlot::Octave(octave))
    }

    pub fn scratch_base(&self, octave: usize) -> u32 {
        self.layout.scratch_base(octave)
    }

    pub fn row_blur_view(&self, octave: usize, level: usize) -> DeviceImageView {
        self.layout.row_blur(octave, level)
    }

    pub fn dog_view(&self, octave: usize, level: usize) -> DeviceImageView {
        self.layout.dog(octave, level)
    }

    pub fn texture(&self, slot: ImageSlot) -> &wgpu::Texture {
        &self.textures[ArenaLayout::texture_index(slot)].texture
    }

    pub fn texture_view(&self, slot: ImageSlot) -> &wgpu::TextureView {
        &self.textures[ArenaLayout::texture_index(slot)].view
    }

    pub fn point_counters(&self) -> &wgpu::Buffer {
        &self.counters
    }

    pub fn dispatch_args(&self) -> &wgpu::Buffer {
        &self.dispatch_args
    }

    /// Copy a slot's buffer region into its sampling texture.
    pub fn encode_refresh_texture(&self, encoder: &mut wgpu::CommandEncoder, slot: ImageSlot) {
        let view = self.image_view(slot);
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &self.buffer,
                layout: wgpu::ImageDataLayout {
                    offset: view.byte_offset(),
                    bytes_per_row: Some(view.pitch * 4),
                    rows_per_image: Some(view.height),
                },
            },
            wgpu::ImageCopyTexture {
                texture: self.texture(slot),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d { width: view.width, height: view.height, depth_or_array_layers: 1 },
        );
    }

    /// Zero the point counters. Recorded before the first extremum pass.
    pub fn encode_clear_counters(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.counters, 0, None);
    }

    /// Read any view of the arena back to the host. Synchronous.
    pub fn read_view(&self, stream: &mut Stream, view: DeviceImageView) -> Result<Image<f32>> {
        read_image(stream, &self.buffer, view)
    }

    /// Read the raw counter array. Synchronous.
    pub fn read_counters(&self, stream: &mut Stream) -> Result<Vec<u32>> {
        let len = counter_len(self.layout.num_octaves());
        let bytes = read_buffer(stream, &self.counters, 0, (len * 4) as u64)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::image::PITCH_ALIGN;
    use crate::test_support::run_gpu_test_in_subprocess;
    use std::sync::Arc;

    /// Every slot of the layout as (offset, len) pairs.
    fn all_slots(layout: &ArenaLayout) -> Vec<(u64, u64)> {
        let mut slots = vec![];
        for slot in layout.image_slots() {
            let v = layout.image(slot);
            slots.push((v.offset as u64, v.len()));
        }
        for o in 0..layout.num_octaves() {
            for l in 0..LEVELS_PER_OCTAVE {
                let v = layout.row_blur(o, l);
                slots.push((v.offset as u64, v.len()));
            }
            for l in 0..DOG_LEVELS {
                let v = layout.dog(o, l);
                slots.push((v.offset as u64, v.len()));
            }
        }
        slots
    }

    #[test]
    fn test_layout_ceil_chain() {
        let layout = ArenaLayout::new(101, 75, 4, false);
        let dims: Vec<(u32, u32)> = (0..layout.num_octaves())
            .map(|o| {
                let v = layout.image(ImageSlot::Octave(o));
                (v.width, v.height)
            })
            .collect();
        assert_eq!(dims, vec![(101, 75), (51, 38), (26, 19), (13, 10)]);
        assert_eq!(layout.image(ImageSlot::Source).width, 101);
    }

    #[test]
    fn test_layout_upscale_octave_zero() {
        let layout = ArenaLayout::new(64, 48, 2, true);
        let o0 = layout.image(ImageSlot::Octave(0));
        assert_eq!((o0.width, o0.height), (128, 96));
        let src = layout.image(ImageSlot::Source);
        assert_eq!((src.width, src.height), (64, 48));
    }

    #[test]
    fn test_slots_monotonic_disjoint_aligned() {
        let layout = ArenaLayout::new(640, 480, 5, false);
        let mut slots = all_slots(&layout);
        slots.sort();
        for pair in slots.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
        }
        for (offset, _) in &slots {
            assert_eq!(offset % PITCH_ALIGN as u64, 0, "slot at {offset} not 512-byte aligned");
        }
        let (last_off, last_len) = slots[slots.len() - 1];
        assert_eq!(last_off + last_len, layout.total_elements());
    }

    #[test]
    fn test_scratch_levels_evenly_spaced() {
        let layout = ArenaLayout::new(300, 200, 3, false);
        for o in 0..3 {
            let stride = layout.level_stride(o);
            assert_eq!(layout.row_blur(o, 0).offset, layout.scratch_base(o));
            assert_eq!(layout.row_blur(o, 3).offset, layout.scratch_base(o) + 3 * stride);
            assert_eq!(layout.dog(o, 0).offset, layout.row_blur(o, 7).offset + stride);
            assert_eq!(layout.dog_base(o), layout.dog(o, 0).offset);
        }
    }

    #[test]
    fn test_layout_is_deterministic() {
        assert_eq!(ArenaLayout::new(333, 222, 4, true), ArenaLayout::new(333, 222, 4, true));
    }

    #[test]
    fn test_tiny_source_has_no_octaves() {
        let layout = ArenaLayout::new(4, 4, 5, false);
        assert_eq!(layout.num_octaves(), 0);
        assert_eq!(layout.image_slots().count(), 1);
        assert!(layout.total_elements() > 0);
    }

    // ---- GPU integration tests -------------------------------------------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_arena_allocation() {
        let gpu = Arc::new(GpuDevice::new().expect("need a GPU"));
        let mut stream = Stream::new(gpu.clone(), "test");
        let arena = PyramidArena::new(&gpu, ArenaLayout::new(640, 480, 5, false)).unwrap();
        assert_eq!(arena.texture(ImageSlot::Octave(2)).width(), 160);
        let counters = arena.read_counters(&mut stream).unwrap();
        assert_eq!(counters.len(), 11);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_arena_too_large() {
        let gpu = GpuDevice::new_with_profile(crate::gpu::device::DeviceProfile::Embedded)
            .expect("need a GPU");
        let err = PyramidArena::new(&gpu, ArenaLayout::new(4000, 4000, 5, true)).err();
        assert!(matches!(err, Some(SiftError::ResourceExhausted { .. })), "{err:?}");
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_arena_allocation() {
        let out = run_gpu_test_in_subprocess("gpu::arena::tests::inner_arena_allocation");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_arena_too_large() {
        let out = run_gpu_test_in_subprocess("gpu::arena::tests::inner_arena_too_large");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
