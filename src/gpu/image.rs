// gpu/image.rs — device-resident f32 images and host transfer helpers.
//
// RESPONSIBILITIES
// ─────────────────
// 1. `DeviceImageView`: a non-owning, `Copy` description of a pitched
//    image inside some storage buffer: element offset, width, height and
//    pitch. Every arena slot is handed out as one of these.
//
// 2. `DeviceImage`: an image that owns its buffer. Used as a device-side
//    input to the extractor and as scratch in tests.
//
// 3. Upload / readback: pack a host `Image<f32>` into pitched rows and
//    write it at a view's offset; copy a view back and strip the padding.
//
//
// PITCH ALIGNMENT
// ───────────────
// Pitches are rounded up to `PITCH_ALIGN` = 128 floats (512 bytes). 512 is
// a multiple of wgpu's 256-byte `COPY_BYTES_PER_ROW_ALIGNMENT`, so any view
// can be copied into a texture with a single `copy_buffer_to_texture`, and
// every row starts on a cache-line boundary.
//
//   buffer (pitch = 128, width = 100):
//     offset ─► [ row 0: 100 px | 28 pad ][ row 1: 100 px | 28 pad ] ...

use crate::error::{Result, SiftError};
use crate::gpu::device::GpuDevice;
use crate::gpu::stream::Stream;
use crate::image::Image;

/// Row pitch alignment in f32 elements.
pub const PITCH_ALIGN: u32 = 128;

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Round `value` up to the next multiple of `alignment`.
///
///   align_to(100, 256) = 256
///   align_to(256, 256) = 256
///   align_to(257, 256) = 512
#[inline]
pub fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Pitch (in elements) used for an image of the given width.
#[inline]
pub fn pitch_for(width: u32) -> u32 {
    align_to(width.max(1), PITCH_ALIGN)
}

// ---------------------------------------------------------------------------
// DeviceImageView
// ---------------------------------------------------------------------------

/// Non-owning view of a pitched f32 image in a storage buffer.
///
/// Data is valid for elements `[offset, offset + pitch * height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceImageView {
    /// Offset of pixel (0, 0) in f32 elements.
    pub offset: u32,
    pub width: u32,
    pub height: u32,
    /// Row pitch in f32 elements; `pitch >= width`.
    pub pitch: u32,
}

impl DeviceImageView {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of elements covered, padding included.
    pub fn len(&self) -> u64 {
        self.pitch as u64 * self.height as u64
    }

    pub fn byte_offset(&self) -> u64 {
        self.offset as u64 * F32_BYTES
    }

    pub fn byte_len(&self) -> u64 {
        self.len() * F32_BYTES
    }

    pub fn same_size(&self, other: &DeviceImageView) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// A view with this view's storage but another logical size.
    ///
    /// Used to run a smaller image through a scratch slot.
    pub fn resized(&self, width: u32, height: u32) -> DeviceImageView {
        debug_assert!(width <= self.pitch && height as u64 * self.pitch as u64 <= self.len());
        DeviceImageView { width, height, ..*self }
    }

    /// Uniform form consumed by the WGSL kernels.
    pub fn desc(&self) -> ImageDesc {
        ImageDesc {
            offset: self.offset,
            width: self.width,
            height: self.height,
            pitch: self.pitch,
        }
    }
}

/// Layout must match `ImageDesc` in common.wgsl (16 bytes).
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ImageDesc {
    pub offset: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

// ---------------------------------------------------------------------------
// DeviceImage
// ---------------------------------------------------------------------------

/// A pitched f32 image that owns its storage buffer.
pub struct DeviceImage {
    buffer: wgpu::Buffer,
    view: DeviceImageView,
}

impl DeviceImage {
    /// Allocate a zero-filled image.
    pub fn new(gpu: &GpuDevice, width: u32, height: u32) -> Result<Self> {
        let view = DeviceImageView { offset: 0, width, height, pitch: pitch_for(width) };
        let bytes = view.byte_len().max(F32_BYTES);
        if bytes > gpu.max_storage_bytes() {
            return Err(SiftError::ResourceExhausted {
                what: "device image",
                bytes,
                limit: gpu.max_storage_bytes(),
            });
        }
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("DeviceImage"),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(DeviceImage { buffer, view })
    }

    /// Allocate and fill from a host image.
    pub fn upload(gpu: &GpuDevice, src: &Image<f32>) -> Result<Self> {
        let img = Self::new(gpu, src.width() as u32, src.height() as u32)?;
        write_image(gpu, &img.buffer, img.view, src);
        Ok(img)
    }

    pub fn view(&self) -> DeviceImageView {
        self.view
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn readback(&self, stream: &mut Stream) -> Result<Image<f32>> {
        read_image(stream, &self.buffer, self.view)
    }
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

/// Pack `src` into pitched rows and queue a write at `dst`'s offset.
///
/// The write lands before the next submission on the queue. Only
/// `min(src, dst)` pixels per axis are written.
pub fn write_image(gpu: &GpuDevice, buffer: &wgpu::Buffer, dst: DeviceImageView, src: &Image<f32>) {
    let w = (src.width() as u32).min(dst.width) as usize;
    let h = (src.height() as u32).min(dst.height) as usize;
    if w == 0 || h == 0 {
        return;
    }
    let pitch = dst.pitch as usize;
    let mut staging = vec![0.0f32; pitch * h];
    for y in 0..h {
        staging[y * pitch..y * pitch + w].copy_from_slice(&src.row(y)[..w]);
    }
    gpu.queue.write_buffer(buffer, dst.byte_offset(), bytemuck::cast_slice(&staging));
}

/// Copy `src` (in `src_buffer`) into `dst` (in `dst_buffer`) row by row.
///
/// A single copy when the pitches match.
pub fn encode_copy_image(
    encoder: &mut wgpu::CommandEncoder,
    src_buffer: &wgpu::Buffer,
    src: DeviceImageView,
    dst_buffer: &wgpu::Buffer,
    dst: DeviceImageView,
) {
    let w = src.width.min(dst.width) as u64;
    let h = src.height.min(dst.height);
    if w == 0 || h == 0 {
        return;
    }
    if src.pitch == dst.pitch {
        let bytes = src.pitch as u64 * h as u64 * F32_BYTES;
        encoder.copy_buffer_to_buffer(src_buffer, src.byte_offset(), dst_buffer, dst.byte_offset(), bytes);
        return;
    }
    for y in 0..h as u64 {
        encoder.copy_buffer_to_buffer(
            src_buffer,
            src.byte_offset() + y * src.pitch as u64 * F32_BYTES,
            dst_buffer,
            dst.byte_offset() + y * dst.pitch as u64 * F32_BYTES,
            w * F32_BYTES,
        );
    }
}

/// Read `size` bytes at `offset` of `src` back to host memory.
///
/// **Synchronous**: submits a copy on `stream` and waits for it. `offset`
/// and `size` must be multiples of 4.
pub fn read_buffer(stream: &mut Stream, src: &wgpu::Buffer, offset: u64, size: u64) -> Result<Vec<u8>> {
    if size == 0 {
        return Ok(Vec::new());
    }
    let gpu = stream.gpu().clone();
    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = stream.encoder("readback");
    encoder.copy_buffer_to_buffer(src, offset, &staging, 0, size);
    stream.submit(encoder);

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    stream.synchronize();
    let result = match rx.try_recv() {
        Ok(r) => r,
        Err(_) => {
            let _ = gpu.device.poll(wgpu::Maintain::Wait);
            rx.recv().map_err(|_| SiftError::ReadbackLost)?
        }
    };
    result?;

    let bytes = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(bytes)
}

/// Read a pitched view back into a tightly packed host image.
pub fn read_image(stream: &mut Stream, buffer: &wgpu::Buffer, view: DeviceImageView) -> Result<Image<f32>> {
    if view.is_empty() {
        return Ok(Image::new(view.width as usize, view.height as usize));
    }
    let bytes = read_buffer(stream, buffer, view.byte_offset(), view.byte_len())?;
    let floats: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let (w, pitch) = (view.width as usize, view.pitch as usize);
    let mut out = Vec::with_capacity(w * view.height as usize);
    for row in floats.chunks_exact(pitch) {
        out.extend_from_slice(&row[..w]);
    }
    Ok(Image::from_vec(w, view.height as usize, out))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::run_gpu_test_in_subprocess;
    use std::sync::Arc;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(100, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(0, 256), 0);
    }

    #[test]
    fn test_pitch_is_copy_aligned() {
        for w in [1u32, 100, 128, 129, 752, 1920] {
            let p = pitch_for(w);
            assert!(p >= w);
            assert_eq!((p * 4) % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT, 0, "width {w}");
        }
    }

    #[test]
    fn test_view_geometry() {
        let v = DeviceImageView { offset: 256, width: 100, height: 3, pitch: 128 };
        assert_eq!(v.len(), 384);
        assert_eq!(v.byte_offset(), 1024);
        assert_eq!(v.byte_len(), 1536);
        let r = v.resized(50, 2);
        assert_eq!((r.offset, r.pitch), (256, 128));
        assert!(!r.same_size(&v));
        assert!(DeviceImageView::default().is_empty());
    }

    #[test]
    fn test_image_desc_layout() {
        assert_eq!(std::mem::size_of::<ImageDesc>(), 16);
    }

    // ---- GPU integration tests -------------------------------------------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_device_image_round_trip() {
        let gpu = Arc::new(GpuDevice::new().expect("need a GPU"));
        let mut stream = Stream::new(gpu.clone(), "test");
        let src = Image::from_fn(131, 7, |x, y| (x * 3 + y * 1000) as f32 * 0.5);
        let dev = DeviceImage::upload(&gpu, &src).unwrap();
        assert_eq!(dev.view().pitch, 256);
        let back = dev.readback(&mut stream).unwrap();
        assert_eq!(back, src);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_device_image_round_trip() {
        let out = run_gpu_test_in_subprocess("gpu::image::tests::inner_device_image_round_trip");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
