// gpu/scale_space.rs — pyramid construction stage.
//
//   downsample(dst, src, variance)  5-tap Gaussian, keep every second pixel
//   upsample(dst, src_texture)      bilinear 2x from the source texture
//   low_pass(dst, src, temp, sigma) separable blur, rows → temp, cols → dst
//
// All three record into the caller's encoder and never submit. A call with
// an empty view or a destination of the wrong size logs a warning and
// records nothing; the pipeline keeps going with whatever the slot holds.
//
// COEFFICIENT CACHE
// ─────────────────
// Kernel coefficients live in small uniform buffers. Each `CoeffCache`
// remembers the key (sigma or variance bits) of the buffer it holds and
// rebuilds it only when a call asks for a different value. The cache is
// owned by one extractor, so two extractors with different settings never
// see each other's coefficients.

use crate::gpu::arena::ImageSlot;
use crate::gpu::image::{DeviceImageView, ImageDesc};
use crate::gpu::kernels::StageContext;
use crate::scale_space::{half_kernel, half_dim, DOWNSAMPLE_R, LOWPASS_R, MIN_LOWPASS_SIGMA};

/// Layout must match `ImagePair` in scale_space.wgsl (32 bytes).
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct ImagePair {
    pub src: ImageDesc,
    pub dst: ImageDesc,
}

/// Layout must match `Coeffs` in scale_space.wgsl:
///   offset  0: radius (u32)
///   offset  4: _pad   (3 × u32)
///   offset 16: taps   (2 × vec4<f32>)
///   total: 48 bytes
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct Coeffs {
    pub radius: u32,
    pub _pad: [u32; 3],
    pub taps: [[f32; 4]; 2],
}

impl Coeffs {
    /// Half-taps of a Gaussian with the given variance.
    pub fn gaussian(variance: f32, radius: usize) -> Self {
        assert!(radius < 8, "radius {radius} does not fit the coefficient uniform");
        let mut taps = [[0.0f32; 4]; 2];
        for (i, t) in half_kernel(variance, radius).into_iter().enumerate() {
            taps[i / 4][i % 4] = t;
        }
        Coeffs { radius: radius as u32, _pad: [0; 3], taps }
    }
}

/// A single-entry cache of one coefficient uniform, keyed by value.
#[derive(Default)]
pub struct CoeffCache {
    entry: Option<(u32, wgpu::Buffer)>,
}

impl CoeffCache {
    fn get(&mut self, ctx: &StageContext<'_>, label: &str, key: f32, build: impl FnOnce() -> Coeffs) -> &wgpu::Buffer {
        let bits = key.to_bits();
        let stale = !matches!(&self.entry, Some((k, _)) if *k == bits);
        if stale {
            log::debug!("{label}: uploading coefficients for {key}");
            let buffer = ctx.uniform(label, &build());
            self.entry = Some((bits, buffer));
        }
        match &self.entry {
            Some((_, buffer)) => buffer,
            None => unreachable!("entry populated above"),
        }
    }

    /// Key of the cached buffer, if any.
    pub fn key(&self) -> Option<f32> {
        self.entry.as_ref().map(|(k, _)| f32::from_bits(*k))
    }
}

/// Pyramid construction with per-instance coefficient caches.
#[derive(Default)]
pub struct ScaleSpaceBuilder {
    lowpass: CoeffCache,
    downsample: CoeffCache,
}

impl ScaleSpaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lowpass_cache(&self) -> &CoeffCache {
        &self.lowpass
    }

    pub fn downsample_cache(&self) -> &CoeffCache {
        &self.downsample
    }

    /// Blur `src` with a 5-tap Gaussian of `variance` and keep every
    /// second pixel. `dst` must be `ceil(src / 2)` in both axes.
    pub fn downsample(
        &mut self,
        ctx: &mut StageContext<'_>,
        dst: DeviceImageView,
        src: DeviceImageView,
        variance: f32,
    ) {
        if src.is_empty() || dst.is_empty() {
            log::warn!("downsample: empty view (src {src:?}, dst {dst:?}), skipped");
            return;
        }
        if dst.width != half_dim(src.width) || dst.height != half_dim(src.height) {
            log::warn!(
                "downsample: dst {}x{} is not half of src {}x{}, skipped",
                dst.width, dst.height, src.width, src.height
            );
            return;
        }
        let coeffs = self
            .downsample
            .get(ctx, "downsample coeffs", variance, || Coeffs::gaussian(variance, DOWNSAMPLE_R));
        let pair = ctx.uniform("downsample pair", &ImagePair { src: src.desc(), dst: dst.desc() });
        let bind_group = filter_bind_group(ctx, &pair, coeffs);
        let (dx, dy) = ctx.gpu.dispatch_size(dst.width, dst.height);
        let kernels = ctx.kernels;
        ctx.dispatch("downsample", &kernels.downsample, &bind_group, (dx, dy, 1));
    }

    /// Bilinear 2x upsample of the source slot texture into `dst`.
    pub fn upsample(&mut self, ctx: &mut StageContext<'_>, dst: DeviceImageView, src: ImageSlot) {
        let src_view = ctx.arena.image_view(src);
        if src_view.is_empty() || dst.is_empty() {
            log::warn!("upsample: empty view (src {src_view:?}, dst {dst:?}), skipped");
            return;
        }
        if dst.width != src_view.width * 2 || dst.height != src_view.height * 2 {
            log::warn!(
                "upsample: dst {}x{} is not twice src {}x{}, skipped",
                dst.width, dst.height, src_view.width, src_view.height
            );
            return;
        }
        let pair = ctx.uniform("upsample pair", &ImagePair { src: src_view.desc(), dst: dst.desc() });
        let bind_group = ctx.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("upsample BG"),
            layout: &ctx.kernels.upsample_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: ctx.arena.buffer().as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: pair.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(ctx.arena.texture_view(src)),
                },
            ],
        });
        let (dx, dy) = ctx.gpu.dispatch_size(dst.width, dst.height);
        let kernels = ctx.kernels;
        ctx.dispatch("upsample", &kernels.upsample, &bind_group, (dx, dy, 1));
    }

    /// Separable Gaussian blur of radius `LOWPASS_R`.
    ///
    /// Rows go to `temp`, columns from `temp` to `dst`, so `dst == src` is
    /// allowed. `temp` must hold `src.height` rows of at least `src.width`
    /// pixels at its own pitch.
    pub fn low_pass(
        &mut self,
        ctx: &mut StageContext<'_>,
        dst: DeviceImageView,
        src: DeviceImageView,
        temp: DeviceImageView,
        sigma: f32,
    ) {
        if src.is_empty() || dst.is_empty() || temp.is_empty() {
            log::warn!("low_pass: empty view (src {src:?}, dst {dst:?}), skipped");
            return;
        }
        if !dst.same_size(&src) || temp.pitch < src.width || temp.len() < temp.pitch as u64 * src.height as u64 {
            log::warn!(
                "low_pass: size mismatch (src {}x{}, dst {}x{}, temp {}x{}), skipped",
                src.width, src.height, dst.width, dst.height, temp.width, temp.height
            );
            return;
        }
        let sigma = sigma.max(MIN_LOWPASS_SIGMA);
        let coeffs = self
            .lowpass
            .get(ctx, "low_pass coeffs", sigma, || Coeffs::gaussian(sigma * sigma, LOWPASS_R));
        let temp = temp.resized(src.width, src.height);
        let kernels = ctx.kernels;
        let (dx, dy) = ctx.gpu.dispatch_size(src.width, src.height);

        let rows = ctx.uniform("low_pass rows", &ImagePair { src: src.desc(), dst: temp.desc() });
        let bind_group = filter_bind_group(ctx, &rows, coeffs);
        ctx.dispatch("lowpass_rows", &kernels.lowpass_rows, &bind_group, (dx, dy, 1));

        let cols = ctx.uniform("low_pass cols", &ImagePair { src: temp.desc(), dst: dst.desc() });
        let bind_group = filter_bind_group(ctx, &cols, coeffs);
        ctx.dispatch("lowpass_cols", &kernels.lowpass_cols, &bind_group, (dx, dy, 1));
    }
}

fn filter_bind_group(ctx: &StageContext<'_>, pair: &wgpu::Buffer, coeffs: &wgpu::Buffer) -> wgpu::BindGroup {
    ctx.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("filter BG"),
        layout: &ctx.kernels.filter_bgl,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: ctx.arena.buffer().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: pair.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: coeffs.as_entire_binding() },
        ],
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::arena::{ArenaLayout, PyramidArena};
    use crate::gpu::device::GpuDevice;
    use crate::gpu::kernels::SiftKernels;
    use crate::gpu::stream::Stream;
    use crate::image::Image;
    use crate::scale_space::DOWNSAMPLE_VARIANCE;
    use crate::test_support::{noise, run_gpu_test_in_subprocess};
    use std::sync::Arc;

    #[test]
    fn test_uniform_layouts() {
        assert_eq!(std::mem::size_of::<ImagePair>(), 32);
        assert_eq!(std::mem::size_of::<Coeffs>(), 48);
    }

    #[test]
    fn test_coeffs_pack_half_taps() {
        let c = Coeffs::gaussian(DOWNSAMPLE_VARIANCE, DOWNSAMPLE_R);
        assert_eq!(c.radius, 2);
        let sum = c.taps[0][0] + 2.0 * (c.taps[0][1] + c.taps[0][2]);
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(c.taps[0][3], 0.0);
        assert_eq!(c.taps[1], [0.0; 4]);

        let lp = Coeffs::gaussian(1.0, LOWPASS_R);
        assert!(lp.taps[1][0] > 0.0, "tap 4 of the low-pass must be populated");
    }

    // ---- GPU integration tests -------------------------------------------

    /// Host reference for `downsample`: clamped 5×5 Gaussian at (2x, 2y).
    fn reference_downsample(src: &Image<f32>, variance: f32) -> Image<f32> {
        let k = half_kernel(variance, DOWNSAMPLE_R);
        let (w, h) = (src.width() as i32, src.height() as i32);
        Image::from_fn(half_dim(w as u32) as usize, half_dim(h as u32) as usize, |x, y| {
            let mut acc = 0.0;
            for dy in -2i32..=2 {
                for dx in -2i32..=2 {
                    let sx = (2 * x as i32 + dx).clamp(0, w - 1) as usize;
                    let sy = (2 * y as i32 + dy).clamp(0, h - 1) as usize;
                    acc += k[dx.unsigned_abs() as usize] * k[dy.unsigned_abs() as usize] * src.get(sx, sy);
                }
            }
            acc
        })
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_downsample_matches_reference() {
        let gpu = Arc::new(GpuDevice::new().expect("need a GPU"));
        let kernels = SiftKernels::new(&gpu).unwrap();
        let mut stream = Stream::new(gpu.clone(), "test");
        let arena = PyramidArena::new(&gpu, ArenaLayout::new(101, 75, 2, false)).unwrap();
        let src = noise(101, 75, 7);
        crate::gpu::image::write_image(&gpu, arena.buffer(), arena.octave_view(0), &src);

        let mut builder = ScaleSpaceBuilder::new();
        let mut encoder = stream.encoder("test");
        {
            let mut ctx = StageContext { gpu: &gpu, kernels: &kernels, arena: &arena, encoder: &mut encoder };
            builder.downsample(&mut ctx, arena.octave_view(1), arena.octave_view(0), DOWNSAMPLE_VARIANCE);
        }
        stream.submit(encoder);

        let got = arena.read_view(&mut stream, arena.octave_view(1)).unwrap();
        let want = reference_downsample(&src, DOWNSAMPLE_VARIANCE);
        assert_eq!((got.width(), got.height()), (51, 38));
        for y in 0..38 {
            for x in 0..51 {
                let d = (got.get(x, y) - want.get(x, y)).abs();
                assert!(d < 1e-2, "({x}, {y}): gpu {} host {}", got.get(x, y), want.get(x, y));
            }
        }
        assert_eq!(builder.downsample_cache().key(), Some(DOWNSAMPLE_VARIANCE));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_low_pass_preserves_constant() {
        let gpu = Arc::new(GpuDevice::new().expect("need a GPU"));
        let kernels = SiftKernels::new(&gpu).unwrap();
        let mut stream = Stream::new(gpu.clone(), "test");
        let arena = PyramidArena::new(&gpu, ArenaLayout::new(64, 40, 1, false)).unwrap();
        let src = Image::from_vec(64, 40, vec![128.0f32; 64 * 40]);
        crate::gpu::image::write_image(&gpu, arena.buffer(), arena.image_view(ImageSlot::Source), &src);

        let mut builder = ScaleSpaceBuilder::new();
        let mut encoder = stream.encoder("test");
        {
            let mut ctx = StageContext { gpu: &gpu, kernels: &kernels, arena: &arena, encoder: &mut encoder };
            let src_view = ctx.arena.image_view(ImageSlot::Source);
            let dst = ctx.arena.octave_view(0);
            let temp = ctx.arena.row_blur_view(0, 0);
            builder.low_pass(&mut ctx, dst, src_view, temp, 1.0);
            // In place on the same slot.
            builder.low_pass(&mut ctx, dst, dst, temp, 1.0);
        }
        stream.submit(encoder);

        let got = arena.read_view(&mut stream, arena.octave_view(0)).unwrap();
        assert!(got.as_slice().iter().all(|&v| (v - 128.0).abs() < 1e-3));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_upsample_interpolates() {
        let gpu = Arc::new(GpuDevice::new().expect("need a GPU"));
        let kernels = SiftKernels::new(&gpu).unwrap();
        let mut stream = Stream::new(gpu.clone(), "test");
        let arena = PyramidArena::new(&gpu, ArenaLayout::new(16, 16, 1, true)).unwrap();
        let src = Image::from_fn(16, 16, |x, _| x as f32 * 10.0);
        crate::gpu::image::write_image(&gpu, arena.buffer(), arena.image_view(ImageSlot::Source), &src);

        let mut builder = ScaleSpaceBuilder::new();
        let mut encoder = stream.encoder("test");
        arena.encode_refresh_texture(&mut encoder, ImageSlot::Source);
        {
            let mut ctx = StageContext { gpu: &gpu, kernels: &kernels, arena: &arena, encoder: &mut encoder };
            let dst = ctx.arena.octave_view(0);
            builder.upsample(&mut ctx, dst, ImageSlot::Source);
        }
        stream.submit(encoder);

        let got = arena.read_view(&mut stream, arena.octave_view(0)).unwrap();
        assert_eq!(got.width(), 32);
        // dst x ↔ src x/2: even pixels copy, odd pixels average neighbours.
        assert!((got.get(4, 3) - 20.0).abs() < 1e-4);
        assert!((got.get(5, 3) - 25.0).abs() < 1e-4);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_downsample_matches_reference() {
        let out = run_gpu_test_in_subprocess("gpu::scale_space::tests::inner_downsample_matches_reference");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_low_pass_preserves_constant() {
        let out = run_gpu_test_in_subprocess("gpu::scale_space::tests::inner_low_pass_preserves_constant");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_upsample_interpolates() {
        let out = run_gpu_test_in_subprocess("gpu::scale_space::tests::inner_upsample_interpolates");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
