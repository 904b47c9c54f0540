// gpu/extrema.rs — extremum detection and per-octave slice bookkeeping.
//
// Per octave the extractor records, in order:
//   open_octave   counters[2o]     ← min(total, max_points)
//   find_extrema  appends keypoints through the bounded raw total
//   close_octave  counters[2o + 1] ← min(total, max_points),
//                 indirect args    ← ceil(slice_len / WG_SIZE), 1, 1
//
// All three share one bind group and one parameter block, so opening and
// closing costs two single-thread dispatches and no host round trip.

use crate::counters::BoundedAppend;
use crate::gpu::image::ImageDesc;
use crate::gpu::kernels::StageContext;
use crate::gpu::keypoints::KeypointBuffer;
use crate::scale_space::NUM_SCALES;

/// Detection thresholds for one extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Minimum |DoG| of a candidate.
    pub threshold: f32,
    /// Upper bound on tr²/det of the spatial Hessian.
    pub edge_bound: f32,
    /// Minimum keypoint scale in original-image pixels.
    pub min_scale: f32,
    /// Keypoint-buffer capacity.
    pub max_points: u32,
}

/// Layout must match `ExtremaParams` in extrema.wgsl (48 bytes).
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct ExtremaParams {
    pub dog: ImageDesc,
    pub level_stride: u32,
    pub octave: u32,
    pub max_points: u32,
    pub num_octaves: u32,
    pub threshold: f32,
    pub edge_bound: f32,
    pub min_scale: f32,
    pub subsampling: f32,
}

/// Record open, detect and close for `octave`.
///
/// Does nothing (with a warning) for an octave outside the arena. The
/// counters must have been cleared earlier in the same extraction.
pub fn detect_octave(
    ctx: &mut StageContext<'_>,
    octave: usize,
    keypoints: &KeypointBuffer,
    detection: &DetectionParams,
) {
    let layout = ctx.arena.layout();
    if octave >= layout.num_octaves() {
        log::warn!("detect_octave: octave {octave} outside the arena, skipped");
        return;
    }
    let dog = layout.dog(octave, 0);
    let params = ExtremaParams {
        dog: dog.desc(),
        level_stride: layout.level_stride(octave),
        octave: octave as u32,
        max_points: detection.max_points.min(keypoints.capacity()),
        num_octaves: layout.num_octaves() as u32,
        threshold: detection.threshold,
        edge_bound: detection.edge_bound,
        min_scale: detection.min_scale,
        subsampling: layout.plan().octave(octave).subsampling,
    };
    let params_buf = ctx.uniform("extrema params", &params);
    let bind_group = ctx.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("extrema BG"),
        layout: &ctx.kernels.extrema_bgl,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: ctx.arena.buffer().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: params_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: ctx.arena.point_counters().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: keypoints.buffer().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 4, resource: ctx.arena.dispatch_args().as_entire_binding() },
        ],
    });

    let kernels = ctx.kernels;
    let (dx, dy) = ctx.gpu.dispatch_size(dog.width, dog.height);
    ctx.dispatch("open_octave", &kernels.open_octave, &bind_group, (1, 1, 1));
    if !dog.is_empty() {
        ctx.dispatch("find_extrema", &kernels.find_extrema, &bind_group, (dx, dy, NUM_SCALES as u32));
    }
    ctx.dispatch("close_octave", &kernels.close_octave, &bind_group, (1, 1, 1));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::PointCounters;
    use crate::gpu::arena::{ArenaLayout, PyramidArena};
    use crate::gpu::device::GpuDevice;
    use crate::gpu::image::write_image;
    use crate::gpu::kernels::SiftKernels;
    use crate::gpu::stream::Stream;
    use crate::image::Image;
    use crate::test_support::run_gpu_test_in_subprocess;
    use std::sync::Arc;

    #[test]
    fn test_extrema_params_layout() {
        assert_eq!(std::mem::size_of::<ExtremaParams>(), 48);
    }

    /// Write a hand-made DoG stack with isolated peaks at level 2.
    fn plant_peaks(gpu: &GpuDevice, arena: &PyramidArena, peaks: &[(usize, usize)]) {
        let layout = arena.layout();
        for s in 0..crate::scale_space::DOG_LEVELS {
            let view = layout.dog(0, s);
            let mut img = Image::<f32>::new(view.width as usize, view.height as usize);
            if s == 2 {
                for &(x, y) in peaks {
                    img.set(x, y, 40.0);
                    for (dx, dy) in [(-1i32, 0i32), (1, 0), (0, -1), (0, 1)] {
                        img.set((x as i32 + dx) as usize, (y as i32 + dy) as usize, 20.0);
                    }
                }
            } else if s == 1 || s == 3 {
                for &(x, y) in peaks {
                    img.set(x, y, 20.0);
                }
            }
            write_image(gpu, arena.buffer(), view, &img);
        }
    }

    fn run(capacity: u32, peaks: &[(usize, usize)]) -> (PointCounters, Vec<crate::keypoint::Keypoint>) {
        let gpu = Arc::new(GpuDevice::new().expect("need a GPU"));
        let kernels = SiftKernels::new(&gpu).unwrap();
        let mut stream = Stream::new(gpu.clone(), "test");
        let arena = PyramidArena::new(&gpu, ArenaLayout::new(64, 64, 1, false)).unwrap();
        let mut kps = KeypointBuffer::new(&gpu, capacity).unwrap();
        plant_peaks(&gpu, &arena, peaks);

        let detection = DetectionParams { threshold: 1.0, edge_bound: 12.1, min_scale: 0.0, max_points: capacity };
        let mut encoder = stream.encoder("test");
        arena.encode_clear_counters(&mut encoder);
        {
            let mut ctx = StageContext { gpu: &gpu, kernels: &kernels, arena: &arena, encoder: &mut encoder };
            detect_octave(&mut ctx, 0, &kps, &detection);
        }
        stream.submit(encoder);

        let counters = PointCounters::new(arena.read_counters(&mut stream).unwrap(), capacity).unwrap();
        kps.sync_to_host(&mut stream, counters.count()).unwrap();
        (counters, kps.host().to_vec())
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_detects_planted_peaks() {
        let (counters, kps) = run(16, &[(10, 12), (40, 30)]);
        assert_eq!(counters.raw_total(), 2);
        assert_eq!(counters.octave_slice(0).len(), 2);
        let mut xy: Vec<(f32, f32)> = kps.iter().map(|k| (k.x.round(), k.y.round())).collect();
        xy.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(xy, vec![(10.0, 12.0), (40.0, 30.0)]);
        for kp in &kps {
            assert_eq!(kp.octave, 0);
            assert!(kp.contrast > 0.0);
            assert!(!kp.is_matched());
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_capacity_bounds_appends() {
        let peaks: Vec<(usize, usize)> = (0..5).map(|i| (6 + 10 * i, 20)).collect();
        let (counters, kps) = run(2, &peaks);
        assert_eq!(counters.raw_total(), 5);
        assert_eq!(counters.count(), 2);
        assert_eq!(counters.dropped(), 3);
        assert_eq!(counters.octave_slice(0).range(), 0..2);
        assert_eq!(kps.len(), 2);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_detects_planted_peaks() {
        let out = run_gpu_test_in_subprocess("gpu::extrema::tests::inner_detects_planted_peaks");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_capacity_bounds_appends() {
        let out = run_gpu_test_in_subprocess("gpu::extrema::tests::inner_capacity_bounds_appends");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
