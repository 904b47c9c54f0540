// gpu/dog.rs — blurred levels and difference-of-Gaussian stack.
//
// For one octave:
//   1. blur_rows:      row pass of the octave image into the 8 row-blur
//                      scratch levels (one dispatch, z = level)
//   2. blur_cols_diff: column pass of adjacent levels, storing
//                      blur[s+1] - blur[s] into DoG level s (z = s)
//
// Every level is blurred directly from the octave image with the
// incremental sigma from the Laplace table, so no level depends on another
// and both passes are single dispatches.

use crate::gpu::image::ImageDesc;
use crate::gpu::kernels::StageContext;
use crate::scale_space::{laplace_kernels, OctavePlan, DOG_LEVELS, LEVELS_PER_OCTAVE};

/// Layout must match `DogParams` in dog.wgsl (32 bytes).
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct DogParams {
    pub image: ImageDesc,
    pub rows_base: u32,
    pub dog_base: u32,
    pub level_stride: u32,
    pub octave: u32,
}

/// Per-octave, per-level blur coefficients resident on the device.
///
/// Built once per octave plan; the extractor rebuilds it only when the plan
/// changes.
pub struct LaplaceTable {
    plan: OctavePlan,
    buffer: wgpu::Buffer,
}

impl LaplaceTable {
    pub fn new(device: &wgpu::Device, plan: &OctavePlan) -> Self {
        use wgpu::util::DeviceExt;
        let table = laplace_kernels(plan);
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Laplace table"),
            contents: bytemuck::cast_slice(&table),
            usage: wgpu::BufferUsages::STORAGE,
        });
        LaplaceTable { plan: plan.clone(), buffer }
    }

    pub fn plan(&self) -> &OctavePlan {
        &self.plan
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

/// Record the level blur and DoG passes for `octave`.
pub fn compute_difference_stack(ctx: &mut StageContext<'_>, octave: usize, table: &LaplaceTable) {
    if octave >= ctx.arena.layout().num_octaves() || octave >= table.plan().len() {
        log::warn!("compute_difference_stack: octave {octave} outside the plan, skipped");
        return;
    }
    let image = ctx.arena.octave_view(octave);
    if image.is_empty() {
        log::warn!("compute_difference_stack: octave {octave} is empty, skipped");
        return;
    }

    let params = DogParams {
        image: image.desc(),
        rows_base: ctx.arena.scratch_base(octave),
        dog_base: ctx.arena.layout().dog_base(octave),
        level_stride: ctx.arena.layout().level_stride(octave),
        octave: octave as u32,
    };
    let params_buf = ctx.uniform("dog params", &params);
    let bind_group = ctx.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("dog BG"),
        layout: &ctx.kernels.dog_bgl,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: ctx.arena.buffer().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: params_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: table.buffer().as_entire_binding() },
        ],
    });

    let (dx, dy) = ctx.gpu.dispatch_size(image.width, image.height);
    let kernels = ctx.kernels;
    ctx.dispatch("blur_rows", &kernels.blur_rows, &bind_group, (dx, dy, LEVELS_PER_OCTAVE as u32));
    ctx.dispatch("blur_cols_diff", &kernels.blur_cols_diff, &bind_group, (dx, dy, DOG_LEVELS as u32));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
