// gpu/descriptor.rs — orientation and descriptor of each octave's keypoints.
//
// Both kernels run one thread per keypoint of the octave's slice
// [counters[2o], counters[2o+1]). The slice length is only known on the
// device, so both passes are dispatched indirectly from the arguments that
// close_octave wrote; the host never reads the counters mid-extraction.
//
// Gradients are sampled from the octave's texture, which the extractor
// refreshes from the arena after the pyramid is built.

use crate::gpu::arena::{ImageSlot, DISPATCH_ARGS_BYTES};
use crate::gpu::device::GpuDevice;
use crate::gpu::kernels::StageContext;
use crate::gpu::keypoints::KeypointBuffer;
use crate::normalizer::DescriptorNormalizer;

/// Layout must match `DescriptorParams` in descriptor.wgsl (16 bytes).
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct DescriptorParams {
    pub octave: u32,
    pub num_octaves: u32,
    pub subsampling: f32,
    pub _pad: u32,
}

/// The normalizer program resident on the device, re-uploaded only when
/// the program changes.
pub struct NormalizerBuffer {
    normalizer: DescriptorNormalizer,
    buffer: wgpu::Buffer,
}

impl NormalizerBuffer {
    pub fn new(gpu: &GpuDevice, normalizer: &DescriptorNormalizer) -> Self {
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("descriptor normalizer"),
            size: std::mem::size_of::<crate::normalizer::DeviceNormalizer>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        gpu.queue
            .write_buffer(&buffer, 0, bytemuck::bytes_of(&normalizer.to_device()));
        NormalizerBuffer { normalizer: normalizer.clone(), buffer }
    }

    /// Upload `normalizer` if it differs from the resident program.
    pub fn update(&mut self, gpu: &GpuDevice, normalizer: &DescriptorNormalizer) {
        if self.normalizer == *normalizer {
            return;
        }
        log::debug!("descriptor normalizer changed: {:?}", normalizer.steps());
        gpu.queue
            .write_buffer(&self.buffer, 0, bytemuck::bytes_of(&normalizer.to_device()));
        self.normalizer = normalizer.clone();
    }

    pub fn normalizer(&self) -> &DescriptorNormalizer {
        &self.normalizer
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

/// Record orientation assignment followed by descriptor computation for
/// the keypoints `octave` appended.
pub fn describe_octave(
    ctx: &mut StageContext<'_>,
    octave: usize,
    keypoints: &KeypointBuffer,
    normalizer: &NormalizerBuffer,
) {
    let layout = ctx.arena.layout();
    if octave >= layout.num_octaves() {
        log::warn!("describe_octave: octave {octave} outside the arena, skipped");
        return;
    }
    let params = DescriptorParams {
        octave: octave as u32,
        num_octaves: layout.num_octaves() as u32,
        subsampling: layout.plan().octave(octave).subsampling,
        _pad: 0,
    };
    let params_buf = ctx.uniform("descriptor params", &params);
    let bind_group = ctx.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("descriptor BG"),
        layout: &ctx.kernels.descriptor_bgl,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: keypoints.buffer().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: params_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: ctx.arena.point_counters().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: normalizer.buffer().as_entire_binding() },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: wgpu::BindingResource::TextureView(ctx.arena.texture_view(ImageSlot::Octave(octave))),
            },
        ],
    });

    let kernels = ctx.kernels;
    let arena = ctx.arena;
    let args = arena.dispatch_args();
    let offset = octave as u64 * DISPATCH_ARGS_BYTES;
    ctx.dispatch_indirect("compute_orientations", &kernels.orientations, &bind_group, args, offset);
    ctx.dispatch_indirect("compute_descriptors", &kernels.descriptors, &bind_group, args, offset);
}
