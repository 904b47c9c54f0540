// gpu/kernels.rs — compiled compute pipelines for every SIFT stage.
//
// `SiftKernels` is expensive to create (four shader modules, eleven
// pipelines) and immutable afterwards. Create it once per device and share
// it between extractors with `Arc`:
//
//   let kernels = Arc::new(SiftKernels::new(&gpu)?);
//   let a = SiftExtractor::new(kernels.clone(), Stream::new(gpu.clone(), "a"), ...)?;
//   let b = SiftExtractor::new(kernels.clone(), Stream::new(gpu.clone(), "b"), ...)?;
//
// Each WGSL file is prefixed with common.wgsl and has its workgroup size
// baked in by `GpuDevice::shader_source`.
//
// BIND GROUP LAYOUTS
// ──────────────────
//   filter     0 arena (rw)  1 ImagePair      2 Coeffs
//   upsample   0 arena (rw)  1 ImagePair      3 source texture
//   dog        0 arena (rw)  1 DogParams      2 Laplace table (ro)
//   extrema    0 arena (rw)  1 ExtremaParams  2 counters (rw)
//              3 keypoints (rw)               4 indirect args (rw)
//   descriptor 0 keypoints (rw)  1 DescriptorParams  2 counters (ro)
//              3 normalizer (ro)                     4 octave texture

use crate::error::{Result, SiftError};
use crate::gpu::arena::PyramidArena;
use crate::gpu::device::GpuDevice;

const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");

pub struct SiftKernels {
    pub(crate) filter_bgl: wgpu::BindGroupLayout,
    pub(crate) upsample_bgl: wgpu::BindGroupLayout,
    pub(crate) dog_bgl: wgpu::BindGroupLayout,
    pub(crate) extrema_bgl: wgpu::BindGroupLayout,
    pub(crate) descriptor_bgl: wgpu::BindGroupLayout,

    pub(crate) lowpass_rows: wgpu::ComputePipeline,
    pub(crate) lowpass_cols: wgpu::ComputePipeline,
    pub(crate) downsample: wgpu::ComputePipeline,
    pub(crate) upsample: wgpu::ComputePipeline,
    pub(crate) blur_rows: wgpu::ComputePipeline,
    pub(crate) blur_cols_diff: wgpu::ComputePipeline,
    pub(crate) find_extrema: wgpu::ComputePipeline,
    pub(crate) open_octave: wgpu::ComputePipeline,
    pub(crate) close_octave: wgpu::ComputePipeline,
    pub(crate) orientations: wgpu::ComputePipeline,
    pub(crate) descriptors: wgpu::ComputePipeline,
}

impl SiftKernels {
    /// Compile every shader and create every pipeline.
    ///
    /// Validation errors are captured with an error scope and returned as
    /// `PipelineCreation` rather than reaching wgpu's uncaptured handler.
    pub fn new(gpu: &GpuDevice) -> Result<Self> {
        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let kernels = Self::create(gpu);
        if let Some(err) = pollster::block_on(gpu.device.pop_error_scope()) {
            return Err(SiftError::PipelineCreation { what: "SIFT kernels", reason: err.to_string() });
        }
        log::debug!("SIFT kernels compiled (workgroup {})", gpu.workgroup_size);
        Ok(kernels)
    }

    fn create(gpu: &GpuDevice) -> Self {
        let device = &gpu.device;

        let scale_space = shader_module(gpu, "scale_space.wgsl", include_str!("../shaders/scale_space.wgsl"));
        let dog = shader_module(gpu, "dog.wgsl", include_str!("../shaders/dog.wgsl"));
        let extrema = shader_module(gpu, "extrema.wgsl", include_str!("../shaders/extrema.wgsl"));
        let descriptor = shader_module(gpu, "descriptor.wgsl", include_str!("../shaders/descriptor.wgsl"));

        let filter_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("filter BGL"),
            entries: &[storage_entry(0, false), uniform_entry(1), uniform_entry(2)],
        });
        let upsample_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("upsample BGL"),
            entries: &[storage_entry(0, false), uniform_entry(1), texture_entry(3)],
        });
        let dog_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("dog BGL"),
            entries: &[storage_entry(0, false), uniform_entry(1), storage_entry(2, true)],
        });
        let extrema_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("extrema BGL"),
            entries: &[
                storage_entry(0, false),
                uniform_entry(1),
                storage_entry(2, false),
                storage_entry(3, false),
                storage_entry(4, false),
            ],
        });
        let descriptor_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("descriptor BGL"),
            entries: &[
                storage_entry(0, false),
                uniform_entry(1),
                storage_entry(2, true),
                storage_entry(3, true),
                texture_entry(4),
            ],
        });

        let pipeline = |bgl: &wgpu::BindGroupLayout, module: &wgpu::ShaderModule, entry: &str| {
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(entry),
                bind_group_layouts: &[bgl],
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&layout),
                module,
                entry_point: entry,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };

        SiftKernels {
            lowpass_rows: pipeline(&filter_bgl, &scale_space, "lowpass_rows"),
            lowpass_cols: pipeline(&filter_bgl, &scale_space, "lowpass_cols"),
            downsample: pipeline(&filter_bgl, &scale_space, "downsample"),
            upsample: pipeline(&upsample_bgl, &scale_space, "upsample"),
            blur_rows: pipeline(&dog_bgl, &dog, "blur_rows"),
            blur_cols_diff: pipeline(&dog_bgl, &dog, "blur_cols_diff"),
            find_extrema: pipeline(&extrema_bgl, &extrema, "find_extrema"),
            open_octave: pipeline(&extrema_bgl, &extrema, "open_octave"),
            close_octave: pipeline(&extrema_bgl, &extrema, "close_octave"),
            orientations: pipeline(&descriptor_bgl, &descriptor, "compute_orientations"),
            descriptors: pipeline(&descriptor_bgl, &descriptor, "compute_descriptors"),
            filter_bgl,
            upsample_bgl,
            dog_bgl,
            extrema_bgl,
            descriptor_bgl,
        }
    }
}

/// Borrowed resources every stage needs while recording.
pub struct StageContext<'a> {
    pub gpu: &'a GpuDevice,
    pub kernels: &'a SiftKernels,
    pub arena: &'a PyramidArena,
    pub encoder: &'a mut wgpu::CommandEncoder,
}

impl StageContext<'_> {
    /// Record one compute pass with a single direct dispatch.
    pub(crate) fn dispatch(
        &mut self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        workgroups: (u32, u32, u32),
    ) {
        let mut pass = self.encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
    }

    /// Record one compute pass whose size is read from `args` at `offset`.
    pub(crate) fn dispatch_indirect(
        &mut self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        args: &wgpu::Buffer,
        offset: u64,
    ) {
        let mut pass = self.encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups_indirect(args, offset);
    }

    /// Per-dispatch uniform buffer.
    pub(crate) fn uniform<T: bytemuck::Pod>(&self, label: &str, value: &T) -> wgpu::Buffer {
        use wgpu::util::DeviceExt;
        self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(value),
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn shader_module(gpu: &GpuDevice, label: &str, body: &str) -> wgpu::ShaderModule {
    let source = gpu.shader_source(&format!("{COMMON_WGSL}\n{body}"));
    gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    }
}
