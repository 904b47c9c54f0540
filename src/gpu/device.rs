// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate adapters and select the first non-CPU one.
//   - Expose a `DeviceProfile` for simulating hardware limits on a
//     development machine (cap invocations and buffer sizes to match a
//     small embedded GPU).
//   - Provide `WorkgroupSize`, validated against the active profile and
//     baked into every compute shader at pipeline creation.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and take the first
// hardware adapter. CPU adapters are never used: with only a software
// renderer visible, device creation fails with `NoSuitableAdapter`.
//
// DEVICE LIMITS:
// The scale-space arena is a single storage buffer bound whole. For a
// 1080p source with five octaves it is larger than wgpu's default
// 128 MiB binding limit, so the `Native` profile requests the adapter's
// own limits. The `Embedded` profile requests *lower* limits than the
// hardware supports: wgpu validates every allocation and dispatch against
// the requested limits, so violations that would fail on the target are
// caught at dev time.
//
// WORKGROUP SIZES:
// naga does not accept `override` expressions inside @workgroup_size(), so
// the dimensions are baked into the WGSL source by string replacement of
// the {{WG_X}}, {{WG_Y}} and {{WG_SIZE}} placeholders (see `shader_source`).

use std::fmt;

use crate::error::{Result, SiftError};

/// Hardware profile controlling device limits and default workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits.
    Native,
    /// Simulate a small embedded GPU (e.g. VideoCore VI/VII, V3DV Vulkan):
    /// 256 invocations per workgroup, 4096² textures, 128 MiB bindings.
    Embedded,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Embedded => write!(f, "Embedded (simulated limits)"),
        }
    }
}

/// A workgroup size for 2D compute dispatches.
///
/// One-dimensional kernels (per-keypoint work) use `total()` invocations
/// along x.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Default for the given profile.
    ///
    /// - `Native`: 16×8 = 128 invocations (4 NVIDIA warps, 2 AMD waves).
    /// - `Embedded`: 8×8 = 64 invocations.
    fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::Embedded => WorkgroupSize { x: 8, y: 8 },
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The core GPU context: device, queue, active profile and limits.
///
/// Hold one `GpuDevice` per physical device and share it with `Arc`;
/// every `Stream` and extractor on that device refers to it.
///
/// # Field drop order
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`. dzn (the D3D12-to-Vulkan layer on WSL2) crashes when the
/// Vulkan instance is destroyed before device-level objects.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    /// Limits granted by `request_device`.
    pub limits: wgpu::Limits,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` on the first suitable adapter with
    /// `DeviceProfile::Native` limits.
    pub fn new() -> Result<Self> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    /// Create a `GpuDevice` with an explicit hardware profile.
    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self> {
        // Validation layer in debug builds for shader error feedback.
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets dzn on WSL2 through.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let backends = wgpu::Backends::PRIMARY;
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            flags,
            ..Default::default()
        });

        // DiscreteGpu / IntegratedGpu / VirtualGpu / Other (dzn), never Cpu.
        let all_adapters: Vec<wgpu::Adapter> = instance.enumerate_adapters(backends);
        for a in &all_adapters {
            let info = a.get_info();
            log::debug!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }

        let adapter = all_adapters
            .into_iter()
            .find(|a| is_hardware_adapter(a.get_info().device_type))
            .ok_or(SiftError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        // Auto-detect V3D when the caller passed Native.
        let profile = match profile {
            DeviceProfile::Native if raw_info.name.to_ascii_lowercase().contains("v3d") => {
                log::info!("V3D adapter detected, using Embedded profile");
                DeviceProfile::Embedded
            }
            other => other,
        };

        let limits = limits_for_profile(profile, &adapter.limits());

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("sift-wgpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        log::info!("using {adapter_info}, profile {profile}, workgroup {workgroup_size}");

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            limits,
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validating against the profile.
    ///
    /// Pipelines compiled before the change keep the old size.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<()> {
        let total = x * y;
        let max = self.limits.max_compute_invocations_per_workgroup;
        if total > max || x > self.limits.max_compute_workgroup_size_x
            || y > self.limits.max_compute_workgroup_size_y
        {
            return Err(SiftError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    /// Workgroups needed to cover a `img_w × img_h` grid (ceiling division).
    ///
    /// Shaders guard against out-of-bounds global IDs.
    pub fn dispatch_size(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        dispatch_size_for(self.workgroup_size, img_w, img_h)
    }

    /// Largest buffer that can be allocated and bound as one storage binding.
    pub fn max_storage_bytes(&self) -> u64 {
        self.limits
            .max_buffer_size
            .min(self.limits.max_storage_buffer_binding_size as u64)
    }

    /// Run `create` inside OutOfMemory and Validation error scopes.
    ///
    /// Returns the captured error text instead of letting wgpu's uncaptured
    /// error handler panic.
    pub(crate) fn with_error_scope<T>(&self, create: impl FnOnce() -> T) -> std::result::Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }

    /// Bake the active workgroup size into a WGSL template.
    pub fn shader_source(&self, template: &str) -> String {
        bake_workgroup_size(template, self.workgroup_size)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Helpers
// ============================================================

/// Software renderers (llvmpipe, lavapipe, WARP) report `Cpu`.
fn is_hardware_adapter(device_type: wgpu::DeviceType) -> bool {
    !matches!(device_type, wgpu::DeviceType::Cpu)
}

fn dispatch_size_for(ws: WorkgroupSize, img_w: u32, img_h: u32) -> (u32, u32) {
    (img_w.div_ceil(ws.x), img_h.div_ceil(ws.y))
}

fn bake_workgroup_size(template: &str, ws: WorkgroupSize) -> String {
    template
        .replace("{{WG_X}}", &ws.x.to_string())
        .replace("{{WG_Y}}", &ws.y.to_string())
        .replace("{{WG_SIZE}}", &ws.total().to_string())
}

/// Build wgpu limits for the given profile.
fn limits_for_profile(profile: DeviceProfile, adapter: &wgpu::Limits) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => adapter.clone(),

        DeviceProfile::Embedded => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: 4096,
            // 4 GiB of RAM shared with the CPU.
            max_storage_buffer_binding_size: 128 << 20,
            max_buffer_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

// ============================================================
// Tests
// ============================================================
