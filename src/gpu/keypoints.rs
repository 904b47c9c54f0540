// gpu/keypoints.rs — fixed-capacity keypoint storage with a host mirror.
//
// The device buffer holds exactly `capacity` records and is never resized
// by a kernel. The host mirror is filled on request (`sync_to_host`) and can
// be edited and pushed back (`sync_to_device`), e.g. after matching fills in
// the match fields.

use crate::counters::{bounded_slot, AppendOutcome, BoundedAppend};
use crate::error::{Result, SiftError};
use crate::gpu::device::GpuDevice;
use crate::gpu::image::read_buffer;
use crate::gpu::stream::Stream;
use crate::keypoint::Keypoint;

const RECORD_BYTES: u64 = std::mem::size_of::<Keypoint>() as u64;

pub struct KeypointBuffer {
    buffer: wgpu::Buffer,
    capacity: u32,
    host: Vec<Keypoint>,
}

impl KeypointBuffer {
    /// Allocate room for `capacity` records (at least one).
    ///
    /// A buffer larger than the device's storage limit, or one the driver
    /// refuses, is `ResourceExhausted`.
    pub fn new(gpu: &GpuDevice, capacity: u32) -> Result<Self> {
        let capacity = capacity.max(1);
        let bytes = Self::required_bytes(capacity);
        let limit = gpu.max_storage_bytes();
        if bytes > limit {
            return Err(SiftError::ResourceExhausted { what: "keypoint buffer", bytes, limit });
        }
        let buffer = gpu
            .with_error_scope(|| {
                gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("KeypointBuffer"),
                    size: bytes,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .map_err(|_| SiftError::ResourceExhausted { what: "keypoint buffer", bytes, limit })?;
        log::debug!("keypoint buffer: {capacity} records, {:.1} KiB", bytes as f64 / 1024.0);
        Ok(KeypointBuffer { buffer, capacity, host: Vec::new() })
    }

    /// Device bytes needed for `capacity` records.
    pub fn required_bytes(capacity: u32) -> u64 {
        capacity.max(1) as u64 * RECORD_BYTES
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Host mirror as of the last sync.
    pub fn host(&self) -> &[Keypoint] {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut Vec<Keypoint> {
        &mut self.host
    }

    /// Copy the first `count` device records into the host mirror.
    /// `count` is clamped to the capacity. Synchronous.
    pub fn sync_to_host(&mut self, stream: &mut Stream, count: u32) -> Result<()> {
        let count = count.min(self.capacity);
        self.host.clear();
        if count == 0 {
            return Ok(());
        }
        let bytes = read_buffer(stream, &self.buffer, 0, count as u64 * RECORD_BYTES)?;
        self.host.extend(
            bytes
                .chunks_exact(RECORD_BYTES as usize)
                .map(bytemuck::pod_read_unaligned::<Keypoint>),
        );
        log::trace!("synced {count} keypoints to host");
        Ok(())
    }

    /// Upload the host mirror to the start of the device buffer. Records
    /// beyond the capacity are not uploaded.
    pub fn sync_to_device(&self, gpu: &GpuDevice) {
        let n = self.host.len().min(self.capacity as usize);
        if n == 0 {
            return;
        }
        gpu.queue
            .write_buffer(&self.buffer, 0, bytemuck::cast_slice(&self.host[..n]));
    }
}

impl BoundedAppend<Keypoint> for KeypointBuffer {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn try_append(&mut self, item: Keypoint) -> AppendOutcome {
        let outcome = bounded_slot(self.host.len() as u32, self.capacity);
        if outcome.is_stored() {
            self.host.push(item);
        }
        outcome
    }
}

impl std::fmt::Debug for KeypointBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypointBuffer")
            .field("capacity", &self.capacity)
            .field("host_len", &self.host.len())
            .finish()
    }
}
