// gpu/stream.rs — an ordered command stream on a shared device.
//
// wgpu exposes a single queue per device. A `Stream` is a handle that
// remembers the last submission it made, so that `synchronize()` waits for
// *its* work only (`Maintain::WaitForSubmissionIndex`) instead of draining
// the device. Two extractors on two streams can therefore record and
// submit independently from different threads; the queue interleaves their
// command buffers and each thread blocks only on its own results.
//
// Submissions made through one stream execute in submission order, which
// is all the pipeline relies on between its stages.

use std::sync::Arc;

use crate::gpu::device::GpuDevice;

pub struct Stream {
    gpu: Arc<GpuDevice>,
    label: String,
    last: Option<wgpu::SubmissionIndex>,
}

impl Stream {
    pub fn new(gpu: Arc<GpuDevice>, label: impl Into<String>) -> Self {
        Stream { gpu, label: label.into(), last: None }
    }

    pub fn gpu(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Submit one encoder. Does not block.
    pub fn submit(&mut self, encoder: wgpu::CommandEncoder) {
        let index = self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.last = Some(index);
    }

    /// Block until every submission made through this stream has completed.
    ///
    /// Also drives pending `map_async` callbacks for buffers whose copies
    /// were part of those submissions.
    pub fn synchronize(&mut self) {
        match self.last.take() {
            Some(index) => {
                let _ = self
                    .gpu
                    .device
                    .poll(wgpu::Maintain::WaitForSubmissionIndex(index));
            }
            None => {
                let _ = self.gpu.device.poll(wgpu::Maintain::Poll);
            }
        }
        log::trace!("stream '{}' synchronized", self.label);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("label", &self.label)
            .field("pending", &self.last.is_some())
            .finish()
    }
}
