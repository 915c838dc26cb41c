// Synchronization primitives
//
// One fence per frame-in-flight slot plus the index of the active slot.
// Fences start unsignaled: the first thing a slot does is hand its fence to
// image acquisition.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::device::DeviceContext;
use super::gpu::GpuDevice;

pub struct FrameSync<D: GpuDevice = DeviceContext> {
    device: Arc<D>,
    fences: Vec<vk::Fence>,
    active: usize,
}

impl<D: GpuDevice> FrameSync<D> {
    pub fn new(device: Arc<D>, frames_in_flight: usize) -> Result<Self> {
        anyhow::ensure!(frames_in_flight > 0, "At least one frame in flight is required");

        let mut sync = Self {
            device,
            fences: Vec::with_capacity(frames_in_flight),
            active: 0,
        };
        // Pushed one at a time so Drop cleans up whatever was created on failure
        for _ in 0..frames_in_flight {
            let fence = sync.device.create_fence()?;
            sync.fences.push(fence);
        }
        Ok(sync)
    }

    pub fn active_slot(&self) -> usize {
        self.active
    }

    pub fn active_fence(&self) -> vk::Fence {
        self.fences[self.active]
    }

    /// Move to the next slot, wrapping around.
    pub fn advance(&mut self) {
        self.active = (self.active + 1) % self.fences.len();
    }
}

impl<D: GpuDevice> Drop for FrameSync<D> {
    fn drop(&mut self) {
        for &fence in &self.fences {
            self.device.destroy_fence(fence);
        }
    }
}
