// One-shot command recording and submission
//
// A single pool with a single command buffer, reset before every unit of
// work. Reuse is safe because every submit ends with a device-wide wait.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::barrier;
use super::device::DeviceContext;
use super::gpu::GpuDevice;

pub struct CommandContext<D: GpuDevice = DeviceContext> {
    device: Arc<D>,
    queue: vk::Queue,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl<D: GpuDevice> CommandContext<D> {
    /// # Panics
    /// If `queue_index` is not one of the device's queues.
    pub fn new(device: Arc<D>, queue_index: usize) -> Result<Self> {
        let queue = device.get_queue(queue_index);
        let pool = device.create_command_pool()?;
        let cmd = match device.allocate_command_buffer(pool) {
            Ok(cmd) => cmd,
            Err(err) => {
                device.destroy_command_pool(pool);
                return Err(err);
            }
        };

        Ok(Self {
            device,
            queue,
            pool,
            cmd,
        })
    }

    #[cfg(test)]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    #[cfg(test)]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Reset, record with `record`, submit and wait for the device to idle.
    pub fn submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&D, vk::CommandBuffer) -> Result<()>,
    {
        let device = self.device.as_ref();

        device.reset_command_pool(self.pool)?;
        device.begin_one_time_commands(self.cmd)?;
        record(device, self.cmd).context("Failed to record commands")?;
        device.end_commands(self.cmd)?;
        device.submit(self.queue, self.cmd)?;
        device.wait_idle()
    }

    /// Move freshly created swapchain images into PRESENT_SRC with one barrier.
    pub fn transition_to_present(&self, images: &[vk::Image]) -> Result<()> {
        let barriers = barrier::present_transitions(images);
        self.submit(|device, cmd| {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::BY_REGION,
                &[],
                &barriers,
            );
            Ok(())
        })?;
        log::debug!("Transitioned {} swapchain images to PRESENT_SRC", images.len());
        Ok(())
    }
}

impl<D: GpuDevice> Drop for CommandContext<D> {
    fn drop(&mut self) {
        // Freeing the pool frees its command buffer
        self.device.destroy_command_pool(self.pool);
    }
}
