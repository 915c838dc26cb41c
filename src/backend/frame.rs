// Frame loop
//
// Fully serialized: every frame waits on its acquire fence before work is
// issued and on the whole device after presenting. The fence ring exists so
// frames can be pipelined later without changing this protocol.

use anyhow::{Context, Result};
use std::sync::Arc;

use super::device::DeviceContext;
use super::gpu::{GpuDevice, Presenter};
use super::sync::FrameSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    FencedWait,
    Executing,
    Presenting,
}

pub struct FrameLoop<P: Presenter, D: GpuDevice = DeviceContext> {
    device: Arc<D>,
    presenter: P,
    sync: FrameSync<D>,
    present_queue: usize,
    state: FrameState,
    frame_count: u64,
}

impl<P: Presenter, D: GpuDevice> FrameLoop<P, D> {
    pub fn new(
        device: Arc<D>,
        presenter: P,
        frames_in_flight: usize,
        present_queue: usize,
    ) -> Result<Self> {
        let sync = FrameSync::new(device.clone(), frames_in_flight)
            .context("Failed to create frame fences")?;
        log::debug!("Frame loop ready ({} fence slots)", frames_in_flight);

        Ok(Self {
            device,
            presenter,
            sync,
            present_queue,
            state: FrameState::Idle,
            frame_count: 0,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[cfg(test)]
    pub fn active_slot(&self) -> usize {
        self.sync.active_slot()
    }

    #[cfg(test)]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Run one acquire -> wait -> execute -> present cycle.
    ///
    /// `execute` receives the acquired image index and must submit its own
    /// work. On error the loop is left in the state that failed.
    pub fn run_frame<F>(&mut self, execute: F) -> Result<()>
    where
        F: FnOnce(u32) -> Result<()>,
    {
        self.cycle(execute)
            .with_context(|| format!("Frame {} failed while {:?}", self.frame_count, self.state))
    }

    fn cycle<F>(&mut self, execute: F) -> Result<()>
    where
        F: FnOnce(u32) -> Result<()>,
    {
        let fence = self.sync.active_fence();

        self.state = FrameState::Acquiring;
        let image_index = self
            .presenter
            .acquire_next_image(fence)
            .context("Failed to acquire swapchain image")?;

        self.state = FrameState::FencedWait;
        self.device.wait_for_fence(fence)?;
        self.device.reset_fence(fence)?;

        self.state = FrameState::Executing;
        execute(image_index)?;

        self.state = FrameState::Presenting;
        let queue = self.device.get_queue(self.present_queue);
        self.presenter
            .present(queue, image_index)
            .context("Failed to present")?;
        self.device.wait_idle()?;

        log::trace!(
            "Frame {} done (slot {}, image {})",
            self.frame_count,
            self.sync.active_slot(),
            image_index
        );
        self.sync.advance();
        self.frame_count += 1;
        self.state = FrameState::Idle;
        Ok(())
    }
}

/// Headless unit of work: run `execute`, then wait for the device to idle.
pub fn run_headless<D, F>(device: &D, execute: F) -> Result<()>
where
    D: GpuDevice + ?Sized,
    F: FnOnce() -> Result<()>,
{
    execute()?;
    device.wait_idle()
}
