// Staging upload buffer
//
// Host writes land in a persistently mapped bounce buffer and are recorded
// as one copy per destination buffer when flushed. Capacity is fixed at
// construction; running out of room is a programming error.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::ptr::NonNull;
use std::sync::Arc;

use super::buffer::Buffer;
use super::device::DeviceContext;
use super::gpu::GpuDevice;

pub struct StagingBuffer<D: GpuDevice = DeviceContext> {
    buffer: Buffer<D>,
    mapped: NonNull<u8>,
    cursor: vk::DeviceSize,
    /// Destinations in first-queued order, each with its regions in queue order
    pending: Vec<(vk::Buffer, Vec<vk::BufferCopy>)>,
}

impl<D: GpuDevice> StagingBuffer<D> {
    pub fn new(device: Arc<D>, capacity: vk::DeviceSize) -> Result<Self> {
        let buffer = Buffer::new(
            device,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            capacity,
        )
        .context("Failed to create staging buffer")?;

        let mapped = buffer
            .device()
            .map_memory(buffer.memory().memory(), 0, capacity)
            .context("Failed to map staging buffer")?;

        log::debug!("Staging buffer ready ({} bytes)", capacity);

        Ok(Self {
            buffer,
            mapped,
            cursor: 0,
            pending: Vec::new(),
        })
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    #[cfg(test)]
    pub fn cursor(&self) -> vk::DeviceSize {
        self.cursor
    }

    #[cfg(test)]
    pub fn pending_destinations(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn pending_regions(&self) -> usize {
        self.pending.iter().map(|(_, regions)| regions.len()).sum()
    }

    /// Stage `data` for a copy into `dst` at `dst_offset`. Empty uploads
    /// are ignored, since a zero-sized copy region is invalid.
    ///
    /// # Panics
    /// If `cursor + data.len() >= capacity`.
    pub fn queue_upload(&mut self, dst: vk::Buffer, dst_offset: vk::DeviceSize, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let size = data.len() as vk::DeviceSize;
        let capacity = self.capacity();
        assert!(
            self.cursor + size < capacity,
            "staging buffer overflow: cursor {} + {} bytes does not fit below capacity {}",
            self.cursor,
            size,
            capacity
        );

        unsafe {
            self.mapped
                .as_ptr()
                .add(self.cursor as usize)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }

        let region = vk::BufferCopy {
            src_offset: self.cursor,
            dst_offset,
            size,
        };
        match self.pending.iter_mut().find(|(buffer, _)| *buffer == dst) {
            Some((_, regions)) => regions.push(region),
            None => self.pending.push((dst, vec![region])),
        }

        self.cursor += size;
    }

    /// Typed wrapper around [`queue_upload`](Self::queue_upload).
    pub fn queue_upload_slice<T: Pod>(&mut self, dst: vk::Buffer, dst_offset: vk::DeviceSize, data: &[T]) {
        self.queue_upload(dst, dst_offset, bytemuck::cast_slice(data));
    }

    /// Record one copy per pending destination into `cmd`, then start over.
    ///
    /// Returns the number of copy commands recorded.
    pub fn record_flush(&mut self, cmd: vk::CommandBuffer) -> usize {
        let device = self.buffer.device();
        let src = self.buffer.handle();
        let copies = self.pending.len();

        for (dst, regions) in self.pending.drain(..) {
            device.cmd_copy_buffer(cmd, src, dst, &regions);
        }

        if copies > 0 {
            log::trace!("Flushed {} staged bytes in {} copies", self.cursor, copies);
        }
        self.cursor = 0;
        copies
    }
}

impl<D: GpuDevice> Drop for StagingBuffer<D> {
    fn drop(&mut self) {
        // Unmap before the inner buffer frees the memory
        self.buffer.device().unmap_memory(self.buffer.memory().memory());
    }
}
