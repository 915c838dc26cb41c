// Buffers backed by device memory
//
// A buffer either owns a dedicated allocation or is bound into a MemoryBlock
// owned elsewhere. Only the owning variant frees memory on drop.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use super::device::DeviceContext;
use super::gpu::GpuDevice;

/// Where a buffer's memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMemory {
    /// Dedicated allocation, bound at offset 0 and freed with the buffer
    Owned(vk::DeviceMemory),
    /// Range of someone else's allocation; never freed here
    SubAllocated {
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    },
}

impl BufferMemory {
    pub fn memory(&self) -> vk::DeviceMemory {
        match *self {
            BufferMemory::Owned(memory) => memory,
            BufferMemory::SubAllocated { memory, .. } => memory,
        }
    }

    pub fn offset(&self) -> vk::DeviceSize {
        match *self {
            BufferMemory::Owned(_) => 0,
            BufferMemory::SubAllocated { offset, .. } => offset,
        }
    }
}

/// A raw device allocation that buffers can be sub-allocated from.
pub struct MemoryBlock<D: GpuDevice = DeviceContext> {
    device: Arc<D>,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
}

impl<D: GpuDevice> MemoryBlock<D> {
    pub fn allocate(device: Arc<D>, size: vk::DeviceSize, memory_type_index: u32) -> Result<Self> {
        let memory = device
            .allocate_memory(size, memory_type_index)
            .context("Failed to allocate memory block")?;
        log::debug!(
            "Allocated {} byte memory block from type {}",
            size,
            memory_type_index
        );
        Ok(Self {
            device,
            memory,
            size,
            memory_type_index,
        })
    }

    /// Allocate one block that fits buffers of `sizes` created with `usage`,
    /// placed back to back at their required alignment.
    ///
    /// Returns the block and the offset reserved for each size.
    ///
    /// # Panics
    /// If no memory type suits every buffer and `memory_flags`.
    pub fn for_buffers(
        device: Arc<D>,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        sizes: &[vk::DeviceSize],
    ) -> Result<(Self, Vec<vk::DeviceSize>)> {
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut end = 0;
        let mut type_bits = u32::MAX;

        for &size in sizes {
            // Requirements are only known per buffer, so ask with a throwaway one
            let probe = device.create_buffer(usage, size)?;
            let requirements = device.buffer_memory_requirements(probe);
            device.destroy_buffer(probe);

            let offset = align_up(end, requirements.alignment);
            offsets.push(offset);
            end = offset + requirements.size;
            type_bits &= requirements.memory_type_bits;
        }

        let memory_type_index = device.select_memory_type(type_bits, memory_flags);
        let block = Self::allocate(device, end, memory_type_index)?;
        Ok((block, offsets))
    }

    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }
}

impl<D: GpuDevice> Drop for MemoryBlock<D> {
    fn drop(&mut self) {
        self.device.free_memory(self.memory);
    }
}

pub struct Buffer<D: GpuDevice = DeviceContext> {
    device: Arc<D>,
    handle: vk::Buffer,
    size: vk::DeviceSize,
    memory: BufferMemory,
}

impl<D: GpuDevice> Buffer<D> {
    /// Create a buffer with its own dedicated allocation.
    ///
    /// # Panics
    /// If no memory type satisfies `memory_flags`.
    pub fn new(
        device: Arc<D>,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let handle = device.create_buffer(usage, size)?;
        let requirements = device.buffer_memory_requirements(handle);
        let memory_type_index =
            device.select_memory_type(requirements.memory_type_bits, memory_flags);

        let memory = match device.allocate_memory(requirements.size, memory_type_index) {
            Ok(memory) => memory,
            Err(err) => {
                device.destroy_buffer(handle);
                return Err(err.context("Failed to allocate buffer memory"));
            }
        };

        if let Err(err) = device.bind_buffer_memory(handle, memory, 0) {
            device.destroy_buffer(handle);
            device.free_memory(memory);
            return Err(err);
        }

        log::trace!(
            "Created {} byte buffer {:?} ({:?}) in memory type {}",
            size,
            handle,
            usage,
            memory_type_index
        );

        Ok(Self {
            device,
            handle,
            size,
            memory: BufferMemory::Owned(memory),
        })
    }

    /// Create a buffer bound into `block` at `offset`.
    ///
    /// The block must outlive the buffer.
    ///
    /// # Panics
    /// If `offset..offset + size` does not fit in the block.
    pub fn sub_allocated(
        device: Arc<D>,
        usage: vk::BufferUsageFlags,
        block: &MemoryBlock<D>,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        assert!(
            offset
                .checked_add(size)
                .map_or(false, |end| end <= block.size()),
            "sub-allocation {}..{} exceeds {} byte memory block",
            offset,
            offset.saturating_add(size),
            block.size()
        );

        let handle = device.create_buffer(usage, size)?;
        let requirements = device.buffer_memory_requirements(handle);

        let compatible = requirements.memory_type_bits & (1 << block.memory_type_index()) != 0;
        let aligned = requirements.alignment == 0 || offset % requirements.alignment == 0;
        // Drivers may pad the requirement past the requested size
        let fits = offset
            .checked_add(requirements.size)
            .map_or(false, |end| end <= block.size());
        if !compatible || !aligned || !fits {
            device.destroy_buffer(handle);
            anyhow::bail!(
                "Cannot bind {} byte buffer at offset {} (alignment {}) into {} byte block of memory type {} (allowed {:#b})",
                requirements.size,
                offset,
                requirements.alignment,
                block.size(),
                block.memory_type_index(),
                requirements.memory_type_bits
            );
        }

        if let Err(err) = device.bind_buffer_memory(handle, block.handle(), offset) {
            device.destroy_buffer(handle);
            return Err(err);
        }

        Ok(Self {
            device,
            handle,
            size,
            memory: BufferMemory::SubAllocated {
                memory: block.handle(),
                offset,
            },
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory(&self) -> BufferMemory {
        self.memory
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Copy `data` to the start of a host-visible buffer.
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "Writing {} bytes into a {} byte buffer",
            bytes.len(),
            self.size
        );

        let memory = self.memory.memory();
        let ptr = self
            .device
            .map_memory(memory, self.memory.offset(), bytes.len() as vk::DeviceSize)
            .context("Failed to map buffer for writing")?;
        unsafe {
            ptr.as_ptr()
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        self.device.unmap_memory(memory);
        Ok(())
    }

    /// Read `count` elements from the start of a host-visible buffer.
    pub fn read<T: Pod>(&self, count: usize) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); count];
        let len = std::mem::size_of_val(out.as_slice());
        anyhow::ensure!(
            len as vk::DeviceSize <= self.size,
            "Reading {} bytes from a {} byte buffer",
            len,
            self.size
        );

        let memory = self.memory.memory();
        let ptr = self
            .device
            .map_memory(memory, self.memory.offset(), len as vk::DeviceSize)
            .context("Failed to map buffer for reading")?;
        unsafe {
            let dst: &mut [u8] = bytemuck::cast_slice_mut(out.as_mut_slice());
            dst.as_mut_ptr().copy_from_nonoverlapping(ptr.as_ptr(), len);
        }
        self.device.unmap_memory(memory);
        Ok(out)
    }
}

fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    let alignment = alignment.max(1);
    (value + alignment - 1) / alignment * alignment
}

impl<D: GpuDevice> Drop for Buffer<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.handle);
        if let BufferMemory::Owned(memory) = self.memory {
            self.device.free_memory(memory);
        }
    }
}
