// Recording stand-in for the driver, used by unit tests.
//
// Handles are sequential integers, memory is a host Vec per allocation and
// fences carry a signaled bit so misuse panics the way a hang would show up
// on real hardware.

use anyhow::Result;
use ash::vk::{self, Handle};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;

use super::gpu::{GpuDevice, Presenter};
use super::memory::MemoryTypeTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateBuffer(vk::Buffer),
    DestroyBuffer(vk::Buffer),
    AllocateMemory { memory: vk::DeviceMemory, size: u64, type_index: u32 },
    FreeMemory(vk::DeviceMemory),
    BindBufferMemory { buffer: vk::Buffer, memory: vk::DeviceMemory, offset: u64 },
    MapMemory(vk::DeviceMemory),
    UnmapMemory(vk::DeviceMemory),
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandBuffer),
    ResetCommandPool(vk::CommandPool),
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    Submit(vk::Queue, vk::CommandBuffer),
    WaitIdle,
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, regions: Vec<(u64, u64, u64)> },
    Barrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffers: Vec<vk::Buffer>,
        images: Vec<vk::Image>,
    },
    BindCompute { pipeline: vk::Pipeline, set: vk::DescriptorSet },
    Dispatch(u32, u32, u32),
    CreateSetLayout(vk::DescriptorSetLayout),
    DestroySetLayout(vk::DescriptorSetLayout),
    CreatePipelineLayout(vk::PipelineLayout),
    DestroyPipelineLayout(vk::PipelineLayout),
    CreatePipeline(vk::Pipeline),
    DestroyPipeline(vk::Pipeline),
    CreateDescriptorPool(vk::DescriptorPool),
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSet(vk::DescriptorSet),
    WriteDescriptors { set: vk::DescriptorSet, buffers: Vec<vk::Buffer> },
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    Acquire { fence: vk::Fence, image: u32 },
    Present(u32),
    /// Pushed by test closures to mark where their work ran
    Work(u32),
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    calls: Vec<Call>,
    buffer_sizes: HashMap<vk::Buffer, u64>,
    memory: HashMap<vk::DeviceMemory, Vec<u8>>,
    signaled: HashSet<vk::Fence>,
    /// Raw handles of live pipeline and descriptor objects
    objects: HashSet<u64>,
}

pub struct MockDevice {
    memory_types: MemoryTypeTable,
    memory_type_bits: u32,
    queues: Vec<vk::Queue>,
    size_granularity: Cell<u64>,
    state: RefCell<MockState>,
}

impl MockDevice {
    /// Type 0 device-local, type 1 host-visible + coherent, one queue.
    pub fn new() -> Arc<Self> {
        Self::with_memory_types(
            vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
            0b11,
        )
    }

    pub fn with_memory_types(types: Vec<vk::MemoryPropertyFlags>, memory_type_bits: u32) -> Arc<Self> {
        Arc::new(Self {
            memory_types: MemoryTypeTable::new(types),
            memory_type_bits,
            queues: vec![vk::Queue::from_raw(0xA000)],
            size_granularity: Cell::new(1),
            state: RefCell::new(MockState {
                next_handle: 1,
                ..Default::default()
            }),
        })
    }

    /// Round reported requirement sizes up to a multiple of `granularity`,
    /// the way drivers do.
    pub fn set_size_granularity(&self, granularity: u64) {
        self.size_granularity.set(granularity);
    }

    pub fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|call| pred(call)).count()
    }

    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.state.borrow().memory.get(&memory).cloned().unwrap_or_default()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.borrow().memory.len()
    }

    pub fn live_objects(&self) -> usize {
        self.state.borrow().objects.len()
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.borrow().signaled.contains(&fence)
    }

    pub fn signal(&self, fence: vk::Fence) {
        self.state.borrow_mut().signaled.insert(fence);
    }

    fn next_handle(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    fn create_object(&self) -> u64 {
        let handle = self.next_handle();
        self.state.borrow_mut().objects.insert(handle);
        handle
    }

    fn destroy_object(&self, handle: u64) {
        let removed = self.state.borrow_mut().objects.remove(&handle);
        assert!(removed, "destroying unknown object {:#x}", handle);
    }
}

impl GpuDevice for MockDevice {
    fn get_queue(&self, index: usize) -> vk::Queue {
        match self.queues.get(index) {
            Some(&queue) => queue,
            None => panic!("queue index {} out of range ({} queue(s) created)", index, self.queues.len()),
        }
    }

    fn select_memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> u32 {
        self.memory_types.select(type_bits, required)
    }

    fn wait_idle(&self) -> Result<()> {
        self.record(Call::WaitIdle);
        Ok(())
    }

    fn create_buffer(&self, _usage: vk::BufferUsageFlags, size: vk::DeviceSize) -> Result<vk::Buffer> {
        let buffer = vk::Buffer::from_raw(self.next_handle());
        self.state.borrow_mut().buffer_sizes.insert(buffer, size);
        self.record(Call::CreateBuffer(buffer));
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.borrow_mut().buffer_sizes.remove(&buffer);
        self.record(Call::DestroyBuffer(buffer));
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.borrow().buffer_sizes.get(&buffer).copied().unwrap_or(0);
        let granularity = self.size_granularity.get();
        vk::MemoryRequirements {
            size: (size + granularity - 1) / granularity * granularity,
            alignment: 16,
            memory_type_bits: self.memory_type_bits,
        }
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> Result<vk::DeviceMemory> {
        let memory = vk::DeviceMemory::from_raw(self.next_handle());
        self.state.borrow_mut().memory.insert(memory, vec![0; size as usize]);
        self.record(Call::AllocateMemory {
            memory,
            size,
            type_index: memory_type_index,
        });
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let removed = self.state.borrow_mut().memory.remove(&memory);
        assert!(removed.is_some(), "double free of {:?}", memory);
        self.record(Call::FreeMemory(memory));
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        self.record(Call::BindBufferMemory { buffer, memory, offset });
        Ok(())
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<NonNull<u8>> {
        let ptr = {
            let mut state = self.state.borrow_mut();
            let bytes = state
                .memory
                .get_mut(&memory)
                .ok_or_else(|| anyhow::anyhow!("mapping unknown memory {:?}", memory))?;
            anyhow::ensure!(
                offset + size <= bytes.len() as u64,
                "mapping {}..{} of a {} byte allocation",
                offset,
                offset + size,
                bytes.len()
            );
            // The Vec is never resized, so the pointer stays valid until freed
            unsafe { bytes.as_mut_ptr().add(offset as usize) }
        };
        self.record(Call::MapMemory(memory));
        Ok(NonNull::new(ptr).expect("Vec pointer is non-null"))
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.record(Call::UnmapMemory(memory));
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let pool = vk::CommandPool::from_raw(self.next_handle());
        self.record(Call::CreateCommandPool(pool));
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.record(Call::DestroyCommandPool(pool));
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let cmd = vk::CommandBuffer::from_raw(self.next_handle());
        self.record(Call::AllocateCommandBuffer(cmd));
        Ok(cmd)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        self.record(Call::ResetCommandPool(pool));
        Ok(())
    }

    fn begin_one_time_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(Call::Begin(cmd));
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(Call::End(cmd));
        Ok(())
    }

    fn submit(&self, queue: vk::Queue, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(Call::Submit(queue, cmd));
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(Call::CopyBuffer {
            src,
            dst,
            regions: regions
                .iter()
                .map(|r| (r.src_offset, r.dst_offset, r.size))
                .collect(),
        });
    }

    fn cmd_pipeline_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        _dependency_flags: vk::DependencyFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        self.record(Call::Barrier {
            src_stage,
            dst_stage,
            buffers: buffer_barriers.iter().map(|b| b.buffer).collect(),
            images: image_barriers.iter().map(|b| b.image).collect(),
        });
    }

    fn cmd_bind_compute(
        &self,
        _cmd: vk::CommandBuffer,
        pipeline: vk::Pipeline,
        _layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
    ) {
        self.record(Call::BindCompute {
            pipeline,
            set: descriptor_set,
        });
    }

    fn cmd_dispatch(&self, _cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(Call::Dispatch(x, y, z));
    }

    fn create_storage_set_layout(&self, _binding_count: u32) -> Result<vk::DescriptorSetLayout> {
        let layout = vk::DescriptorSetLayout::from_raw(self.create_object());
        self.record(Call::CreateSetLayout(layout));
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.destroy_object(layout.as_raw());
        self.record(Call::DestroySetLayout(layout));
    }

    fn create_pipeline_layout(&self, _set_layout: vk::DescriptorSetLayout) -> Result<vk::PipelineLayout> {
        let layout = vk::PipelineLayout::from_raw(self.create_object());
        self.record(Call::CreatePipelineLayout(layout));
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.destroy_object(layout.as_raw());
        self.record(Call::DestroyPipelineLayout(layout));
    }

    fn create_compute_pipeline(&self, _layout: vk::PipelineLayout, code: &[u32]) -> Result<vk::Pipeline> {
        anyhow::ensure!(!code.is_empty(), "empty shader module");
        let pipeline = vk::Pipeline::from_raw(self.create_object());
        self.record(Call::CreatePipeline(pipeline));
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.destroy_object(pipeline.as_raw());
        self.record(Call::DestroyPipeline(pipeline));
    }

    fn create_storage_descriptor_pool(&self, _descriptor_count: u32) -> Result<vk::DescriptorPool> {
        let pool = vk::DescriptorPool::from_raw(self.create_object());
        self.record(Call::CreateDescriptorPool(pool));
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.destroy_object(pool.as_raw());
        self.record(Call::DestroyDescriptorPool(pool));
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        // Owned by the pool, so not tracked separately
        let set = vk::DescriptorSet::from_raw(self.next_handle());
        self.record(Call::AllocateDescriptorSet(set));
        Ok(set)
    }

    fn write_storage_buffers(&self, set: vk::DescriptorSet, buffers: &[vk::Buffer]) {
        self.record(Call::WriteDescriptors {
            set,
            buffers: buffers.to_vec(),
        });
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        let fence = vk::Fence::from_raw(self.next_handle());
        self.record(Call::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.borrow_mut().signaled.remove(&fence);
        self.record(Call::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        assert!(
            self.is_signaled(fence),
            "waiting on {:?}, which nothing will signal",
            fence
        );
        self.record(Call::WaitFence(fence));
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.state.borrow_mut().signaled.remove(&fence);
        self.record(Call::ResetFence(fence));
        Ok(())
    }
}

/// Hands out images round-robin and signals the acquire fence immediately.
pub struct MockPresenter {
    device: Arc<MockDevice>,
    images: Vec<vk::Image>,
    next: Cell<u32>,
}

impl MockPresenter {
    pub fn new(device: Arc<MockDevice>, image_count: u64) -> Self {
        Self {
            device,
            images: (0..image_count).map(|i| vk::Image::from_raw(0xB000 + i)).collect(),
            next: Cell::new(0),
        }
    }
}

impl Presenter for MockPresenter {
    fn images(&self) -> &[vk::Image] {
        &self.images
    }

    fn acquire_next_image(&self, fence: vk::Fence) -> Result<u32> {
        assert!(
            !self.device.is_signaled(fence),
            "{:?} handed to acquire while still signaled",
            fence
        );
        let image = self.next.get();
        self.next.set((image + 1) % self.images.len() as u32);
        self.device.record(Call::Acquire { fence, image });
        self.device.signal(fence);
        Ok(image)
    }

    fn present(&self, _queue: vk::Queue, image_index: u32) -> Result<()> {
        self.device.record(Call::Present(image_index));
        Ok(())
    }
}
