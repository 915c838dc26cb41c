// Driver seam - the subset of Vulkan the orchestration layer talks to
//
// Buffers, the staging uploader, command submission and the frame loop are
// generic over these traits. DeviceContext and Swapchain implement them
// with ash; tests implement them with a recording mock.

use anyhow::Result;
use ash::vk;
use std::ptr::NonNull;

/// Device-level operations: resources, command recording, submission and fences.
pub trait GpuDevice {
    /// Queue at `index` within the selected family.
    ///
    /// # Panics
    /// If `index` is outside the queues created at device creation.
    fn get_queue(&self, index: usize) -> vk::Queue;

    /// First memory type allowed by `type_bits` whose flags contain `required`.
    ///
    /// # Panics
    /// If no memory type qualifies.
    fn select_memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> u32;

    /// Block until all outstanding GPU work on the device has completed.
    fn wait_idle(&self) -> Result<()>;

    // Buffers and memory
    fn create_buffer(&self, usage: vk::BufferUsageFlags, size: vk::DeviceSize) -> Result<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> Result<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()>;
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<NonNull<u8>>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    // Command pools and submission
    fn create_command_pool(&self) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn begin_one_time_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn submit(&self, queue: vk::Queue, cmd: vk::CommandBuffer) -> Result<()>;

    // Recorded commands
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    );

    fn cmd_bind_compute(
        &self,
        cmd: vk::CommandBuffer,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
    );
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);

    // Compute pipelines and descriptors
    fn create_storage_set_layout(&self, binding_count: u32) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(&self, set_layout: vk::DescriptorSetLayout) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    /// Build a compute pipeline from SPIR-V `code`; the shader module does
    /// not outlive the call.
    fn create_compute_pipeline(&self, layout: vk::PipelineLayout, code: &[u32]) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn create_storage_descriptor_pool(&self, descriptor_count: u32) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;
    /// Point binding `i` of `set` at the whole of `buffers[i]`.
    fn write_storage_buffers(&self, set: vk::DescriptorSet, buffers: &[vk::Buffer]);

    // Fences
    fn create_fence(&self) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
}

/// Presentation engine: a set of images that can be acquired and presented.
pub trait Presenter {
    fn images(&self) -> &[vk::Image];

    /// Acquire the next presentable image. `fence` is signaled once the
    /// image is actually available.
    fn acquire_next_image(&self, fence: vk::Fence) -> Result<u32>;

    fn present(&self, queue: vk::Queue, image_index: u32) -> Result<()>;
}
