// Compute pipeline
//
// Storage-buffer bindings 0..N in the compute stage, one descriptor set
// allocated up front. Everything here is created during setup and left
// untouched by the run loop.

use anyhow::Result;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

use super::device::DeviceContext;
use super::gpu::GpuDevice;

pub const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Layout bindings for `count` storage buffers visible to the compute stage.
pub fn storage_bindings(count: u32) -> Vec<vk::DescriptorSetLayoutBinding> {
    (0..count)
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build()
        })
        .collect()
}

pub struct ComputePipeline<D: GpuDevice = DeviceContext> {
    device: Arc<D>,
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    binding_count: u32,
}

impl<D: GpuDevice> ComputePipeline<D> {
    pub fn new(device: Arc<D>, code: &[u32], binding_count: u32) -> Result<Self> {
        // Handles start null and are filled in as they are created, so Drop
        // releases whatever exists if a later step fails
        let mut this = Self {
            device,
            set_layout: vk::DescriptorSetLayout::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            binding_count,
        };
        let device = this.device.clone();

        this.set_layout = device.create_storage_set_layout(binding_count)?;
        this.layout = device.create_pipeline_layout(this.set_layout)?;
        this.pipeline = device.create_compute_pipeline(this.layout, code)?;
        this.descriptor_pool = device.create_storage_descriptor_pool(binding_count)?;
        this.descriptor_set = device.allocate_descriptor_set(this.descriptor_pool, this.set_layout)?;

        log::debug!("Compute pipeline ready ({} storage bindings)", binding_count);
        Ok(this)
    }

    /// Point binding `i` at the whole of `buffers[i]`.
    ///
    /// # Panics
    /// If the number of buffers differs from the layout's binding count.
    pub fn bind_storage_buffers(&self, buffers: &[vk::Buffer]) {
        assert_eq!(
            buffers.len(),
            self.binding_count as usize,
            "pipeline has {} storage bindings",
            self.binding_count
        );
        self.device.write_storage_buffers(self.descriptor_set, buffers);
    }

    /// Bind the pipeline and its descriptor set, then dispatch `groups` x 1 x 1.
    pub fn record_dispatch(&self, cmd: vk::CommandBuffer, groups: u32) {
        self.device
            .cmd_bind_compute(cmd, self.pipeline, self.layout, self.descriptor_set);
        self.device.cmd_dispatch(cmd, groups, 1, 1);
    }
}

impl<D: GpuDevice> Drop for ComputePipeline<D> {
    fn drop(&mut self) {
        // The pool frees its set
        if self.descriptor_pool != vk::DescriptorPool::null() {
            self.device.destroy_descriptor_pool(self.descriptor_pool);
        }
        if self.pipeline != vk::Pipeline::null() {
            self.device.destroy_pipeline(self.pipeline);
        }
        if self.layout != vk::PipelineLayout::null() {
            self.device.destroy_pipeline_layout(self.layout);
        }
        if self.set_layout != vk::DescriptorSetLayout::null() {
            self.device.destroy_descriptor_set_layout(self.set_layout);
        }
    }
}
