// Device Context - Core GPU interface
//
// Responsibilities:
// - Instance creation from config (plus surface/debug extensions when needed)
// - Physical device + queue family selection
// - Logical device + queue creation
// - Memory-type table for explicit allocation
//
// Built once at startup and shared as Arc<DeviceContext>; everything that
// touches the device holds a clone of that Arc.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};
use std::ptr::NonNull;
use std::sync::Arc;
use winit::window::Window;

use super::gpu::GpuDevice;
use super::memory::MemoryTypeTable;
use super::pipeline::{storage_bindings, ENTRY_POINT};
use super::shader::create_shader_module;
use super::surface::{self, Surface};
use crate::config::{Config, QueueRequest};

/// Instance-level handles, released on drop (surface, messenger, instance).
///
/// Built up step by step in `DeviceContext::new`, so an error after the
/// instance exists still tears down everything created so far.
struct InstanceHandles {
    instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface: Option<Surface>,
    entry: Entry,
}

impl Drop for InstanceHandles {
    fn drop(&mut self) {
        unsafe {
            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct DeviceContext {
    // Logical device is destroyed in Drop; instance handles drop after it
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    handles: InstanceHandles,

    queue_family_index: u32,
    queues: Vec<vk::Queue>,
    memory_types: MemoryTypeTable,
}

impl DeviceContext {
    /// Create the device context.
    ///
    /// # Arguments
    /// * `config` - Instance/device parameters
    /// * `window` - Window to present to; `None` for headless operation
    pub fn new(config: &Config, window: Option<&Window>) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", config.instance.application_name);

        let queue_request = config.device.queue_request()?;

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = cfg!(debug_assertions) && config.debug.validation;

        // Step 2: Create instance (and surface, if windowed)
        let instance = Self::create_instance(&entry, config, window, enable_validation)?;
        let mut handles = InstanceHandles {
            instance,
            debug_utils: None,
            surface: None,
            entry,
        };

        if enable_validation {
            handles.debug_utils =
                Some(Self::setup_debug_messenger(&handles.entry, &handles.instance)?);
        }

        if let Some(window) = window {
            handles.surface = Some(Surface::new(&handles.entry, &handles.instance, window)?);
        }

        // Step 3: Pick physical device and queue family
        let instance = &handles.instance;
        let (physical_device, queue_family_index) =
            Self::pick_physical_device(instance, &queue_request, handles.surface.as_ref())?;

        // Step 4: Create logical device and fetch queues
        let device = Self::create_logical_device(
            instance,
            physical_device,
            queue_family_index,
            &queue_request,
            config,
            handles.surface.is_some(),
        )?;

        let queues = (0..queue_request.count)
            .map(|i| unsafe { device.get_device_queue(queue_family_index, i) })
            .collect::<Vec<_>>();

        // Step 5: Report what was selected
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue family {} with {} queue(s), {} memory types",
            queue_family_index,
            queues.len(),
            memory_properties.memory_type_count
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            handles,
            queue_family_index,
            queues,
            memory_types: MemoryTypeTable::from_properties(&memory_properties),
        }))
    }

    fn create_instance(
        entry: &Entry,
        config: &Config,
        window: Option<&Window>,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let instance_config = &config.instance;
        let app_name = CString::new(instance_config.application_name.as_str())?;
        let engine_name = CString::new(instance_config.engine_name.as_str())?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(instance_config.vk_application_version())
            .engine_name(&engine_name)
            .engine_version(instance_config.vk_engine_version())
            .api_version(instance_config.vk_api_version()?);

        let mut extensions = to_cstrings(&instance_config.extensions)?;
        if let Some(window) = window {
            for name in surface::required_extensions(window)? {
                push_unique(&mut extensions, name);
            }
        }
        if enable_validation {
            push_unique(&mut extensions, ash::extensions::ext::DebugUtils::name());
        }

        let mut layers = to_cstrings(&instance_config.layers)?;
        if enable_validation {
            push_unique(&mut layers, c"VK_LAYER_KHRONOS_validation");
        }

        let extension_ptrs = as_ptrs(&extensions);
        let layer_ptrs = as_ptrs(&layers);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        log::debug!("Instance extensions: {:?}", extensions);
        log::debug!("Instance layers: {:?}", layers);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        request: &QueueRequest,
        surface: Option<&Surface>,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let mut family = None;
            for (index, family_props) in queue_families.iter().enumerate() {
                let index = index as u32;
                if !family_props.queue_flags.contains(request.flags)
                    || family_props.queue_count < request.count
                {
                    continue;
                }
                if request.present {
                    match surface {
                        Some(surface) if surface.supports_present(device, index)? => {}
                        _ => continue,
                    }
                }
                family = Some(index);
                break;
            }

            log::debug!(
                "Device {:?} ({:?}): queue family {:?}",
                unsafe { CStr::from_ptr(props.device_name.as_ptr()) },
                props.device_type,
                family
            );

            if let Some(family) = family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, family));
                }
            }
        }

        best_device.ok_or_else(|| {
            anyhow::anyhow!(
                "No GPU has a queue family with {:?} x{} (present: {})",
                request.flags,
                request.count,
                request.present
            )
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        request: &QueueRequest,
        config: &Config,
        windowed: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = vec![1.0; request.count as usize];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)
            .build();

        let mut extensions = to_cstrings(&config.device.extensions)?;
        if windowed {
            push_unique(&mut extensions, ash::extensions::khr::Swapchain::name());
        }
        if !config.device.layers.is_empty() {
            // Device layers are ignored by every current loader
            log::warn!("Ignoring device layers {:?}", config.device.layers);
        }

        let extension_ptrs = as_ptrs(&extensions);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.handles.instance
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.handles.surface.as_ref()
    }
}

impl GpuDevice for DeviceContext {
    fn get_queue(&self, index: usize) -> vk::Queue {
        match self.queues.get(index) {
            Some(&queue) => queue,
            None => panic!(
                "queue index {} out of range ({} queue(s) created)",
                index,
                self.queues.len()
            ),
        }
    }

    fn select_memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> u32 {
        self.memory_types.select(type_bits, required)
    }

    /// Wait for device to be idle
    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }

    fn create_buffer(&self, usage: vk::BufferUsageFlags, size: vk::DeviceSize) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe { self.device.create_buffer(&buffer_info, None) }.context("Failed to create buffer")
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> Result<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        unsafe { self.device.allocate_memory(&alloc_info, None) }
            .with_context(|| format!("Failed to allocate {} bytes from memory type {}", size, memory_type_index))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
            .context("Failed to bind buffer memory")
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map memory")?;

        NonNull::new(ptr as *mut u8).context("Driver returned a null mapping")
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder().queue_family_index(self.queue_family_index);

        unsafe { self.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;

        buffers
            .into_iter()
            .next()
            .context("Driver returned no command buffers")
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
        .context("Failed to reset command pool")
    }

    fn begin_one_time_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin command buffer")
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }.context("Failed to end command buffer")
    }

    fn submit(&self, queue: vk::Queue, cmd: vk::CommandBuffer) -> Result<()> {
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            self.device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
        }
        .context("Failed to submit command buffer")
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) }
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                dependency_flags,
                &[],
                buffer_barriers,
                image_barriers,
            )
        }
    }

    fn cmd_bind_compute(
        &self,
        cmd: vk::CommandBuffer,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[descriptor_set],
                &[],
            );
        }
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) }
    }

    fn create_storage_set_layout(&self, binding_count: u32) -> Result<vk::DescriptorSetLayout> {
        let bindings = storage_bindings(binding_count);
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .context("Failed to create descriptor set layout")
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_pipeline_layout(&self, set_layout: vk::DescriptorSetLayout) -> Result<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let create_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);

        unsafe { self.device.create_pipeline_layout(&create_info, None) }
            .context("Failed to create pipeline layout")
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_compute_pipeline(&self, layout: vk::PipelineLayout, code: &[u32]) -> Result<vk::Pipeline> {
        let module = create_shader_module(&self.device, code)?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(ENTRY_POINT)
            .build();
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };

        pipelines
            .map_err(|(_, err)| err)
            .context("Failed to create compute pipeline")?
            .into_iter()
            .next()
            .context("Driver returned no pipeline")
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_storage_descriptor_pool(&self, descriptor_count: u32) -> Result<vk::DescriptorPool> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count,
        }];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        unsafe { self.device.create_descriptor_pool(&create_info, None) }
            .context("Failed to create descriptor pool")
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // Frees the sets allocated from it
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let set_layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);

        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?
            .into_iter()
            .next()
            .context("Driver returned no descriptor set")
    }

    fn write_storage_buffers(&self, set: vk::DescriptorSet, buffers: &[vk::Buffer]) {
        let infos: Vec<[vk::DescriptorBufferInfo; 1]> = buffers
            .iter()
            .map(|&buffer| {
                [vk::DescriptorBufferInfo {
                    buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                }]
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(info)
                    .build()
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&writes, &[]) }
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        // Unsignaled: image acquisition is what signals it
        let fence_info = vk::FenceCreateInfo::builder();

        unsafe { self.device.create_fence(&fence_info, None) }.context("Failed to create fence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed to wait for fence")
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }.context("Failed to reset fence")
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::error!("{:?}", e);
        }

        // Surface, messenger and instance follow when `handles` drops
        unsafe { self.device.destroy_device(None) };
    }
}

fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| CString::new(name.as_str()).with_context(|| format!("Invalid name {:?}", name)))
        .collect()
}

fn push_unique(names: &mut Vec<CString>, name: &CStr) {
    if !names.iter().any(|existing| existing.as_c_str() == name) {
        names.push(name.to_owned());
    }
}

fn as_ptrs(names: &[CString]) -> Vec<*const c_char> {
    names.iter().map(|name| name.as_ptr()).collect()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
