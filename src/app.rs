// Array-sum workload
//
// Uploads `element_count` ones once, then each unit of work zeroes the
// output, dispatches one work group per 32 elements and copies the scalar
// result back to a host-visible buffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::backend::barrier::{self, BufferAccess};
use crate::backend::buffer::MemoryBlock;
use crate::backend::{
    Buffer, CommandContext, ComputePipeline, DeviceContext, GpuDevice, ShaderLoader, StagingBuffer,
};
use crate::config::ComputeConfig;

/// Queue used for uploads, dispatch and readback.
pub const WORK_QUEUE: usize = 0;

/// Value every input element is initialised to.
const INPUT_VALUE: u32 = 1;

const RESULT_SIZE: vk::DeviceSize = std::mem::size_of::<u32>() as vk::DeviceSize;

pub fn expected_sum(element_count: u32) -> u64 {
    element_count as u64 * INPUT_VALUE as u64
}

pub fn check_sum(sum: u32, expected: u64) -> Result<()> {
    anyhow::ensure!(
        sum as u64 == expected,
        "GPU sum {} differs from expected {}",
        sum,
        expected
    );
    Ok(())
}

pub struct ArraySum<D: GpuDevice = DeviceContext> {
    // Declared in teardown order; buffers go before the block they live in
    pipeline: ComputePipeline<D>,
    staging: StagingBuffer<D>,
    readback: Buffer<D>,
    output: Buffer<D>,
    input: Buffer<D>,
    _block: MemoryBlock<D>,
    commands: CommandContext<D>,
    element_count: u32,
    group_count: u32,
}

impl<D: GpuDevice> ArraySum<D> {
    pub fn new(device: Arc<D>, config: &ComputeConfig) -> Result<Self> {
        let code = ShaderLoader::new(&config.shader_dir).load(&config.shader)?;
        Self::with_shader(device, config, &code)
    }

    /// Build the workload around already-loaded SPIR-V.
    pub fn with_shader(device: Arc<D>, config: &ComputeConfig, code: &[u32]) -> Result<Self> {
        config.validate()?;

        let commands = CommandContext::new(device.clone(), WORK_QUEUE)?;
        let mut staging = StagingBuffer::new(device.clone(), config.staging_capacity)?;

        // Input and output share one device-local block
        let storage_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::TRANSFER_SRC;
        let (block, offsets) = MemoryBlock::for_buffers(
            device.clone(),
            storage_usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            &[config.input_size(), RESULT_SIZE],
        )
        .context("Failed to allocate storage memory")?;
        let input = Buffer::sub_allocated(
            device.clone(),
            storage_usage,
            &block,
            offsets[0],
            config.input_size(),
        )
        .context("Failed to create input buffer")?;
        let output = Buffer::sub_allocated(device.clone(), storage_usage, &block, offsets[1], RESULT_SIZE)
            .context("Failed to create output buffer")?;
        let readback = Buffer::new(
            device.clone(),
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            RESULT_SIZE,
        )
        .context("Failed to create readback buffer")?;

        let pipeline = ComputePipeline::new(device.clone(), code, 2)?;
        pipeline.bind_storage_buffers(&[input.handle(), output.handle()]);

        let ones = vec![INPUT_VALUE; config.element_count as usize];
        staging.queue_upload_slice(input.handle(), 0, &ones);
        commands
            .submit(|device, cmd| {
                staging.record_flush(cmd);
                barrier::record_buffer_handoff(
                    device,
                    cmd,
                    input.handle(),
                    BufferAccess::TRANSFER_WRITE,
                    BufferAccess::COMPUTE_READ,
                );
                Ok(())
            })
            .context("Failed to upload input array")?;

        log::info!(
            "Array sum ready: {} elements in {} work groups",
            config.element_count,
            config.group_count()
        );

        Ok(Self {
            pipeline,
            staging,
            readback,
            output,
            input,
            _block: block,
            commands,
            element_count: config.element_count,
            group_count: config.group_count(),
        })
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Move every swapchain image to PRESENT_SRC once, before the first frame.
    pub fn transition_swapchain_images(&self, images: &[vk::Image]) -> Result<()> {
        self.commands.transition_to_present(images)
    }

    /// Zero the output, sum the input on the GPU and return the result.
    pub fn execute(&mut self) -> Result<u32> {
        self.readback.write(&[0u32])?;

        let output = self.output.handle();
        log::trace!(
            "Summing {:?} into {:?} with {} groups",
            self.input.handle(),
            output,
            self.group_count
        );
        let readback = self.readback.handle();
        self.staging.queue_upload_slice(output, 0, &[0u32]);

        let staging = &mut self.staging;
        let pipeline = &self.pipeline;
        let groups = self.group_count;
        self.commands.submit(|device, cmd| {
            staging.record_flush(cmd);
            barrier::record_buffer_handoff(
                device,
                cmd,
                output,
                BufferAccess::TRANSFER_WRITE,
                BufferAccess::COMPUTE_READ_WRITE,
            );

            pipeline.record_dispatch(cmd, groups);

            barrier::record_buffer_handoff(
                device,
                cmd,
                output,
                BufferAccess::COMPUTE_WRITE,
                BufferAccess::TRANSFER_READ,
            );
            device.cmd_copy_buffer(
                cmd,
                output,
                readback,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: RESULT_SIZE,
                }],
            );
            barrier::record_buffer_handoff(
                device,
                cmd,
                readback,
                BufferAccess::TRANSFER_WRITE,
                BufferAccess::HOST_READ,
            );
            Ok(())
        })?;

        let sum = self.readback.read::<u32>(1)?[0];
        log::info!("Sum: {}", sum);
        Ok(sum)
    }
}
