// Pipeline barriers
//
// Everything runs on a single queue family, so barriers only order execution
// and make writes visible. Ownership is never transferred.

use ash::vk;

use super::gpu::GpuDevice;

/// One side of a buffer hand-off: the stage and the access it performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAccess {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl BufferAccess {
    pub const TRANSFER_WRITE: Self = Self {
        stage: vk::PipelineStageFlags::TRANSFER,
        access: vk::AccessFlags::TRANSFER_WRITE,
    };

    pub const TRANSFER_READ: Self = Self {
        stage: vk::PipelineStageFlags::TRANSFER,
        access: vk::AccessFlags::TRANSFER_READ,
    };

    pub const COMPUTE_READ: Self = Self {
        stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        access: vk::AccessFlags::SHADER_READ,
    };

    pub const COMPUTE_WRITE: Self = Self {
        stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        access: vk::AccessFlags::SHADER_WRITE,
    };

    pub const COMPUTE_READ_WRITE: Self = Self {
        stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        access: vk::AccessFlags::from_raw(
            vk::AccessFlags::SHADER_READ.as_raw() | vk::AccessFlags::SHADER_WRITE.as_raw(),
        ),
    };

    pub const HOST_READ: Self = Self {
        stage: vk::PipelineStageFlags::HOST,
        access: vk::AccessFlags::HOST_READ,
    };
}

/// Whole-buffer barrier from `src` to `dst` with no queue family transfer.
pub fn buffer_barrier(
    buffer: vk::Buffer,
    src: BufferAccess,
    dst: BufferAccess,
) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(src.access)
        .dst_access_mask(dst.access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}

/// Record a barrier guarding one buffer between two stages.
pub fn record_buffer_handoff<D: GpuDevice + ?Sized>(
    device: &D,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    src: BufferAccess,
    dst: BufferAccess,
) {
    device.cmd_pipeline_barrier(
        cmd,
        src.stage,
        dst.stage,
        vk::DependencyFlags::empty(),
        &[buffer_barrier(buffer, src, dst)],
        &[],
    );
}

/// UNDEFINED -> PRESENT_SRC_KHR for freshly created swapchain images.
pub fn present_transitions(images: &[vk::Image]) -> Vec<vk::ImageMemoryBarrier> {
    let color_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    images
        .iter()
        .map(|&image| {
            vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_range)
                .build()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn buffer_barrier_names_exact_masks() {
        let buffer = vk::Buffer::from_raw(42);
        let barrier = buffer_barrier(
            buffer,
            BufferAccess::TRANSFER_WRITE,
            BufferAccess::COMPUTE_READ_WRITE,
        );
        assert_eq!(barrier.buffer, buffer);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(
            barrier.dst_access_mask,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(barrier.offset, 0);
        assert_eq!(barrier.size, vk::WHOLE_SIZE);
    }

    #[test]
    fn no_queue_family_ownership_transfer() {
        let barrier = buffer_barrier(
            vk::Buffer::from_raw(1),
            BufferAccess::COMPUTE_WRITE,
            BufferAccess::TRANSFER_READ,
        );
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn present_transitions_cover_every_image() {
        let images: Vec<_> = (1..=3).map(vk::Image::from_raw).collect();
        let barriers = present_transitions(&images);
        assert_eq!(barriers.len(), 3);
        for (barrier, image) in barriers.iter().zip(&images) {
            assert_eq!(barrier.image, *image);
            assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
            assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
            assert_eq!(
                barrier.subresource_range.aspect_mask,
                vk::ImageAspectFlags::COLOR
            );
        }
    }
}
