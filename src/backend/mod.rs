// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Orchestration pieces (buffers, staging, command
// submission, frame loop) are generic over the GpuDevice/Presenter seam so
// they can run against a recording mock in tests.

pub mod barrier;
pub mod buffer;
pub mod commands;
pub mod device;
pub mod frame;
pub mod gpu;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod staging;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod mock;

pub use buffer::Buffer;
pub use commands::CommandContext;
pub use device::DeviceContext;
pub use frame::FrameLoop;
pub use gpu::{GpuDevice, Presenter};
pub use pipeline::ComputePipeline;
pub use shader::ShaderLoader;
pub use staging::StagingBuffer;
pub use swapchain::Swapchain;
