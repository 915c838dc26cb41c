// Swapchain - Window presentation
//
// Resolves the requested image count, format, extent and present mode
// against what the surface supports. Images are never rendered to; the
// workload only needs them acquired and presented.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::device::DeviceContext;
use super::gpu::Presenter;
use crate::config::SwapchainConfig;

pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    swapchain_loader: khr::Swapchain,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(device: Arc<DeviceContext>, config: &SwapchainConfig) -> Result<Self> {
        let surface = device
            .surface()
            .context("Swapchain requested on a device without a surface")?;

        let caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(device.physical_device, surface.handle)
        }
        .context("Failed to query surface capabilities")?;
        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(device.physical_device, surface.handle)
        }
        .context("Failed to query surface formats")?;
        let present_modes = unsafe {
            surface
                .loader
                .get_physical_device_surface_present_modes(device.physical_device, surface.handle)
        }
        .context("Failed to query present modes")?;

        let image_count = choose_min_image_count(&caps, config.min_image_count)?;
        let surface_format = choose_surface_format(&formats)?;
        let extent = choose_extent(&caps, config.image_width, config.image_height);
        let pre_transform = choose_pre_transform(&caps);
        let composite_alpha = choose_composite_alpha(&caps)?;
        let image_usage = choose_image_usage(&caps)?;
        let present_mode = choose_present_mode(&present_modes, config.vk_present_mode()?);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            surface_format.format,
            present_mode
        );

        let swapchain_loader = khr::Swapchain::new(device.instance(), &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(err).context("Failed to get swapchain images");
            }
        };

        // Views are created into self so Drop releases partial progress
        let mut this = Self {
            swapchain,
            swapchain_loader,
            images,
            image_views: Vec::new(),
            format: surface_format.format,
            device,
        };
        for i in 0..this.images.len() {
            let view = this.create_view(this.images[i])?;
            this.image_views.push(view);
        }

        log::info!("Created swapchain with {} images", this.images.len());
        Ok(this)
    }

    fn create_view(&self, image: vk::Image) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")
    }
}

impl Presenter for Swapchain {
    fn images(&self) -> &[vk::Image] {
        &self.images
    }

    fn acquire_next_image(&self, fence: vk::Fence) -> Result<u32> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                vk::Semaphore::null(),
                fence,
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain is suboptimal");
                }
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => anyhow::bail!("Swapchain out of date"),
            Err(e) => Err(e).context("vkAcquireNextImageKHR failed"),
        }
    }

    fn present(&self, queue: vk::Queue, image_index: u32) -> Result<()> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(_suboptimal) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => anyhow::bail!("Swapchain out of date"),
            Err(e) => Err(e).context("vkQueuePresentKHR failed"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// `requested` must lie within the surface's limits (max 0 = unbounded).
pub fn choose_min_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> Result<u32> {
    let too_many = caps.max_image_count > 0 && requested > caps.max_image_count;
    if requested < caps.min_image_count || too_many {
        anyhow::bail!(
            "Requested {} swapchain images, surface supports {}..={}",
            requested,
            caps.min_image_count,
            if caps.max_image_count == 0 {
                "unbounded".to_string()
            } else {
                caps.max_image_count.to_string()
            }
        );
    }
    Ok(requested)
}

/// Prefer sRGB BGRA, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .context("No suitable surface format")
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        log::warn!(
            "Identity transform unsupported, using {:?}",
            caps.current_transform
        );
        caps.current_transform
    }
}

pub fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> Result<vk::CompositeAlphaFlagsKHR> {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&alpha| caps.supported_composite_alpha.contains(alpha))
    .context("Surface supports no composite alpha mode")
}

/// Images are only acquired and presented, so colour attachment is all
/// they are created with.
pub fn choose_image_usage(caps: &vk::SurfaceCapabilitiesKHR) -> Result<vk::ImageUsageFlags> {
    let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
    anyhow::ensure!(
        caps.supported_usage_flags.contains(usage),
        "Surface image usage {:?} lacks {:?}",
        caps.supported_usage_flags,
        usage
    );
    Ok(usage)
}

/// The requested mode if available; FIFO is always supported.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        log::warn!("Present mode {:?} unavailable, falling back to FIFO", requested);
        vk::PresentModeKHR::FIFO
    }
}
