// Surface - platform window connection
//
// Maps raw window handles onto the matching VK_KHR_*_surface extension.
// Only the platforms we actually test on are wired up.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use winit::window::Window;

pub struct Surface {
    pub loader: khr::Surface,
    pub handle: vk::SurfaceKHR,
}

/// Instance extensions needed to create a surface for this display
pub fn required_extensions(window: &Window) -> Result<Vec<&'static CStr>> {
    let display_handle = window
        .display_handle()
        .context("Failed to get display handle")?
        .as_raw();

    let platform = match display_handle {
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        other => anyhow::bail!("Unsupported display handle type: {:?}", other),
    };

    Ok(vec![khr::Surface::name(), platform])
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// The window must outlive the returned surface.
    pub fn new(entry: &Entry, instance: &ash::Instance, window: &Window) -> Result<Self> {
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();

        let handle = unsafe {
            match (display_handle, window_handle) {
                (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                    let dpy = display
                        .display
                        .map(|d| d.as_ptr())
                        .context("Xlib display handle is null")?;
                    let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                        .dpy(dpy as *mut vk::Display)
                        .window(handle.window);
                    khr::XlibSurface::new(entry, instance)
                        .create_xlib_surface(&create_info, None)
                        .context("Failed to create Xlib surface")?
                }
                (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                    let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                        .display(display.display.as_ptr())
                        .surface(handle.surface.as_ptr());
                    khr::WaylandSurface::new(entry, instance)
                        .create_wayland_surface(&create_info, None)
                        .context("Failed to create Wayland surface")?
                }
                (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                    let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                    let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                    let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                        .hinstance(hinstance)
                        .hwnd(hwnd);
                    khr::Win32Surface::new(entry, instance)
                        .create_win32_surface(&create_info, None)
                        .context("Failed to create Win32 surface")?
                }
                _ => anyhow::bail!("Unsupported window handle type"),
            }
        };

        Ok(Self {
            loader: khr::Surface::new(entry, instance),
            handle,
        })
    }

    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family_index, self.handle)
                .context("Failed to query surface support")
        }
    }

    /// Must run after every swapchain on this surface is gone and before the
    /// instance is destroyed.
    pub fn destroy(&self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}
