// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation for the window
// - Physical device selection (prefer discrete GPU with graphics + present)
// - Logical device + queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue family indices chosen for this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Both families, deduplicated, for swapchain sharing and queue creation
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Everything the swapchain builder needs to know about the surface
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Instance-level handles: instance, debug messenger, surface.
///
/// Filled in step by step; whatever exists is released on drop, so an early
/// return from `Device::new` leaks nothing.
struct InstanceContext {
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    entry: Entry,
}

impl InstanceContext {
    /// Takes ownership of `instance`; messenger and surface start empty
    fn new(entry: Entry, instance: ash::Instance) -> Self {
        Self {
            surface: vk::SurfaceKHR::null(),
            surface_loader: ash::khr::surface::Instance::new(&entry, &instance),
            debug_utils: None,
            instance,
            entry,
        }
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            // Null surface is ignored
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan device wrapper with automatic cleanup.
///
/// Created once at startup and shared as `Arc<Device>` with every component
/// that needs it.
pub struct Device {
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub swapchain_loader: ash::khr::swapchain::Device,

    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    // Dropped after `Drop for Device` has destroyed the logical device
    context: InstanceContext,
}

impl Device {
    /// Create the Vulkan device for a window
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `window` - Window the surface is created for
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Arc<Self>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        log::info!("Creating Vulkan device: {}", app_name);

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let surface_extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query surface extensions")?;
        let instance =
            Self::create_instance(&entry, app_name, enable_validation, surface_extensions)?;

        let mut context = InstanceContext::new(entry, instance);

        if enable_validation {
            context.debug_utils = Some(Self::setup_debug_messenger(
                &context.entry,
                &context.instance,
            )?);
        }

        context.surface = unsafe {
            ash_window::create_surface(
                &context.entry,
                &context.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        let instance = &context.instance;
        let (physical_device, queue_families) =
            Self::pick_physical_device(instance, &context.surface_loader, context.surface)?;

        let device = Self::create_logical_device(instance, physical_device, queue_families)?;
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
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
        log::debug!("Queue families: {:?}", queue_families);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e).context("Failed to create memory allocator");
            }
        };

        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            swapchain_loader,
            queue_families,
            graphics_queue,
            present_queue,
            context,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        surface_extensions: &[*const c_char],
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"No Engine")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions = surface_extensions.to_vec();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
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
            .context("Failed to set up debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("Failed to find GPUs with Vulkan support");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            let Some(families) =
                Self::find_queue_families(instance, surface_loader, surface, device)?
            else {
                continue;
            };

            if !Self::supports_swapchain(instance, device)? {
                continue;
            }

            // A device that can't present anything to this surface is useless
            let formats = unsafe {
                surface_loader.get_physical_device_surface_formats(device, surface)
            }?;
            let present_modes = unsafe {
                surface_loader.get_physical_device_surface_present_modes(device, surface)
            }?;
            if formats.is_empty() || present_modes.is_empty() {
                continue;
            }

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("Failed to find a suitable GPU"))
    }

    fn find_queue_families(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<QueueFamilies>> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics = None;
        let mut present = None;

        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            let supports_present = unsafe {
                surface_loader.get_physical_device_surface_support(device, index, surface)
            }?;
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);

            // Prefer one family that does both
            if supports_graphics && supports_present {
                return Ok(Some(QueueFamilies {
                    graphics: index,
                    present: index,
                }));
            }
            if supports_graphics && graphics.is_none() {
                graphics = Some(index);
            }
            if supports_present && present.is_none() {
                present = Some(index);
            }
        }

        Ok(graphics
            .zip(present)
            .map(|(graphics, present)| QueueFamilies { graphics, present }))
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<bool> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
        Ok(extensions.iter().any(|ext| {
            ext.extension_name_as_c_str()
                .is_ok_and(|name| name == ash::khr::swapchain::NAME)
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.context.surface
    }

    /// Query surface capabilities, formats and present modes
    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .context
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.physical_device, self.surface())
                    .context("Failed to query surface capabilities")?,
                formats: self
                    .context
                    .surface_loader
                    .get_physical_device_surface_formats(self.physical_device, self.surface())
                    .context("Failed to query surface formats")?,
                present_modes: self
                    .context
                    .surface_loader
                    .get_physical_device_surface_present_modes(self.physical_device, self.surface())
                    .context("Failed to query present modes")?,
            })
        }
    }

    /// Wait for device to be idle (e.g., before cleanup or swapchain rebuild)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // The allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
        }
        // `context` drops next: surface, messenger, instance
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_family_is_not_duplicated() {
        let families = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        assert_eq!(families.unique(), vec![0]);
    }

    #[test]
    fn distinct_families_are_both_listed() {
        let families = QueueFamilies {
            graphics: 0,
            present: 2,
        };
        assert_eq!(families.unique(), vec![0, 2]);
    }

    #[test]
    fn context_without_surface_tears_down() -> Result<()> {
        // Machines without a Vulkan loader have nothing to release
        let Ok(entry) = (unsafe { Entry::load() }) else {
            return Ok(());
        };
        let Ok(instance) = Device::create_instance(&entry, "context test", false, &[]) else {
            return Ok(());
        };

        // State of `Device::new` when surface creation or device picking fails
        let context = InstanceContext::new(entry, instance);
        assert_eq!(context.surface, vk::SurfaceKHR::null());
        assert!(context.debug_utils.is_none());
        drop(context);
        Ok(())
    }
}
