// Vulkan device context - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (first device that can draw and present)
// - Logical device + graphics queue creation
// - Command pool and one-time submit plumbing

use super::error::RendererError;
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use std::ffi::{CStr, CString};

/// Required Vulkan device features for our renderer
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    full_draw_index_uint32: vk::TRUE,
    image_cube_array: vk::TRUE,
    geometry_shader: vk::TRUE,
    tessellation_shader: vk::TRUE,
    depth_clamp: vk::TRUE,
    depth_bias_clamp: vk::TRUE,
    fill_mode_non_solid: vk::TRUE,
    multi_viewport: vk::TRUE,
    sampler_anisotropy: vk::TRUE,
    texture_compression_bc: vk::TRUE,
    pipeline_statistics_query: vk::TRUE,
    shader_clip_distance: vk::TRUE,
    shader_cull_distance: vk::TRUE,
    shader_resource_min_lod: vk::TRUE,

    ..unsafe { std::mem::zeroed() }
};

/// Owns the instance, logical device, graphics queue, command pool, and the
/// reusable fence used for synchronous one-time submissions. Created once at
/// startup; everything else in the backend borrows it.
pub struct DeviceContext {
    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Command submission
    command_pool: vk::CommandPool,
    onetime_fence: vk::Fence,

    // Extension loaders
    pub surface_loader: khr::Surface,
    pub swapchain_loader: khr::Swapchain,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    /// Create the device context.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `push_constant_size` - Minimum push-constant budget a device must offer
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(
        app_name: &str,
        push_constant_size: u32,
        enable_validation: bool,
    ) -> Result<Self, RendererError> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }.map_err(|e| {
            RendererError::InitializationFailed(format!(
                "failed to load Vulkan library: {e}. Is Vulkan installed?"
            ))
        })?;

        let instance = Self::create_instance(&entry, app_name, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, graphics_queue_family) =
            Self::pick_physical_device(&entry, &instance, push_constant_size)?;

        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

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

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        // Unsignaled; only ever used by submit() for one-time waits.
        let fence_info = vk::FenceCreateInfo::builder();
        let onetime_fence = unsafe { device.create_fence(&fence_info, None) }?;

        let surface_loader = khr::Surface::new(&entry, &instance);
        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        Ok(Self {
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            command_pool,
            onetime_fence,
            surface_loader,
            swapchain_loader,
            debug_utils,
            properties,
            memory_properties,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance, RendererError> {
        let app_name_cstr = CString::new(app_name)
            .map_err(|e| RendererError::InitializationFailed(e.to_string()))?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Debug utils plus the surface extensions for the build target
        let mut extensions = vec![
            ext::DebugUtils::name().as_ptr(),
            khr::Surface::name().as_ptr(),
        ];

        #[cfg(target_os = "windows")]
        extensions.push(khr::Win32Surface::name().as_ptr());

        #[cfg(not(target_os = "windows"))]
        extensions.push(khr::XlibSurface::name().as_ptr());

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            RendererError::InitializationFailed(format!("failed to create instance: {e}"))
        })?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT), RendererError> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

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

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// First device exposing a queue family that can draw, can present to the
    /// target windowing system, and whose push-constant budget covers
    /// `push_constant_size`.
    fn pick_physical_device(
        entry: &Entry,
        instance: &ash::Instance,
        push_constant_size: u32,
    ) -> Result<(vk::PhysicalDevice, u32), RendererError> {
        if push_constant_size > 128 {
            log::warn!(
                "requested push-constant size ({}) exceeds the 128-byte portable minimum",
                push_constant_size
            );
        }

        let devices = unsafe { instance.enumerate_physical_devices() }?;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            if props.limits.max_push_constants_size < push_constant_size {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            for (family, family_props) in queue_families.iter().enumerate() {
                let family = family as u32;
                if family_props.queue_count == 0 {
                    continue;
                }
                if !family_props.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    continue;
                }
                if !queue_family_can_present(entry, instance, device, family) {
                    continue;
                }
                return Ok((device, family));
            }
        }

        Err(RendererError::NoDeviceFound)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue), RendererError> {
        let extension = khr::Swapchain::name();
        let available =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
        let present = available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == extension);
        if !present {
            return Err(RendererError::InitializationFailed(format!(
                "device extension {} not present",
                extension.to_string_lossy()
            )));
        }

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [extension.as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| {
                RendererError::InitializationFailed(format!("failed to create device: {e}"))
            })?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    // =========================================================================
    // COMMAND BUFFERS
    // =========================================================================

    pub fn allocate_command_buffers(
        &self,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>, RendererError> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        Ok(buffers)
    }

    /// Submit command buffers with no frame synchronization attached. With
    /// `onetime` set, the reusable fence is signaled on completion and waited
    /// on before returning, so the buffers can be freed or re-recorded
    /// immediately after.
    pub fn submit(&self, buffers: &[vk::CommandBuffer], onetime: bool) -> Result<(), RendererError> {
        let submit_info = vk::SubmitInfo::builder().command_buffers(buffers).build();

        let fence = if onetime {
            self.onetime_fence
        } else {
            vk::Fence::null()
        };

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)?;
        }

        if onetime {
            self.wait_fences(&[self.onetime_fence], true, u64::MAX)?;
            self.reset_fences(&[self.onetime_fence])?;
        }

        Ok(())
    }

    /// Free command buffers whose completion has already been observed, e.g.
    /// after a fenced one-time submit. Does not wait for the device.
    pub fn free_completed(&self, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(self.command_pool, buffers) };
    }

    /// Free command buffers after waiting for the device to go idle. Teardown
    /// path only (shutdown, pipeline rebuild); never call this per frame.
    pub fn free_command_buffers(&self, buffers: &mut Vec<vk::CommandBuffer>) {
        if buffers.is_empty() {
            return;
        }

        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.free_command_buffers(self.command_pool, buffers);
        }
        buffers.clear();
    }

    // =========================================================================
    // FENCES
    // =========================================================================

    pub fn create_fence(&self, signaled: bool) -> Result<vk::Fence, RendererError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.device.create_fence(&fence_info, None) }?;
        Ok(fence)
    }

    pub fn wait_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), RendererError> {
        unsafe { self.device.wait_for_fences(fences, wait_all, timeout_ns) }?;
        Ok(())
    }

    pub fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), RendererError> {
        unsafe { self.device.reset_fences(fences) }?;
        Ok(())
    }

    pub fn destroy_fence(&self, fence: vk::Fence) {
        if fence != vk::Fence::null() {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    // =========================================================================
    // MEMORY
    // =========================================================================

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32, RendererError> {
        find_memory_type(&self.memory_properties, type_bits, properties)
    }

    /// Wait for the device to be idle (e.g., before teardown)
    pub fn wait_idle(&self) -> Result<(), RendererError> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    pub(crate) fn entry(&self) -> &Entry {
        &self.entry
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_fence(self.onetime_fence, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Find a memory type index satisfying both the type filter and the property
/// flags, or `NoMemoryType`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, RendererError> {
    for i in 0..memory_properties.memory_type_count {
        let has_type = (type_bits & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    Err(RendererError::NoMemoryType)
}

/// Surfaceless presentation-support check used during device selection. On
/// Windows the Win32 query needs no surface; on Xlib the query needs a live
/// display connection, so selection accepts the family and `Surface::create`
/// performs the authoritative per-surface check.
#[cfg(target_os = "windows")]
fn queue_family_can_present(
    entry: &Entry,
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> bool {
    let loader = khr::Win32Surface::new(entry, instance);
    unsafe { loader.get_physical_device_win32_presentation_support(physical_device, queue_family) }
}

#[cfg(not(target_os = "windows"))]
fn queue_family_can_present(
    _entry: &Entry,
    _instance: &ash::Instance,
    _physical_device: vk::PhysicalDevice,
    _queue_family: u32,
) -> bool {
    true
}

// Debug callback for validation layers. Fire-and-forget diagnostics; never
// affects control flow.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(
        types: &[(u32, vk::MemoryPropertyFlags)],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, (heap_index, flags)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: *heap_index,
            };
        }
        props
    }

    #[test]
    fn find_memory_type_respects_type_bits() {
        let props = memory_properties(&[
            (0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            (0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        ]);

        // Type 0 is masked out by the filter, so type 1 must win.
        let index = find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn find_memory_type_requires_all_properties() {
        let props = memory_properties(&[
            (0, vk::MemoryPropertyFlags::HOST_VISIBLE),
            (
                0,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        ]);

        let wanted =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b11, wanted).unwrap(), 1);
    }

    #[test]
    fn find_memory_type_reports_no_memory_type() {
        let props = memory_properties(&[(0, vk::MemoryPropertyFlags::HOST_VISIBLE)]);
        let result = find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert!(matches!(result, Err(RendererError::NoMemoryType)));
    }
}
