//! Vulkan context: instance, window surface, physical device, logical device and queue.

use ash::khr::{acceleration_structure, deferred_host_operations, ray_tracing_pipeline, surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::os::raw::c_char;
use tracing::{debug, error, info, warn};

use super::{resource_err, APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::device::DeviceProperties;
use crate::error::{RtError, RtResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Ray tracing limits of a physical device, present only when both the
/// acceleration structure and ray tracing pipeline features are supported.
#[derive(Debug, Clone, Copy)]
struct RtLimits {
    shader_group_handle_size: u32,
    shader_group_handle_alignment: u32,
    shader_group_base_alignment: u32,
    max_ray_recursion_depth: u32,
    min_scratch_offset_alignment: u32,
}

/// Core Vulkan objects shared by every part of the backend.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_family: u32,
    /// Graphics queue, also used for presentation and transfers.
    pub queue: vk::Queue,
    pub surface: vk::SurfaceKHR,

    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,
    pub accel_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,

    pub properties: DeviceProperties,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanContext {
    /// Create the instance, the window surface and a ray-tracing capable device.
    ///
    /// # Safety
    /// The window behind the handles must outlive the context.
    pub unsafe fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        enable_validation: bool,
    ) -> RtResult<Self> {
        let entry = Entry::linked();

        let api_version = entry
            .try_enumerate_instance_version()
            .map_err(resource_err("instance"))?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            return Err(RtError::resource(
                "instance",
                format!(
                    "Vulkan 1.2 required, but only {}.{}.{} available",
                    vk::api_version_major(api_version),
                    vk::api_version_minor(api_version),
                    vk::api_version_patch(api_version)
                ),
            ));
        }

        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        let (debug_utils_loader, debug_messenger) = if enable_validation {
            Self::setup_debug_messenger(&entry, &instance)?
        } else {
            (None, None)
        };

        let surface = ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
            .map_err(resource_err("surface"))?;
        let surface_loader = surface::Instance::new(&entry, &instance);

        let (physical_device, queue_family, limits) = Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let props = instance.get_physical_device_properties(physical_device);
        let device_name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy().into_owned();

        let (device, queue) = Self::create_logical_device(&instance, physical_device, queue_family)?;

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let accel_loader = acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(&instance, &device);

        let properties = DeviceProperties {
            device_name,
            shader_group_handle_size: limits.shader_group_handle_size,
            shader_group_handle_alignment: limits.shader_group_handle_alignment,
            shader_group_base_alignment: limits.shader_group_base_alignment,
            max_ray_recursion_depth: limits.max_ray_recursion_depth,
            min_scratch_offset_alignment: limits.min_scratch_offset_alignment,
        };
        info!(
            device = %properties.device_name,
            handle_size = properties.shader_group_handle_size,
            base_alignment = properties.shader_group_base_alignment,
            max_recursion = properties.max_ray_recursion_depth,
            "selected ray tracing device"
        );

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
            surface,
            surface_loader,
            swapchain_loader,
            accel_loader,
            rt_pipeline_loader,
            properties,
            debug_utils_loader,
            debug_messenger,
        })
    }

    unsafe fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> RtResult<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(resource_err("instance"))?
            .to_vec();

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<*const c_char> = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        entry.create_instance(&create_info, None).map_err(resource_err("instance"))
    }

    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> RtResult<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(resource_err("debug messenger"))?;

        Ok((Some(debug_utils), Some(messenger)))
    }

    /// Pick the highest-rated device that can present to `surface` and trace rays.
    unsafe fn pick_physical_device(
        instance: &Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> RtResult<(vk::PhysicalDevice, u32, RtLimits)> {
        let devices = instance
            .enumerate_physical_devices()
            .map_err(resource_err("physical device"))?;

        if devices.is_empty() {
            return Err(RtError::resource("physical device", "no Vulkan-capable GPU found"));
        }

        let best = devices
            .iter()
            .filter_map(|&device| {
                let queue_family = Self::find_queue_family(instance, device, surface_loader, surface)?;
                let limits = Self::check_rt_support(instance, device)?;
                Some((device, queue_family, limits, Self::rate_device(instance, device)))
            })
            .max_by_key(|candidate| candidate.3);

        match best {
            Some((device, queue_family, limits, score)) => {
                debug!(score, queue_family, "physical device rated");
                Ok((device, queue_family, limits))
            }
            None => Err(RtError::resource(
                "physical device",
                "no GPU supports ray tracing pipelines and presentation",
            )),
        }
    }

    /// Rate a physical device (higher is better).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u64 {
        let props = instance.get_physical_device_properties(device);

        let mut score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 10_000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1_000,
            _ => 0,
        };

        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score += heap.size / (1024 * 1024);
            }
        }

        score
    }

    /// First queue family with graphics that can present to `surface`.
    unsafe fn find_queue_family(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        instance
            .get_physical_device_queue_family_properties(device)
            .iter()
            .enumerate()
            .map(|(i, family)| (i as u32, family))
            .find(|(i, family)| {
                family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && surface_loader
                        .get_physical_device_surface_support(device, *i, surface)
                        .unwrap_or(false)
            })
            .map(|(i, _)| i)
    }

    unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice) -> Option<RtLimits> {
        let extensions = instance.enumerate_device_extension_properties(device).ok()?;
        let has = |wanted: &CStr| {
            extensions
                .iter()
                .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };

        if !has(acceleration_structure::NAME) || !has(ray_tracing_pipeline::NAME) || !has(deferred_host_operations::NAME) {
            return None;
        }

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut rt_features)
            .push_next(&mut vulkan_12_features);
        instance.get_physical_device_features2(device, &mut features2);
        let core_features = features2.features;

        if accel_features.acceleration_structure != vk::TRUE || rt_features.ray_tracing_pipeline != vk::TRUE {
            return None;
        }
        let missing = missing_shader_features(&core_features, &vulkan_12_features);
        if !missing.is_empty() {
            let props = instance.get_physical_device_properties(device);
            let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
            warn!(device = %name, ?missing, "skipping device without required shader features");
            return None;
        }

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut accel_props);
        instance.get_physical_device_properties2(device, &mut props2);

        Some(RtLimits {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            min_scratch_offset_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
        })
    }

    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> RtResult<(Device, vk::Queue)> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let extensions: [*const c_char; 5] = [
            swapchain::NAME.as_ptr(),
            acceleration_structure::NAME.as_ptr(),
            ray_tracing_pipeline::NAME.as_ptr(),
            deferred_host_operations::NAME.as_ptr(),
            vk::KHR_BUFFER_DEVICE_ADDRESS_NAME.as_ptr(),
        ];

        let mut vulkan_12_features = required_vulkan_12_features();

        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(required_core_features())
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = instance
            .create_device(physical_device, &create_info, None)
            .map_err(resource_err("logical device"))?;

        let queue = device.get_device_queue(queue_family, 0);

        Ok((device, queue))
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Core features the ray tracing shaders declare capabilities for:
/// 64-bit geometry addresses and the format-less output image.
fn required_core_features() -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures::default()
        .shader_int64(true)
        .shader_storage_image_write_without_format(true)
}

/// Vulkan 1.2 features used by the shaders and the builders: device
/// addresses, scalar block layout and the non-uniformly indexed volume array.
fn required_vulkan_12_features() -> vk::PhysicalDeviceVulkan12Features<'static> {
    vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .scalar_block_layout(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .shader_storage_buffer_array_non_uniform_indexing(true)
        .shader_storage_image_array_non_uniform_indexing(true)
}

/// Names of required features `core` and `vulkan_12` do not report.
fn missing_shader_features(
    core: &vk::PhysicalDeviceFeatures,
    vulkan_12: &vk::PhysicalDeviceVulkan12Features,
) -> Vec<&'static str> {
    let core_required = required_core_features();
    let v12_required = required_vulkan_12_features();
    let checks = [
        ("shaderInt64", core_required.shader_int64, core.shader_int64),
        (
            "shaderStorageImageWriteWithoutFormat",
            core_required.shader_storage_image_write_without_format,
            core.shader_storage_image_write_without_format,
        ),
        ("bufferDeviceAddress", v12_required.buffer_device_address, vulkan_12.buffer_device_address),
        ("scalarBlockLayout", v12_required.scalar_block_layout, vulkan_12.scalar_block_layout),
        ("descriptorIndexing", v12_required.descriptor_indexing, vulkan_12.descriptor_indexing),
        ("runtimeDescriptorArray", v12_required.runtime_descriptor_array, vulkan_12.runtime_descriptor_array),
        (
            "shaderStorageBufferArrayNonUniformIndexing",
            v12_required.shader_storage_buffer_array_non_uniform_indexing,
            vulkan_12.shader_storage_buffer_array_non_uniform_indexing,
        ),
        (
            "shaderStorageImageArrayNonUniformIndexing",
            v12_required.shader_storage_image_array_non_uniform_indexing,
            vulkan_12.shader_storage_image_array_non_uniform_indexing,
        ),
    ];
    checks
        .iter()
        .filter(|(_, required, supported)| *required == vk::TRUE && *supported != vk::TRUE)
        .map(|(name, _, _)| *name)
        .collect()
}

/// Forwards validation messages to `tracing`.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", ?ty, "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", ?ty, "{}", message);
    } else {
        debug!(target: "vulkan", ?ty, "{}", message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_features_are_sufficient() {
        let missing = missing_shader_features(&required_core_features(), &required_vulkan_12_features());
        assert!(missing.is_empty(), "{missing:?}");
    }

    #[test]
    fn test_scalar_layout_and_image_indexing_required() {
        let core = required_core_features();
        let vulkan_12 = required_vulkan_12_features()
            .scalar_block_layout(false)
            .shader_storage_image_array_non_uniform_indexing(false);
        assert_eq!(
            missing_shader_features(&core, &vulkan_12),
            vec!["scalarBlockLayout", "shaderStorageImageArrayNonUniformIndexing"]
        );
    }

    #[test]
    fn test_format_less_output_write_required() {
        let core = required_core_features().shader_storage_image_write_without_format(false);
        assert_eq!(
            missing_shader_features(&core, &required_vulkan_12_features()),
            vec!["shaderStorageImageWriteWithoutFormat"]
        );
    }

    #[test]
    fn test_bare_device_misses_everything() {
        let missing = missing_shader_features(
            &vk::PhysicalDeviceFeatures::default(),
            &vk::PhysicalDeviceVulkan12Features::default(),
        );
        assert_eq!(missing.len(), 8);
    }
}
