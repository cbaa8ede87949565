// Vulkan Device - instance, adapters and the logical device
//
// Responsibilities:
// - Instance creation with negotiated API version, validation layers and
//   debug utils (only what the driver actually exposes)
// - Adapter queries: properties, queue families, features, limits
// - Logical device + one queue per distinct queue family
// - Memory allocator setup
//
// Resource creation lives in buffer.rs, command.rs, descriptor.rs and
// sync.rs; vulkan.rs maps the backend trait onto those.

use super::vulkan::{from_vk_device_type, from_vk_queue_flags};
use crate::rhi::definition::{QueueFlags, QueueType};
use crate::rhi::handle::{AllocationHandle, PhysicalDeviceHandle};
use crate::rhi::physical_device::{
    negotiate_api_version, supports_api_version, DeviceFeatures, DeviceLimits, PhysicalDevice,
    QueueFamilyIndices,
};
use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr::Swapchain};
use ash::vk::{self, Handle};
use ash::Entry;
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Memory owned by a buffer or image
pub(super) struct TrackedMemory {
    pub allocation: Allocation,
    pub coherent: bool,
}

/// Everything that only exists once `create_device` succeeded
pub(super) struct LogicalDevice {
    pub device: ash::Device,
    pub families: QueueFamilyIndices,
    pub queues: [vk::Queue; 3],
    pub swapchain_loader: Option<Swapchain>,
    pub allocator: Mutex<Option<Allocator>>,
    pub memory: Mutex<HashMap<AllocationHandle, TrackedMemory>>,
    pub non_coherent_atom_size: u64,
}

impl LogicalDevice {
    pub fn queue(&self, queue_type: QueueType) -> vk::Queue {
        self.queues[queue_type.index()]
    }
}

/// Vulkan backend with automatic cleanup
pub struct VulkanDevice {
    _entry: Entry,
    pub(super) instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    api_version: u32,
    gpu_markers: bool,
    pub(super) logical: Option<LogicalDevice>,
    next_allocation: AtomicU64,
}

impl VulkanDevice {
    /// Create the instance
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging tools
    /// * `enable_validation` - Enable validation layers (when installed)
    /// * `gpu_markers` - Name objects through debug utils
    pub fn new(app_name: &str, enable_validation: bool, gpu_markers: bool) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Negotiate the API version
        let driver_version = entry
            .try_enumerate_instance_version()
            .context("Failed to query the instance version")?
            .unwrap_or(vk::API_VERSION_1_0);
        let api_version = negotiate_api_version(vk::API_VERSION_1_3, driver_version);

        // Step 3: Create instance
        let (instance, has_debug_utils) = Self::create_instance(&entry, app_name, api_version, enable_validation)?;

        // Step 4: Setup debug messenger if validation enabled
        let debug_utils = if has_debug_utils && (enable_validation || gpu_markers) {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        Ok(Self {
            _entry: entry,
            instance,
            gpu_markers: gpu_markers && debug_utils.is_some(),
            debug_utils,
            api_version,
            logical: None,
            next_allocation: AtomicU64::new(1),
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        api_version: u32,
        enable_validation: bool,
    ) -> Result<(ash::Instance, bool)> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("rhi-core")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        // Extensions (only the ones the driver has)
        let available_extensions = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?;
        let has_debug_utils = available_extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == DebugUtils::name());
        let mut extensions: Vec<*const c_char> = Vec::new();
        if has_debug_utils {
            extensions.push(DebugUtils::name().as_ptr());
        } else {
            log::warn!("Instance extension {:?} is not available", DebugUtils::name());
        }

        // Validation layers
        let mut layer_names: Vec<*const c_char> = Vec::new();
        if enable_validation {
            let available_layers = entry
                .enumerate_instance_layer_properties()
                .context("Failed to enumerate instance layers")?;
            let has_validation = available_layers
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
            if has_validation {
                layer_names.push(VALIDATION_LAYER.as_ptr());
            } else {
                log::warn!("Validation layer {:?} is not available", VALIDATION_LAYER);
            }
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok((instance, has_debug_utils))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

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

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    // =========================================================================
    // ADAPTERS
    // =========================================================================

    pub(super) fn enumerate_adapters(&self) -> Result<Vec<PhysicalDevice>> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        Ok(devices
            .into_iter()
            .map(|device| {
                let props = unsafe { self.instance.get_physical_device_properties(device) };
                let memory_props = unsafe { self.instance.get_physical_device_memory_properties(device) };
                let memory = memory_props.memory_heaps[..memory_props.memory_heap_count as usize]
                    .iter()
                    .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                    .map(|heap| heap.size)
                    .sum();
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned();

                PhysicalDevice::new(
                    props.api_version,
                    props.driver_version,
                    props.vendor_id,
                    from_vk_device_type(props.device_type),
                    name,
                    memory,
                    PhysicalDeviceHandle::from_raw(device.as_raw()),
                )
            })
            .collect())
    }

    pub(super) fn adapter_queue_families(&self, physical_device: &PhysicalDevice) -> Vec<QueueFlags> {
        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(raw_physical_device(physical_device))
        };
        families
            .iter()
            .map(|family| from_vk_queue_flags(family.queue_flags))
            .collect()
    }

    pub(super) fn adapter_features(&self, physical_device: &PhysicalDevice) -> DeviceFeatures {
        let mut features_12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features_13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features_12);
        // 1.3 features stay unset (false) on older instances or adapters
        if supports_api_version(self.api_version, physical_device.api_version(), 1, 3) {
            features2 = features2.push_next(&mut features_13);
        }
        unsafe {
            self.instance
                .get_physical_device_features2(raw_physical_device(physical_device), &mut features2)
        };
        let core = features2.features;

        DeviceFeatures {
            sampler_anisotropy: core.sampler_anisotropy == vk::TRUE,
            fill_mode_non_solid: core.fill_mode_non_solid == vk::TRUE,
            wide_lines: core.wide_lines == vk::TRUE,
            image_cube_array: core.image_cube_array == vk::TRUE,
            descriptor_binding_partially_bound: features_12.descriptor_binding_partially_bound == vk::TRUE,
            timeline_semaphore: features_12.timeline_semaphore == vk::TRUE,
            dynamic_rendering: features_13.dynamic_rendering == vk::TRUE,
            shader_float16: features_12.shader_float16 == vk::TRUE,
            shader_int16: core.shader_int16 == vk::TRUE,
            subgroup_size_control: features_13.subgroup_size_control == vk::TRUE,
            shader_demote_to_helper_invocation: features_13.shader_demote_to_helper_invocation == vk::TRUE,
        }
    }

    pub(super) fn adapter_limits(&self, physical_device: &PhysicalDevice) -> DeviceLimits {
        let props = unsafe {
            self.instance
                .get_physical_device_properties(raw_physical_device(physical_device))
        };
        let limits = props.limits;

        DeviceLimits {
            max_texture_1d_dimension: limits.max_image_dimension1_d,
            max_texture_2d_dimension: limits.max_image_dimension2_d,
            max_texture_3d_dimension: limits.max_image_dimension3_d,
            max_texture_cube_dimension: limits.max_image_dimension_cube,
            max_texture_array_layers: limits.max_image_array_layers,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            timestamp_period: limits.timestamp_period,
            timestamp_compute_and_graphics: limits.timestamp_compute_and_graphics == vk::TRUE,
        }
    }

    // =========================================================================
    // LOGICAL DEVICE
    // =========================================================================

    pub(super) fn create_logical_device(
        &mut self,
        physical_device: &PhysicalDevice,
        families: &QueueFamilyIndices,
        features: &DeviceFeatures,
    ) -> Result<()> {
        let vk_physical_device = raw_physical_device(physical_device);

        // One queue per distinct family, queue types may share a family
        let unique_families: HashSet<u32> = [families.graphics, families.compute, families.copy]
            .into_iter()
            .collect();
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        // Device extensions (only the ones the adapter has)
        let available_extensions = unsafe {
            self.instance
                .enumerate_device_extension_properties(vk_physical_device)
        }
        .context("Failed to enumerate device extensions")?;
        let has_swapchain = available_extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == Swapchain::name());
        let mut extensions: Vec<*const c_char> = Vec::new();
        if has_swapchain {
            extensions.push(Swapchain::name().as_ptr());
        } else {
            log::warn!("Device extension {:?} is not available, presenting is disabled", Swapchain::name());
        }

        // Features
        let core = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(features.sampler_anisotropy)
            .fill_mode_non_solid(features.fill_mode_non_solid)
            .wide_lines(features.wide_lines)
            .image_cube_array(features.image_cube_array)
            .shader_int16(features.shader_int16)
            .build();
        let mut features_12 = vk::PhysicalDeviceVulkan12Features::builder()
            .descriptor_binding_partially_bound(features.descriptor_binding_partially_bound)
            .timeline_semaphore(features.timeline_semaphore)
            .shader_float16(features.shader_float16);
        let mut features_13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(features.dynamic_rendering)
            .subgroup_size_control(features.subgroup_size_control)
            .shader_demote_to_helper_invocation(features.shader_demote_to_helper_invocation);
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .features(core)
            .push_next(&mut features_12);
        if supports_api_version(self.api_version, physical_device.api_version(), 1, 3) {
            features2 = features2.push_next(&mut features_13);
        }

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = unsafe { self.instance.create_device(vk_physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queues = QueueType::ALL.map(|queue_type| unsafe { device.get_device_queue(families.get(queue_type), 0) });

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: self.instance.clone(),
            device: device.clone(),
            physical_device: vk_physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e).context("Failed to create memory allocator");
            }
        };

        let swapchain_loader = has_swapchain.then(|| Swapchain::new(&self.instance, &device));
        let non_coherent_atom_size = self.adapter_limits(physical_device).non_coherent_atom_size;

        let logical = LogicalDevice {
            device,
            families: *families,
            queues,
            swapchain_loader,
            allocator: Mutex::new(Some(allocator)),
            memory: Mutex::new(HashMap::new()),
            non_coherent_atom_size,
        };

        for queue_type in QueueType::ALL {
            self.set_object_name(&logical, logical.queue(queue_type), queue_type.as_str());
        }
        self.logical = Some(logical);

        Ok(())
    }

    pub(super) fn logical(&self) -> Result<&LogicalDevice> {
        self.logical
            .as_ref()
            .context("The logical device hasn't been created")
    }

    pub(super) fn next_allocation_handle(&self) -> AllocationHandle {
        AllocationHandle::from_raw(self.next_allocation.fetch_add(1, Ordering::Relaxed))
    }

    /// Label an object for debuggers and validation messages
    pub(super) fn set_object_name<H: Handle>(&self, logical: &LogicalDevice, object: H, name: &str) {
        if !self.gpu_markers {
            return;
        }
        let (Some((debug_utils, _)), Ok(name)) = (&self.debug_utils, CString::new(name)) else {
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(object.as_raw())
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(logical.device.handle(), &name_info) } {
            log::warn!("Failed to name {:?} object: {}", H::TYPE, e);
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        if let Some(logical) = &self.logical {
            unsafe { logical.device.device_wait_idle() }?;
        }
        Ok(())
    }
}

pub(super) fn raw_physical_device(physical_device: &PhysicalDevice) -> vk::PhysicalDevice {
    vk::PhysicalDevice::from_raw(physical_device.handle().as_raw())
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("Failed to wait for the device before destroying it: {:#}", e);
        }

        // Cleanup in reverse order
        unsafe {
            if let Some(logical) = self.logical.take() {
                let leaked = logical.memory.lock().len();
                if leaked > 0 {
                    log::error!("{} allocations are still alive at device destruction", leaked);
                }
                logical.memory.lock().clear();
                drop(logical.allocator.lock().take());
                logical.device.destroy_device(None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
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
