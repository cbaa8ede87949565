// Physical device detection
//
// Candidates are ranked (discrete > integrated > virtual > cpu, then by
// memory) and tried in that order until one exposes every queue type.

use super::definition::{PhysicalDeviceType, QueueFlags, QueueType};
use super::handle::PhysicalDeviceHandle;

const VENDOR_NVIDIA: u32 = 0x10DE;
const VENDOR_AMD: [u32; 2] = [0x1002, 0x1022];
const VENDOR_INTEL: [u32; 3] = [0x8086, 0x163C, 0x8087];
const VENDOR_ARM: u32 = 0x13B5;
const VENDOR_QUALCOMM: u32 = 0x5143;

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalDevice {
    api_version: u32,
    driver_version: u32,
    vendor_id: u32,
    device_type: PhysicalDeviceType,
    name: String,
    memory: u64,
    handle: PhysicalDeviceHandle,
}

impl PhysicalDevice {
    pub fn new(
        api_version: u32,
        driver_version: u32,
        vendor_id: u32,
        device_type: PhysicalDeviceType,
        name: impl Into<String>,
        memory: u64,
        handle: PhysicalDeviceHandle,
    ) -> Self {
        Self {
            api_version,
            driver_version,
            vendor_id,
            device_type,
            name: name.into(),
            memory,
            handle,
        }
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn driver_version(&self) -> u32 {
        self.driver_version
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn device_type(&self) -> PhysicalDeviceType {
        self.device_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dedicated memory in bytes
    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory / 1024 / 1024
    }

    pub fn handle(&self) -> PhysicalDeviceHandle {
        self.handle
    }

    pub fn is_nvidia(&self) -> bool {
        self.vendor_id == VENDOR_NVIDIA
    }

    pub fn is_amd(&self) -> bool {
        VENDOR_AMD.contains(&self.vendor_id)
    }

    pub fn is_intel(&self) -> bool {
        VENDOR_INTEL.contains(&self.vendor_id)
    }

    pub fn is_arm(&self) -> bool {
        self.vendor_id == VENDOR_ARM
    }

    pub fn is_qualcomm(&self) -> bool {
        self.vendor_id == VENDOR_QUALCOMM
    }

    pub fn vendor_name(&self) -> &'static str {
        if self.is_nvidia() {
            "Nvidia"
        } else if self.is_amd() {
            "AMD"
        } else if self.is_intel() {
            "Intel"
        } else if self.is_arm() {
            "ARM"
        } else if self.is_qualcomm() {
            "Qualcomm"
        } else {
            "Unknown"
        }
    }

    pub fn api_version_string(&self) -> String {
        version_to_string(self.api_version)
    }
}

/// Decode a packed `variant.major.minor.patch` API version
pub fn version_to_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        (version >> 22) & 0x7f,
        (version >> 12) & 0x3ff,
        version & 0xfff
    )
}

pub const fn make_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

/// Use the newest version both the loader and the driver understand
/// Whether the instance and the adapter both speak at least `major.minor`
pub fn supports_api_version(instance_version: u32, device_version: u32, major: u32, minor: u32) -> bool {
    // Variant bits sit above the major version
    (instance_version.min(device_version) & 0x1fff_ffff) >= make_version(major, minor, 0)
}

pub fn negotiate_api_version(sdk_version: u32, driver_version: u32) -> u32 {
    if sdk_version > driver_version {
        log::warn!(
            "Falling back to API version {}. Please update your drivers to support API version {}.",
            version_to_string(driver_version),
            version_to_string(sdk_version)
        );
        driver_version
    } else {
        sdk_version
    }
}

/// Sort best candidate first. The sort is stable, so equal candidates keep
/// their enumeration order.
pub fn rank_physical_devices(devices: &mut [PhysicalDevice]) {
    devices.sort_by(|a, b| {
        b.device_type
            .cmp(&a.device_type)
            .then_with(|| b.memory.cmp(&a.memory))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub copy: u32,
}

impl QueueFamilyIndices {
    pub fn get(&self, queue_type: QueueType) -> u32 {
        match queue_type {
            QueueType::Graphics => self.graphics,
            QueueType::Compute => self.compute,
            QueueType::Copy => self.copy,
        }
    }
}

/// Pick a family for a single capability bit
///
/// Compute prefers a family without graphics, transfer prefers one with
/// neither graphics nor compute. Otherwise the first family exposing the bit.
pub fn find_queue_family(flag: QueueFlags, families: &[QueueFlags]) -> Option<u32> {
    let position = |excluded: QueueFlags| {
        families
            .iter()
            .position(|f| f.contains(flag) && !f.intersects(excluded))
            .map(|i| i as u32)
    };

    if flag.contains(QueueFlags::COMPUTE) {
        if let Some(index) = position(QueueFlags::GRAPHICS) {
            return Some(index);
        }
    }

    if flag.contains(QueueFlags::TRANSFER) {
        if let Some(index) = position(QueueFlags::GRAPHICS | QueueFlags::COMPUTE) {
            return Some(index);
        }
    }

    position(QueueFlags::empty())
}

/// Resolve all three queue types, `None` if any is missing
pub fn select_queue_families(families: &[QueueFlags]) -> Option<QueueFamilyIndices> {
    let graphics = find_queue_family(QueueFlags::GRAPHICS, families);
    let compute = find_queue_family(QueueFlags::COMPUTE, families);
    let copy = find_queue_family(QueueFlags::TRANSFER, families);

    if graphics.is_none() {
        log::error!("Graphics queue not supported.");
    }
    if compute.is_none() {
        log::error!("Compute queue not supported.");
    }
    if copy.is_none() {
        log::error!("Copy queue not supported.");
    }

    Some(QueueFamilyIndices {
        graphics: graphics?,
        compute: compute?,
        copy: copy?,
    })
}

/// Device features the RHI cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeatures {
    // Required
    pub sampler_anisotropy: bool,
    pub fill_mode_non_solid: bool,
    pub wide_lines: bool,
    pub image_cube_array: bool,
    pub descriptor_binding_partially_bound: bool,
    pub timeline_semaphore: bool,
    pub dynamic_rendering: bool,

    // Optional
    pub shader_float16: bool,
    pub shader_int16: bool,
    pub subgroup_size_control: bool,
    pub shader_demote_to_helper_invocation: bool,
}

impl DeviceFeatures {
    pub fn all() -> Self {
        Self {
            sampler_anisotropy: true,
            fill_mode_non_solid: true,
            wide_lines: true,
            image_cube_array: true,
            descriptor_binding_partially_bound: true,
            timeline_semaphore: true,
            dynamic_rendering: true,
            shader_float16: true,
            shader_int16: true,
            subgroup_size_control: true,
            shader_demote_to_helper_invocation: true,
        }
    }

    /// Features to enable given what the adapter supports
    ///
    /// # Panics
    /// When a required feature is unsupported.
    pub fn resolve(supported: &DeviceFeatures) -> DeviceFeatures {
        let required = [
            ("sampler_anisotropy", supported.sampler_anisotropy),
            ("fill_mode_non_solid", supported.fill_mode_non_solid),
            ("wide_lines", supported.wide_lines),
            ("image_cube_array", supported.image_cube_array),
            ("descriptor_binding_partially_bound", supported.descriptor_binding_partially_bound),
            ("timeline_semaphore", supported.timeline_semaphore),
            ("dynamic_rendering", supported.dynamic_rendering),
        ];
        for (name, is_supported) in required {
            assert!(is_supported, "The device doesn't support {}", name);
        }

        let optional = |name: &str, is_supported: bool| {
            if !is_supported {
                log::warn!("Optional feature {} is not supported, it will be disabled", name);
            }
            is_supported
        };

        DeviceFeatures {
            sampler_anisotropy: true,
            fill_mode_non_solid: true,
            wide_lines: true,
            image_cube_array: true,
            descriptor_binding_partially_bound: true,
            timeline_semaphore: true,
            dynamic_rendering: true,
            shader_float16: optional("shader_float16", supported.shader_float16),
            shader_int16: optional("shader_int16", supported.shader_int16),
            subgroup_size_control: optional("subgroup_size_control", supported.subgroup_size_control),
            shader_demote_to_helper_invocation: optional(
                "shader_demote_to_helper_invocation",
                supported.shader_demote_to_helper_invocation,
            ),
        }
    }
}

/// Limits read from the adapter properties
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub max_texture_1d_dimension: u32,
    pub max_texture_2d_dimension: u32,
    pub max_texture_3d_dimension: u32,
    pub max_texture_cube_dimension: u32,
    pub max_texture_array_layers: u32,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub non_coherent_atom_size: u64,
    pub max_bound_descriptor_sets: u32,
    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,
    pub timestamp_compute_and_graphics: bool,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_texture_1d_dimension: 16384,
            max_texture_2d_dimension: 16384,
            max_texture_3d_dimension: 2048,
            max_texture_cube_dimension: 16384,
            max_texture_array_layers: 2048,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            non_coherent_atom_size: 64,
            max_bound_descriptor_sets: 8,
            timestamp_period: 1.0,
            timestamp_compute_and_graphics: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(device_type: PhysicalDeviceType, memory_mb: u64, name: &str) -> PhysicalDevice {
        PhysicalDevice::new(
            make_version(1, 3, 0),
            1,
            VENDOR_NVIDIA,
            device_type,
            name,
            memory_mb * 1024 * 1024,
            PhysicalDeviceHandle::NULL,
        )
    }

    #[test]
    fn ranking_prefers_type_then_memory() {
        let mut devices = vec![
            adapter(PhysicalDeviceType::Integrated, 8192, "igpu"),
            adapter(PhysicalDeviceType::Discrete, 4096, "small"),
            adapter(PhysicalDeviceType::Cpu, 65536, "cpu"),
            adapter(PhysicalDeviceType::Discrete, 8192, "big"),
        ];
        rank_physical_devices(&mut devices);
        let names: Vec<_> = devices.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["big", "small", "igpu", "cpu"]);
    }

    #[test]
    fn compute_prefers_async_family() {
        let families = [
            QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
            QueueFlags::COMPUTE | QueueFlags::TRANSFER,
            QueueFlags::TRANSFER,
        ];
        let indices = select_queue_families(&families).unwrap();
        assert_eq!(indices, QueueFamilyIndices { graphics: 0, compute: 1, copy: 2 });
    }

    #[test]
    fn single_family_serves_every_queue() {
        let families = [QueueFlags::all()];
        let indices = select_queue_families(&families).unwrap();
        assert_eq!(indices, QueueFamilyIndices { graphics: 0, compute: 0, copy: 0 });
    }

    #[test]
    fn missing_graphics_family_rejects_adapter() {
        let families = [QueueFlags::COMPUTE | QueueFlags::TRANSFER];
        assert!(select_queue_families(&families).is_none());
    }

    #[test]
    fn optional_features_follow_support() {
        let supported = DeviceFeatures {
            shader_float16: false,
            subgroup_size_control: false,
            ..DeviceFeatures::all()
        };
        let enabled = DeviceFeatures::resolve(&supported);
        assert!(enabled.dynamic_rendering);
        assert!(enabled.shader_int16);
        assert!(!enabled.shader_float16);
        assert!(!enabled.subgroup_size_control);
    }

    #[test]
    #[should_panic(expected = "doesn't support timeline_semaphore")]
    fn missing_required_feature_is_fatal() {
        let supported = DeviceFeatures {
            timeline_semaphore: false,
            ..DeviceFeatures::all()
        };
        DeviceFeatures::resolve(&supported);
    }

    #[test]
    fn api_version_falls_back_to_driver() {
        let sdk = make_version(1, 3, 250);
        let driver = make_version(1, 2, 0);
        assert_eq!(negotiate_api_version(sdk, driver), driver);
        assert_eq!(negotiate_api_version(driver, sdk), driver);
        assert_eq!(version_to_string(sdk), "1.3.250");
    }

    #[test]
    fn api_support_needs_both_instance_and_adapter() {
        let v1_2 = make_version(1, 2, 198);
        let v1_3 = make_version(1, 3, 0);
        assert!(supports_api_version(v1_3, v1_3, 1, 3));
        assert!(!supports_api_version(v1_2, v1_3, 1, 3));
        assert!(!supports_api_version(v1_3, v1_2, 1, 3));
        assert!(supports_api_version(v1_3, v1_2, 1, 2));
    }

    #[test]
    fn vendors_are_recognised() {
        let mut device = adapter(PhysicalDeviceType::Discrete, 1, "amd");
        device.vendor_id = 0x1022;
        assert!(device.is_amd());
        assert_eq!(device.vendor_name(), "AMD");
    }
}
