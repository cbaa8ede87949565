// Backend module - graphics API abstraction layer
//
// Design: the RHI owns every policy (state machines, caching, ownership);
// a backend only translates calls into the native API and hands back opaque
// handles.
// Implementations: Vulkan (ash + gpu-allocator) and an in-memory headless
// backend used for tests and machines without a GPU.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod headless;
pub mod sync;
pub mod vulkan;

pub use device::VulkanDevice;
pub use headless::{BackendEvent, HeadlessAdapter, HeadlessBackend, HeadlessInspector};

use crate::rhi::definition::{
    ApiType, BindPoint, BufferUsage, CompareFunction, DescriptorType, Filter, ImageLayout,
    MemoryProperty, PipelineStage, QueueFlags, QueueType, SamplerAddressMode, TextureUsage,
};
use crate::rhi::descriptor::Descriptor;
use crate::rhi::format::Format;
use crate::rhi::handle::{
    AllocationHandle, BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorPoolHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, FenceHandle, ImageHandle, ImageViewHandle,
    PipelineLayoutHandle, SamplerHandle, SemaphoreHandle, SwapchainHandle,
};
use crate::rhi::physical_device::{DeviceFeatures, DeviceLimits, PhysicalDevice, QueueFamilyIndices};
use anyhow::Result;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryProperty,
}

impl BufferDesc<'_> {
    pub fn is_mappable(&self) -> bool {
        self.memory.contains(MemoryProperty::HOST_VISIBLE)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    pub array_length: u32,
    pub mip_count: u32,
    pub format: Format,
    pub usage: TextureUsage,
    pub is_cube: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc<'a> {
    pub name: &'a str,
    pub image: ImageHandle,
    pub format: Format,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub is_cube: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter_min: Filter,
    pub filter_mag: Filter,
    pub filter_mipmap: Filter,
    pub address_mode: SamplerAddressMode,
    pub comparison: Option<CompareFunction>,
    pub anisotropy: f32,
    pub mip_lod_bias: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter_min: Filter::Linear,
            filter_mag: Filter::Linear,
            filter_mipmap: Filter::Linear,
            address_mode: SamplerAddressMode::Wrap,
            comparison: None,
            anisotropy: 0.0,
            mip_lod_bias: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolSize {
    pub descriptor_type: DescriptorType,
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo {
    pub queue_type: QueueType,
    pub wait_stage: PipelineStage,
    pub cmd: CommandBufferHandle,
    pub wait_semaphore: Option<SemaphoreHandle>,
    pub signal_semaphore: Option<SemaphoreHandle>,
    pub signal_fence: Option<FenceHandle>,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    /// Queue the barrier is recorded on, it bounds the usable stages
    pub queue_type: QueueType,
    pub image: ImageHandle,
    pub format: Format,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub base_mip: u32,
    pub mip_count: u32,
    pub layer_count: u32,
}

/// Native graphics API behind the RHI
///
/// Two-phase: adapter queries and `create_device` run on an exclusively owned
/// backend, every other call goes through a shared reference once the backend
/// is owned by the device context.
pub trait Backend: Send + Sync {
    fn api_type(&self) -> ApiType;

    /// Negotiated instance API version (packed)
    fn api_version(&self) -> u32;

    // Adapters
    fn enumerate_physical_devices(&self) -> Result<Vec<PhysicalDevice>>;
    fn queue_family_flags(&self, physical_device: &PhysicalDevice) -> Result<Vec<QueueFlags>>;
    fn supported_features(&self, physical_device: &PhysicalDevice) -> Result<DeviceFeatures>;
    fn device_limits(&self, physical_device: &PhysicalDevice) -> Result<DeviceLimits>;
    fn create_device(
        &mut self,
        physical_device: &PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        features: &DeviceFeatures,
    ) -> Result<()>;

    // Queues
    fn queue_submit(&self, submit: &SubmitInfo) -> Result<()>;
    fn queue_present(&self, swapchain: SwapchainHandle, image_index: u32, wait_semaphores: &[SemaphoreHandle]) -> Result<()>;
    fn queue_wait_idle(&self, queue_type: QueueType) -> Result<()>;
    fn device_wait_idle(&self) -> Result<()>;

    // Memory
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<(BufferHandle, AllocationHandle)>;
    fn destroy_buffer(&self, buffer: BufferHandle, allocation: AllocationHandle);
    fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<(ImageHandle, AllocationHandle)>;
    fn destroy_texture(&self, image: ImageHandle, allocation: AllocationHandle);
    /// Persistent mapping, if the allocation has one
    fn mapped_ptr(&self, allocation: AllocationHandle) -> Option<NonNull<u8>>;
    fn map_memory(&self, allocation: AllocationHandle) -> Result<NonNull<u8>>;
    fn unmap_memory(&self, allocation: AllocationHandle);
    fn flush_allocation(&self, allocation: AllocationHandle, offset: u64, size: u64) -> Result<()>;
    fn destroy_allocator(&self);

    // Views and samplers
    fn create_image_view(&self, desc: &ImageViewDesc<'_>) -> Result<ImageViewHandle>;
    fn destroy_image_view(&self, view: ImageViewHandle);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle>;
    fn destroy_sampler(&self, sampler: SamplerHandle);

    // Descriptors
    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[DescriptorPoolSize]) -> Result<DescriptorPoolHandle>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);
    fn create_descriptor_set_layout(&self, descriptors: &[Descriptor], name: &str) -> Result<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        name: &str,
    ) -> Result<DescriptorSetHandle>;
    fn update_descriptor_set(&self, set: DescriptorSetHandle, descriptors: &[Descriptor]) -> Result<()>;

    // Command recording
    fn create_command_pool(&self, queue_type: QueueType, name: &str) -> Result<CommandPoolHandle>;
    fn destroy_command_pool(&self, pool: CommandPoolHandle);
    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<()>;
    fn allocate_command_buffer(&self, pool: CommandPoolHandle, name: &str) -> Result<CommandBufferHandle>;
    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()>;
    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()>;
    fn cmd_image_barrier(&self, cmd: CommandBufferHandle, barrier: &ImageBarrier);
    /// Copy the first `size` bytes of `src` to the start of `dst`
    fn cmd_copy_buffer(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, size: u64);
    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        bind_point: BindPoint,
        pipeline_layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
        dynamic_offsets: &[u32],
    );

    // Synchronization
    fn create_fence(&self, name: Option<&str>) -> Result<FenceHandle>;
    fn destroy_fence(&self, fence: FenceHandle);
    fn fence_status(&self, fence: FenceHandle) -> Result<bool>;
    /// `Ok(false)` on timeout
    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<bool>;
    fn reset_fence(&self, fence: FenceHandle) -> Result<()>;
    fn create_semaphore(&self, name: Option<&str>) -> Result<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);
}
