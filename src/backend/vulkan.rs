// Vulkan backend - RHI enums to ash types, and the Backend trait on VulkanDevice
//
// The trait methods only delegate; the work lives next to the Vulkan objects
// it touches (device.rs, buffer.rs, command.rs, descriptor.rs, sync.rs).

use super::device::VulkanDevice;
use super::{Backend, BufferDesc, DescriptorPoolSize, ImageBarrier, ImageViewDesc, SamplerDesc, SubmitInfo, TextureDesc};
use crate::rhi::definition::{
    ApiType, BindPoint, BufferUsage, CompareFunction, DescriptorType, Filter, ImageLayout, PhysicalDeviceType,
    PipelineStage, QueueFlags, QueueType, SamplerAddressMode, ShaderStage, TextureUsage,
};
use crate::rhi::descriptor::Descriptor;
use crate::rhi::format::Format;
use crate::rhi::handle::{
    AllocationHandle, BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, ImageHandle, ImageViewHandle, PipelineLayoutHandle, SamplerHandle,
    SemaphoreHandle, SwapchainHandle,
};
use crate::rhi::physical_device::{DeviceFeatures, DeviceLimits, PhysicalDevice, QueueFamilyIndices};
use anyhow::Result;
use ash::vk;
use std::ptr::NonNull;

// =============================================================================
// FROM VULKAN
// =============================================================================

pub(super) fn from_vk_device_type(device_type: vk::PhysicalDeviceType) -> PhysicalDeviceType {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => PhysicalDeviceType::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => PhysicalDeviceType::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => PhysicalDeviceType::Virtual,
        vk::PhysicalDeviceType::CPU => PhysicalDeviceType::Cpu,
        _ => PhysicalDeviceType::Undefined,
    }
}

pub(super) fn from_vk_queue_flags(flags: vk::QueueFlags) -> QueueFlags {
    let mut result = QueueFlags::empty();
    result.set(QueueFlags::GRAPHICS, flags.contains(vk::QueueFlags::GRAPHICS));
    result.set(QueueFlags::COMPUTE, flags.contains(vk::QueueFlags::COMPUTE));
    result.set(QueueFlags::TRANSFER, flags.contains(vk::QueueFlags::TRANSFER));
    result
}

// =============================================================================
// TO VULKAN
// =============================================================================

pub(super) fn to_vk_format(format: Format) -> vk::Format {
    match format {
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R8Uint => vk::Format::R8_UINT,
        Format::R16Unorm => vk::Format::R16_UNORM,
        Format::R16Uint => vk::Format::R16_UINT,
        Format::R16Float => vk::Format::R16_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R8G8Unorm => vk::Format::R8G8_UNORM,
        Format::R16G16Float => vk::Format::R16G16_SFLOAT,
        Format::R32G32Float => vk::Format::R32G32_SFLOAT,
        Format::R11G11B10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
        Format::R32G32B32Float => vk::Format::R32G32B32_SFLOAT,
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R10G10B10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        Format::R16G16B16A16Unorm => vk::Format::R16G16B16A16_UNORM,
        Format::R16G16B16A16Snorm => vk::Format::R16G16B16A16_SNORM,
        Format::R16G16B16A16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D32FloatS8X24Uint => vk::Format::D32_SFLOAT_S8_UINT,
        Format::Bc7 => vk::Format::BC7_UNORM_BLOCK,
        Format::Astc => vk::Format::ASTC_4X4_UNORM_BLOCK,
        Format::B8R8G8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Undefined => vk::Format::UNDEFINED,
    }
}

pub(super) fn to_vk_image_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::Preinitialized => vk::ImageLayout::PREINITIALIZED,
        ImageLayout::ColorAttachmentOptimal => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthAttachmentOptimal => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachmentOptimal => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilReadOnlyOptimal => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ImageLayout::ShaderReadOnlyOptimal => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrcOptimal => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDstOptimal => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

pub(super) fn to_vk_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

/// Textures can always be copied to and from
pub(super) fn to_vk_image_usage(usage: TextureUsage, format: Format) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SRV) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::UAV) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RTV) && !format.is_depth() {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DSV) || (usage.contains(TextureUsage::RTV) && format.is_depth()) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    flags
}

pub(super) fn to_vk_image_aspect(format: Format, include_stencil: bool) -> vk::ImageAspectFlags {
    if !format.is_depth() {
        return vk::ImageAspectFlags::COLOR;
    }
    if include_stencil && format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

pub(super) fn to_vk_filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub(super) fn to_vk_mipmap_mode(filter: Filter) -> vk::SamplerMipmapMode {
    match filter {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub(super) fn to_vk_address_mode(mode: SamplerAddressMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerAddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        SamplerAddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        SamplerAddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerAddressMode::ClampToZero => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        SamplerAddressMode::MirrorOnce => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
    }
}

pub(super) fn to_vk_compare(function: CompareFunction) -> vk::CompareOp {
    match function {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

/// Buffers are dynamic descriptors, the offset is supplied when binding
pub(super) fn to_vk_descriptor_type(descriptor_type: DescriptorType) -> vk::DescriptorType {
    match descriptor_type {
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::Texture => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::TextureStorage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorType::StructuredBuffer => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
    }
}

pub(super) fn to_vk_shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stage.contains(ShaderStage::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stage.contains(ShaderStage::PIXEL) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stage.contains(ShaderStage::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub(super) fn to_vk_pipeline_stage(stage: PipelineStage) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();
    for (ours, theirs) in [
        (PipelineStage::TOP_OF_PIPE, vk::PipelineStageFlags::TOP_OF_PIPE),
        (PipelineStage::VERTEX_SHADER, vk::PipelineStageFlags::VERTEX_SHADER),
        (PipelineStage::FRAGMENT_SHADER, vk::PipelineStageFlags::FRAGMENT_SHADER),
        (PipelineStage::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER),
        (PipelineStage::COLOR_ATTACHMENT_OUTPUT, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
        (PipelineStage::TRANSFER, vk::PipelineStageFlags::TRANSFER),
        (PipelineStage::BOTTOM_OF_PIPE, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        (PipelineStage::ALL_COMMANDS, vk::PipelineStageFlags::ALL_COMMANDS),
    ] {
        if stage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

// =============================================================================
// BACKEND
// =============================================================================

impl Backend for VulkanDevice {
    fn api_type(&self) -> ApiType {
        ApiType::Vulkan
    }

    fn api_version(&self) -> u32 {
        VulkanDevice::api_version(self)
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        self.enumerate_adapters()
    }

    fn queue_family_flags(&self, physical_device: &PhysicalDevice) -> Result<Vec<QueueFlags>> {
        Ok(self.adapter_queue_families(physical_device))
    }

    fn supported_features(&self, physical_device: &PhysicalDevice) -> Result<DeviceFeatures> {
        Ok(self.adapter_features(physical_device))
    }

    fn device_limits(&self, physical_device: &PhysicalDevice) -> Result<DeviceLimits> {
        Ok(self.adapter_limits(physical_device))
    }

    fn create_device(
        &mut self,
        physical_device: &PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        features: &DeviceFeatures,
    ) -> Result<()> {
        self.create_logical_device(physical_device, queue_families, features)
    }

    fn queue_submit(&self, submit: &SubmitInfo) -> Result<()> {
        self.queue_submit_vk(submit)
    }

    fn queue_present(&self, swapchain: SwapchainHandle, image_index: u32, wait_semaphores: &[SemaphoreHandle]) -> Result<()> {
        self.queue_present_vk(swapchain, image_index, wait_semaphores)
    }

    fn queue_wait_idle(&self, queue_type: QueueType) -> Result<()> {
        self.queue_wait_idle_vk(queue_type)
    }

    fn device_wait_idle(&self) -> Result<()> {
        self.wait_idle()
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<(BufferHandle, AllocationHandle)> {
        self.create_buffer_vk(desc)
    }

    fn destroy_buffer(&self, buffer: BufferHandle, allocation: AllocationHandle) {
        self.destroy_buffer_vk(buffer, allocation)
    }

    fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<(ImageHandle, AllocationHandle)> {
        self.create_texture_vk(desc)
    }

    fn destroy_texture(&self, image: ImageHandle, allocation: AllocationHandle) {
        self.destroy_texture_vk(image, allocation)
    }

    fn mapped_ptr(&self, allocation: AllocationHandle) -> Option<NonNull<u8>> {
        self.mapped_ptr_vk(allocation)
    }

    fn map_memory(&self, allocation: AllocationHandle) -> Result<NonNull<u8>> {
        self.map_memory_vk(allocation)
    }

    // Host visible memory stays mapped until it's freed
    fn unmap_memory(&self, _allocation: AllocationHandle) {}

    fn flush_allocation(&self, allocation: AllocationHandle, offset: u64, size: u64) -> Result<()> {
        self.flush_allocation_vk(allocation, offset, size)
    }

    fn destroy_allocator(&self) {
        self.destroy_allocator_vk()
    }

    fn create_image_view(&self, desc: &ImageViewDesc<'_>) -> Result<ImageViewHandle> {
        self.create_image_view_vk(desc)
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.destroy_image_view_vk(view)
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        self.create_sampler_vk(desc)
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.destroy_sampler_vk(sampler)
    }

    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[DescriptorPoolSize]) -> Result<DescriptorPoolHandle> {
        self.create_descriptor_pool_vk(max_sets, sizes)
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        self.destroy_descriptor_pool_vk(pool)
    }

    fn create_descriptor_set_layout(&self, descriptors: &[Descriptor], name: &str) -> Result<DescriptorSetLayoutHandle> {
        self.create_descriptor_set_layout_vk(descriptors, name)
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        self.destroy_descriptor_set_layout_vk(layout)
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        name: &str,
    ) -> Result<DescriptorSetHandle> {
        self.allocate_descriptor_set_vk(pool, layout, name)
    }

    fn update_descriptor_set(&self, set: DescriptorSetHandle, descriptors: &[Descriptor]) -> Result<()> {
        self.update_descriptor_set_vk(set, descriptors)
    }

    fn create_command_pool(&self, queue_type: QueueType, name: &str) -> Result<CommandPoolHandle> {
        self.create_command_pool_vk(queue_type, name)
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        self.destroy_command_pool_vk(pool)
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<()> {
        self.reset_command_pool_vk(pool)
    }

    fn allocate_command_buffer(&self, pool: CommandPoolHandle, name: &str) -> Result<CommandBufferHandle> {
        self.allocate_command_buffer_vk(pool, name)
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        self.begin_command_buffer_vk(cmd)
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        self.end_command_buffer_vk(cmd)
    }

    fn cmd_image_barrier(&self, cmd: CommandBufferHandle, barrier: &ImageBarrier) {
        self.cmd_image_barrier_vk(cmd, barrier)
    }

    fn cmd_copy_buffer(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, size: u64) {
        self.cmd_copy_buffer_vk(cmd, src, dst, size)
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        bind_point: BindPoint,
        pipeline_layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
        dynamic_offsets: &[u32],
    ) {
        self.cmd_bind_descriptor_set_vk(cmd, bind_point, pipeline_layout, set, dynamic_offsets)
    }

    fn create_fence(&self, name: Option<&str>) -> Result<FenceHandle> {
        self.create_fence_vk(name)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.destroy_fence_vk(fence)
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<bool> {
        self.fence_status_vk(fence)
    }

    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<bool> {
        self.wait_fence_vk(fence, timeout_ns)
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        self.reset_fence_vk(fence)
    }

    fn create_semaphore(&self, name: Option<&str>) -> Result<SemaphoreHandle> {
        self.create_semaphore_vk(name)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.destroy_semaphore_vk(semaphore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_format_but_undefined_has_a_vulkan_format() {
        for format in Format::ALL {
            let vk_format = to_vk_format(format);
            assert_eq!(format == Format::Undefined, vk_format == vk::Format::UNDEFINED, "{}", format);
        }
    }

    #[test]
    fn stencil_aspect_only_when_requested() {
        assert_eq!(
            to_vk_image_aspect(Format::D32FloatS8X24Uint, true),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(to_vk_image_aspect(Format::D32FloatS8X24Uint, false), vk::ImageAspectFlags::DEPTH);
        assert_eq!(to_vk_image_aspect(Format::D32Float, true), vk::ImageAspectFlags::DEPTH);
        assert_eq!(to_vk_image_aspect(Format::R8G8B8A8Unorm, true), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn buffers_map_to_dynamic_descriptors() {
        assert_eq!(
            to_vk_descriptor_type(DescriptorType::ConstantBuffer),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert_eq!(
            to_vk_descriptor_type(DescriptorType::StructuredBuffer),
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        );
        assert_eq!(to_vk_descriptor_type(DescriptorType::TextureStorage), vk::DescriptorType::STORAGE_IMAGE);
    }

    #[test]
    fn depth_render_targets_become_depth_attachments() {
        let usage = to_vk_image_usage(TextureUsage::RTV | TextureUsage::SRV, Format::D32Float);
        assert!(usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(!usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(usage.contains(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn queue_flags_keep_only_known_bits() {
        let flags = from_vk_queue_flags(vk::QueueFlags::GRAPHICS | vk::QueueFlags::SPARSE_BINDING);
        assert_eq!(flags, QueueFlags::GRAPHICS);
        assert_eq!(from_vk_device_type(vk::PhysicalDeviceType::OTHER), PhysicalDeviceType::Undefined);
    }

    #[test]
    fn pixel_stage_is_fragment() {
        assert_eq!(
            to_vk_shader_stage(ShaderStage::VERTEX | ShaderStage::PIXEL),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }
}
