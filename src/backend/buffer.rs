// Memory: buffers, images, views and samplers
//
// Every buffer and image gets its own gpu-allocator allocation. Host visible
// allocations stay persistently mapped, so map/unmap only hand out the
// existing pointer.

use super::device::{LogicalDevice, TrackedMemory, VulkanDevice};
use super::vulkan::{
    to_vk_address_mode, to_vk_buffer_usage, to_vk_compare, to_vk_filter, to_vk_format, to_vk_image_aspect,
    to_vk_image_usage, to_vk_mipmap_mode,
};
use super::{BufferDesc, ImageViewDesc, SamplerDesc, TextureDesc};
use crate::rhi::definition::MemoryProperty;
use crate::rhi::handle::{AllocationHandle, BufferHandle, ImageHandle, ImageViewHandle, SamplerHandle};
use anyhow::{Context, Result};
use ash::vk::{self, Handle};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;

/// Where gpu-allocator should place memory with these properties
fn memory_location(memory: MemoryProperty) -> MemoryLocation {
    if !memory.contains(MemoryProperty::HOST_VISIBLE) {
        MemoryLocation::GpuOnly
    } else if memory.contains(MemoryProperty::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else {
        MemoryLocation::CpuToGpu
    }
}

fn align_down(value: u64, alignment: u64) -> u64 {
    value / alignment * alignment
}

impl VulkanDevice {
    fn allocate(
        &self,
        logical: &LogicalDevice,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut allocator = logical.allocator.lock();
        let allocator = allocator.as_mut().context("The memory allocator has been destroyed")?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for \"{}\"", name))
    }

    fn free(&self, logical: &LogicalDevice, allocation: AllocationHandle) {
        let Some(tracked) = logical.memory.lock().remove(&allocation) else {
            log::warn!("Allocation {:?} is unknown, it can't be freed", allocation);
            return;
        };

        let mut allocator = logical.allocator.lock();
        match allocator.as_mut() {
            Some(allocator) => {
                if let Err(e) = allocator.free(tracked.allocation) {
                    log::error!("Failed to free allocation: {}", e);
                }
            }
            None => log::error!("Freeing an allocation after the allocator was destroyed"),
        }
    }

    fn track(&self, logical: &LogicalDevice, allocation: Allocation) -> AllocationHandle {
        let handle = self.next_allocation_handle();
        let coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        logical
            .memory
            .lock()
            .insert(handle, TrackedMemory { allocation, coherent });
        handle
    }

    pub(super) fn create_buffer_vk(&self, desc: &BufferDesc<'_>) -> Result<(BufferHandle, AllocationHandle)> {
        let logical = self.logical()?;
        let device = &logical.device;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(to_vk_buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }.context("Failed to create buffer")?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let allocation = match self.allocate(logical, desc.name, requirements, memory_location(desc.memory), true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) };
        let handle = self.track(logical, allocation);
        if let Err(e) = bound {
            unsafe { device.destroy_buffer(buffer, None) };
            self.free(logical, handle);
            return Err(e).context("Failed to bind buffer memory");
        }

        self.set_object_name(logical, buffer, desc.name);
        Ok((BufferHandle::from_raw(buffer.as_raw()), handle))
    }

    pub(super) fn destroy_buffer_vk(&self, buffer: BufferHandle, allocation: AllocationHandle) {
        let Some(logical) = &self.logical else {
            return;
        };
        unsafe { logical.device.destroy_buffer(vk::Buffer::from_raw(buffer.as_raw()), None) };
        self.free(logical, allocation);
    }

    pub(super) fn create_texture_vk(&self, desc: &TextureDesc<'_>) -> Result<(ImageHandle, AllocationHandle)> {
        let logical = self.logical()?;
        let device = &logical.device;

        let layer_count = if desc.is_cube { desc.array_length * 6 } else { desc.array_length };
        let flags = if desc.is_cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_count)
            .array_layers(layer_count)
            .format(to_vk_format(desc.format))
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(to_vk_image_usage(desc.usage, desc.format))
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = unsafe { device.create_image(&image_info, None) }.context("Failed to create image")?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = match self.allocate(logical, desc.name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) };
        let handle = self.track(logical, allocation);
        if let Err(e) = bound {
            unsafe { device.destroy_image(image, None) };
            self.free(logical, handle);
            return Err(e).context("Failed to bind image memory");
        }

        self.set_object_name(logical, image, desc.name);
        Ok((ImageHandle::from_raw(image.as_raw()), handle))
    }

    pub(super) fn destroy_texture_vk(&self, image: ImageHandle, allocation: AllocationHandle) {
        let Some(logical) = &self.logical else {
            return;
        };
        unsafe { logical.device.destroy_image(vk::Image::from_raw(image.as_raw()), None) };
        self.free(logical, allocation);
    }

    pub(super) fn mapped_ptr_vk(&self, allocation: AllocationHandle) -> Option<NonNull<u8>> {
        let logical = self.logical.as_ref()?;
        let memory = logical.memory.lock();
        memory
            .get(&allocation)
            .and_then(|tracked| tracked.allocation.mapped_ptr())
            .map(|ptr| ptr.cast::<u8>())
    }

    pub(super) fn map_memory_vk(&self, allocation: AllocationHandle) -> Result<NonNull<u8>> {
        self.mapped_ptr_vk(allocation)
            .with_context(|| format!("Allocation {:?} isn't host visible", allocation))
    }

    /// Flush a written range, non-coherent memory only
    pub(super) fn flush_allocation_vk(&self, allocation: AllocationHandle, offset: u64, size: u64) -> Result<()> {
        let logical = self.logical()?;
        let memory = logical.memory.lock();
        let tracked = memory
            .get(&allocation)
            .with_context(|| format!("Allocation {:?} is unknown", allocation))?;
        if tracked.coherent {
            return Ok(());
        }

        // Ranges must be aligned to the atom size, or run to the end of the memory object
        let atom = logical.non_coherent_atom_size.max(1);
        let start = align_down(tracked.allocation.offset() + offset, atom);
        let end = (tracked.allocation.offset() + offset + size).div_ceil(atom) * atom;
        let allocation_end = tracked.allocation.offset() + tracked.allocation.size();
        let range_size = if end > allocation_end { vk::WHOLE_SIZE } else { end - start };

        let range = vk::MappedMemoryRange::builder()
            .memory(unsafe { tracked.allocation.memory() })
            .offset(start)
            .size(range_size)
            .build();
        unsafe { logical.device.flush_mapped_memory_ranges(&[range]) }.context("Failed to flush mapped memory")
    }

    pub(super) fn destroy_allocator_vk(&self) {
        if let Some(logical) = &self.logical {
            if logical.allocator.lock().take().is_some() {
                log::info!("Destroyed memory allocator");
            }
        }
    }

    pub(super) fn create_image_view_vk(&self, desc: &ImageViewDesc<'_>) -> Result<ImageViewHandle> {
        let logical = self.logical()?;

        let view_type = match (desc.is_cube, desc.layer_count) {
            (true, 6) => vk::ImageViewType::CUBE,
            (true, _) => vk::ImageViewType::CUBE_ARRAY,
            (false, 1) => vk::ImageViewType::TYPE_2D,
            (false, _) => vk::ImageViewType::TYPE_2D_ARRAY,
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(vk::Image::from_raw(desc.image.as_raw()))
            .view_type(view_type)
            .format(to_vk_format(desc.format))
            .subresource_range(vk::ImageSubresourceRange {
                // Views read depth only, sampling depth and stencil together is invalid
                aspect_mask: to_vk_image_aspect(desc.format, false),
                base_mip_level: desc.base_mip,
                level_count: desc.mip_count,
                base_array_layer: desc.base_layer,
                layer_count: desc.layer_count,
            });

        let view = unsafe { logical.device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;
        self.set_object_name(logical, view, desc.name);
        Ok(ImageViewHandle::from_raw(view.as_raw()))
    }

    pub(super) fn destroy_image_view_vk(&self, view: ImageViewHandle) {
        if let Some(logical) = &self.logical {
            unsafe { logical.device.destroy_image_view(vk::ImageView::from_raw(view.as_raw()), None) };
        }
    }

    pub(super) fn create_sampler_vk(&self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let logical = self.logical()?;
        let address_mode = to_vk_address_mode(desc.address_mode);

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(to_vk_filter(desc.filter_mag))
            .min_filter(to_vk_filter(desc.filter_min))
            .mipmap_mode(to_vk_mipmap_mode(desc.filter_mipmap))
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(desc.anisotropy > 0.0)
            .max_anisotropy(desc.anisotropy)
            .compare_enable(desc.comparison.is_some())
            .compare_op(desc.comparison.map_or(vk::CompareOp::ALWAYS, to_vk_compare))
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .mip_lod_bias(desc.mip_lod_bias)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        let sampler = unsafe { logical.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;
        Ok(SamplerHandle::from_raw(sampler.as_raw()))
    }

    pub(super) fn destroy_sampler_vk(&self, sampler: SamplerHandle) {
        if let Some(logical) = &self.logical {
            unsafe { logical.device.destroy_sampler(vk::Sampler::from_raw(sampler.as_raw()), None) };
        }
    }
}
