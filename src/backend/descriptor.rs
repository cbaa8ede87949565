// Descriptor pools, layouts and sets
//
// Buffers are always dynamic descriptors (offset supplied at bind time) and
// every binding is partially bound, so layouts can declare slots a draw
// doesn't use.

use super::device::VulkanDevice;
use super::vulkan::{to_vk_descriptor_type, to_vk_image_layout, to_vk_shader_stage};
use super::DescriptorPoolSize;
use crate::rhi::descriptor::{BoundResource, Descriptor};
use crate::rhi::handle::{DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle};
use anyhow::{Context, Result};
use ash::vk::{self, Handle};

enum WriteInfo {
    Image(usize),
    Buffer(usize),
}

impl VulkanDevice {
    pub(super) fn create_descriptor_pool_vk(&self, max_sets: u32, sizes: &[DescriptorPoolSize]) -> Result<DescriptorPoolHandle> {
        let logical = self.logical()?;
        let pool_sizes: Vec<_> = sizes
            .iter()
            .map(|size| vk::DescriptorPoolSize {
                ty: to_vk_descriptor_type(size.descriptor_type),
                descriptor_count: size.count,
            })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { logical.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;
        Ok(DescriptorPoolHandle::from_raw(pool.as_raw()))
    }

    pub(super) fn destroy_descriptor_pool_vk(&self, pool: DescriptorPoolHandle) {
        if let Some(logical) = &self.logical {
            unsafe {
                logical
                    .device
                    .destroy_descriptor_pool(vk::DescriptorPool::from_raw(pool.as_raw()), None)
            };
        }
    }

    pub(super) fn create_descriptor_set_layout_vk(
        &self,
        descriptors: &[Descriptor],
        name: &str,
    ) -> Result<DescriptorSetLayoutHandle> {
        let logical = self.logical()?;

        let bindings: Vec<_> = descriptors
            .iter()
            .map(|descriptor| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(descriptor.slot)
                    .descriptor_type(to_vk_descriptor_type(descriptor.descriptor_type))
                    .descriptor_count(1)
                    .stage_flags(to_vk_shader_stage(descriptor.stage))
                    .build()
            })
            .collect();
        let binding_flags = vec![vk::DescriptorBindingFlags::PARTIALLY_BOUND; bindings.len()];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { logical.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;
        self.set_object_name(logical, layout, name);
        Ok(DescriptorSetLayoutHandle::from_raw(layout.as_raw()))
    }

    pub(super) fn destroy_descriptor_set_layout_vk(&self, layout: DescriptorSetLayoutHandle) {
        if let Some(logical) = &self.logical {
            unsafe {
                logical
                    .device
                    .destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(layout.as_raw()), None)
            };
        }
    }

    pub(super) fn allocate_descriptor_set_vk(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        name: &str,
    ) -> Result<DescriptorSetHandle> {
        let logical = self.logical()?;
        let layouts = [vk::DescriptorSetLayout::from_raw(layout.as_raw())];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(vk::DescriptorPool::from_raw(pool.as_raw()))
            .set_layouts(&layouts);

        let sets = unsafe { logical.device.allocate_descriptor_sets(&allocate_info) }
            .context("Failed to allocate descriptor set")?;
        let set = sets.into_iter().next().context("No descriptor set was allocated")?;
        self.set_object_name(logical, set, name);
        Ok(DescriptorSetHandle::from_raw(set.as_raw()))
    }

    /// Write every bound slot, unbound slots stay empty
    pub(super) fn update_descriptor_set_vk(&self, set: DescriptorSetHandle, descriptors: &[Descriptor]) -> Result<()> {
        let logical = self.logical()?;

        // Infos first, the writes point into these vectors
        let mut image_infos = Vec::with_capacity(descriptors.len());
        let mut buffer_infos = Vec::with_capacity(descriptors.len());
        let mut pending = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let info = match descriptor.resource {
                Some(BoundResource::Sampler { sampler, .. }) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::from_raw(sampler.as_raw()),
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    });
                    WriteInfo::Image(image_infos.len() - 1)
                }
                Some(BoundResource::Texture { view, .. }) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: vk::ImageView::from_raw(view.as_raw()),
                        image_layout: to_vk_image_layout(descriptor.layout),
                    });
                    WriteInfo::Image(image_infos.len() - 1)
                }
                Some(BoundResource::Buffer { buffer, .. }) => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: vk::Buffer::from_raw(buffer.as_raw()),
                        offset: 0,
                        range: descriptor.range,
                    });
                    WriteInfo::Buffer(buffer_infos.len() - 1)
                }
                None => continue,
            };
            pending.push((descriptor, info));
        }

        let set = vk::DescriptorSet::from_raw(set.as_raw());
        let writes: Vec<_> = pending
            .iter()
            .map(|(descriptor, info)| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(descriptor.slot)
                    .dst_array_element(0)
                    .descriptor_type(to_vk_descriptor_type(descriptor.descriptor_type));
                match info {
                    WriteInfo::Image(i) => write.image_info(std::slice::from_ref(&image_infos[*i])),
                    WriteInfo::Buffer(i) => write.buffer_info(std::slice::from_ref(&buffer_infos[*i])),
                }
                .build()
            })
            .collect();

        unsafe { logical.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }
}
