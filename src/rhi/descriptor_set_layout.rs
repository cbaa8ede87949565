// Descriptor set layout - fixed binding slots plus their current bindings
//
// The structural hash comes from slot types and numbers. Every lookup folds
// the bound resources into it and uses the result as the key into the
// device's descriptor-set cache.

use super::definition::{hash_combine, DescriptorType, ImageLayout};
use super::descriptor::{register_shift, BoundResource, Descriptor};
use super::device::Device;
use super::handle::{DescriptorSetHandle, DescriptorSetLayoutHandle};
use super::resources::{ConstantBuffer, Sampler, StructuredBuffer};
use super::texture::Texture;
use anyhow::Result;
use std::sync::Arc;

/// Outcome of [`DescriptorSetLayout::get_descriptor_set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDescriptorSet {
    pub handle: DescriptorSetHandle,
    /// Composite hash the set is cached under
    pub hash: u64,
    /// The set was allocated by this lookup
    pub created: bool,
    /// Bindings changed since the last lookup
    pub needs_bind: bool,
}

pub struct DescriptorSetLayout {
    device: Arc<Device>,
    name: String,
    descriptors: Vec<Descriptor>,
    handle: DescriptorSetLayoutHandle,
    layout_hash: u64,
    needs_to_bind: bool,
}

impl DescriptorSetLayout {
    /// # Panics
    /// If two descriptors share a type and slot.
    pub fn new(device: &Arc<Device>, descriptors: Vec<Descriptor>, name: &str) -> Result<Self> {
        for (i, descriptor) in descriptors.iter().enumerate() {
            let duplicate = descriptors[..i]
                .iter()
                .any(|d| d.descriptor_type == descriptor.descriptor_type && d.slot == descriptor.slot);
            assert!(
                !duplicate,
                "\"{}\" declares {:?} slot {} twice",
                name,
                descriptor.descriptor_type,
                descriptor.slot
            );
        }

        let layout_hash = descriptors
            .iter()
            .fold(0, |hash, descriptor| hash_combine(hash, descriptor.compute_hash()));

        let handle = device
            .context()
            .check(device.backend().create_descriptor_set_layout(&descriptors, name))?;
        log::debug!("Created descriptor set layout \"{}\" ({} slots)", name, descriptors.len());

        Ok(Self {
            device: Arc::clone(device),
            name: name.to_string(),
            descriptors,
            handle,
            layout_hash,
            needs_to_bind: false,
        })
    }

    pub fn set_constant_buffer(&mut self, slot: u32, constant_buffer: &ConstantBuffer) {
        let resource = BoundResource::Buffer {
            id: constant_buffer.id(),
            buffer: constant_buffer.buffer(),
        };
        self.set_buffer(
            DescriptorType::ConstantBuffer,
            slot,
            resource,
            constant_buffer.offset(),
            constant_buffer.stride() as u64,
        );
    }

    pub fn set_structured_buffer(&mut self, slot: u32, structured_buffer: &StructuredBuffer) {
        let resource = BoundResource::Buffer {
            id: structured_buffer.id(),
            buffer: structured_buffer.buffer(),
        };
        self.set_buffer(
            DescriptorType::StructuredBuffer,
            slot,
            resource,
            structured_buffer.offset(),
            structured_buffer.stride() as u64,
        );
    }

    fn set_buffer(&mut self, descriptor_type: DescriptorType, slot: u32, resource: BoundResource, offset: u32, range: u64) {
        let Some(descriptor) = self.find_mut(descriptor_type, slot) else {
            return;
        };

        let changed = descriptor.resource != Some(resource)
            || descriptor.dynamic_offset != offset
            || descriptor.range != range;
        descriptor.resource = Some(resource);
        descriptor.dynamic_offset = offset;
        descriptor.range = range;
        self.needs_to_bind |= changed;
    }

    pub fn set_sampler(&mut self, slot: u32, sampler: &Sampler) {
        let resource = BoundResource::Sampler {
            id: sampler.id(),
            sampler: sampler.handle(),
        };
        let Some(descriptor) = self.find_mut(DescriptorType::Sampler, slot) else {
            return;
        };

        let changed = descriptor.resource != Some(resource);
        descriptor.resource = Some(resource);
        self.needs_to_bind |= changed;
    }

    /// Bind a texture as a storage image when it's in the general layout,
    /// as a sampled image otherwise
    ///
    /// # Panics
    /// If the texture isn't in a shader readable layout or isn't an SRV.
    pub fn set_texture(&mut self, slot: u32, texture: &Texture, mip_index: u32, mip_range: u32) {
        let (base_mip, _) = texture.resolve_mip_range(mip_index, mip_range);
        let layout = texture.layout(base_mip);
        assert!(
            matches!(
                layout,
                ImageLayout::General | ImageLayout::ShaderReadOnlyOptimal | ImageLayout::DepthStencilReadOnlyOptimal
            ),
            "\"{}\" is in {:?}, it can't be bound to a shader",
            texture.name(),
            layout
        );
        assert!(texture.is_srv(), "\"{}\" isn't a shader resource", texture.name());

        let descriptor_type = if layout == ImageLayout::General {
            DescriptorType::TextureStorage
        } else {
            DescriptorType::Texture
        };
        let resource = BoundResource::Texture {
            id: texture.id(),
            view: texture.view_for(mip_index, mip_range),
        };
        let Some(descriptor) = self.find_mut(descriptor_type, slot) else {
            return;
        };

        let changed = descriptor.resource != Some(resource)
            || descriptor.layout != layout
            || descriptor.mip != mip_index
            || descriptor.mip_range != mip_range;
        descriptor.resource = Some(resource);
        descriptor.layout = layout;
        descriptor.mip = mip_index;
        descriptor.mip_range = mip_range;
        self.needs_to_bind |= changed;
    }

    /// Unbind every slot, cached sets are left alone
    pub fn clear_descriptor_data(&mut self) {
        for descriptor in &mut self.descriptors {
            descriptor.clear_data();
        }
    }

    /// Resolve the current bindings to a cached set, creating it on a miss
    pub fn get_descriptor_set(&mut self) -> Result<ResolvedDescriptorSet> {
        let hash = self.bindings_hash();
        let (handle, created) = self
            .device
            .get_or_create_descriptor_set(hash, self.handle, &self.descriptors, &self.name)?;

        let needs_bind = created || self.needs_to_bind;
        self.needs_to_bind = false;

        Ok(ResolvedDescriptorSet {
            handle,
            hash,
            created,
            needs_bind,
        })
    }

    /// Dynamic offsets of the buffer slots, ordered by slot
    pub fn get_dynamic_offsets(&self, offsets: &mut Vec<u32>) {
        let mut dynamic: Vec<_> = self
            .descriptors
            .iter()
            .filter(|d| d.descriptor_type.is_dynamic())
            .map(|d| (d.slot, d.dynamic_offset))
            .collect();
        dynamic.sort_by_key(|(slot, _)| *slot);

        offsets.clear();
        offsets.extend(dynamic.into_iter().map(|(_, offset)| offset));
    }

    fn bindings_hash(&self) -> u64 {
        self.descriptors.iter().fold(self.layout_hash, |hash, descriptor| {
            let id = descriptor.resource.map_or(0, |r| r.id().as_raw());
            let hash = hash_combine(hash, id);
            // The layout is baked into the written image info
            let hash = hash_combine(hash, descriptor.layout as u64);
            let hash = hash_combine(hash, descriptor.mip as u64);
            let hash = hash_combine(hash, descriptor.mip_range as u64);
            hash_combine(hash, descriptor.range)
        })
    }

    fn find_mut(&mut self, descriptor_type: DescriptorType, slot: u32) -> Option<&mut Descriptor> {
        let slot = slot + register_shift(descriptor_type);
        self.descriptors
            .iter_mut()
            .find(|d| d.descriptor_type == descriptor_type && d.slot == slot)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn handle(&self) -> DescriptorSetLayoutHandle {
        self.handle
    }

    pub fn layout_hash(&self) -> u64 {
        self.layout_hash
    }

    pub fn needs_to_bind(&self) -> bool {
        self.needs_to_bind
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.backend().destroy_descriptor_set_layout(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, HeadlessBackend, SamplerDesc, TextureDesc};
    use crate::config::DeviceConfig;
    use crate::rhi::definition::{
        BindPoint, QueueType, ShaderStage, TextureUsage, ALL_MIPS, SHADER_SHIFT_REGISTER_T,
        SHADER_SHIFT_REGISTER_U,
    };
    use crate::rhi::format::Format;
    use crate::rhi::handle::PipelineLayoutHandle;
    use crate::testing::{headless_device, headless_device_with};

    fn frame_layout(device: &Arc<Device>) -> DescriptorSetLayout {
        let descriptors = vec![
            Descriptor::from_register("frame", DescriptorType::ConstantBuffer, 0, ShaderStage::VERTEX),
            Descriptor::from_register("albedo", DescriptorType::Texture, 0, ShaderStage::PIXEL),
            Descriptor::from_register("output", DescriptorType::TextureStorage, 0, ShaderStage::PIXEL),
            Descriptor::from_register("linear", DescriptorType::Sampler, 0, ShaderStage::PIXEL),
            Descriptor::from_register("lights", DescriptorType::StructuredBuffer, 1, ShaderStage::PIXEL),
        ];
        DescriptorSetLayout::new(device, descriptors, "frame").unwrap()
    }

    fn texture(device: &Arc<Device>, name: &str, layout: ImageLayout) -> Texture {
        let texture = Texture::new(
            device,
            &TextureDesc {
                name,
                width: 64,
                height: 64,
                array_length: 1,
                mip_count: 2,
                format: Format::R8G8B8A8Unorm,
                usage: TextureUsage::SRV | TextureUsage::UAV,
                is_cube: false,
            },
        )
        .unwrap();
        let mut cmd = device.immediate_begin(QueueType::Graphics).unwrap();
        cmd.transition_texture(&texture, layout, ALL_MIPS, 0);
        cmd.submit().unwrap();
        texture
    }

    #[test]
    fn structural_hash_depends_on_slots_only() {
        let (device, _inspector) = headless_device();
        let a = frame_layout(&device);
        let b = frame_layout(&device);
        assert_eq!(a.layout_hash(), b.layout_hash());

        let other = DescriptorSetLayout::new(
            &device,
            vec![Descriptor::from_register("frame", DescriptorType::ConstantBuffer, 1, ShaderStage::VERTEX)],
            "other",
        )
        .unwrap();
        assert_ne!(a.layout_hash(), other.layout_hash());
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn duplicate_slots_are_fatal() {
        let (device, _inspector) = headless_device();
        let descriptors = vec![
            Descriptor::from_register("a", DescriptorType::Texture, 0, ShaderStage::PIXEL),
            Descriptor::from_register("b", DescriptorType::Texture, 0, ShaderStage::VERTEX),
        ];
        let _ = DescriptorSetLayout::new(&device, descriptors, "broken");
    }

    #[test]
    fn distinct_bindings_resolve_to_distinct_sets() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let albedo = texture(&device, "albedo", ImageLayout::ShaderReadOnlyOptimal);
        let detail = texture(&device, "detail", ImageLayout::ShaderReadOnlyOptimal);

        layout.set_texture(0, &albedo, 0, 0);
        let first = layout.get_descriptor_set().unwrap();
        assert!(first.created && first.needs_bind);

        layout.set_texture(0, &detail, 0, 0);
        let second = layout.get_descriptor_set().unwrap();
        assert_ne!(first.handle, second.handle);

        // Same texture, different mip
        layout.set_texture(0, &detail, 1, 0);
        let third = layout.get_descriptor_set().unwrap();
        assert_ne!(second.handle, third.handle);
        assert_eq!(device.descriptor_set_count(), 3);

        // Back to the first binding hits the cache
        layout.set_texture(0, &albedo, 0, 0);
        let again = layout.get_descriptor_set().unwrap();
        assert_eq!(again.handle, first.handle);
        assert!(!again.created);
        assert!(again.needs_bind);
    }

    #[test]
    fn image_layout_is_part_of_the_cached_set() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let depth = texture(&device, "depth", ImageLayout::ShaderReadOnlyOptimal);

        layout.set_texture(0, &depth, 0, 0);
        let sampled = layout.get_descriptor_set().unwrap();

        let mut cmd = device.immediate_begin(QueueType::Graphics).unwrap();
        cmd.transition_texture(&depth, ImageLayout::DepthStencilReadOnlyOptimal, ALL_MIPS, 0);
        cmd.submit().unwrap();

        layout.set_texture(0, &depth, 0, 0);
        assert!(layout.needs_to_bind());
        let read_only = layout.get_descriptor_set().unwrap();
        assert!(read_only.created);
        assert_ne!(sampled.handle, read_only.handle);
        let bound = layout
            .descriptors()
            .iter()
            .find(|d| d.descriptor_type == DescriptorType::Texture)
            .map(|d| d.layout);
        assert_eq!(bound, Some(ImageLayout::DepthStencilReadOnlyOptimal));
    }

    #[test]
    fn repeated_lookups_return_the_same_set() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let mut cb = ConstantBuffer::new(&device, "frame", 64, 4).unwrap();
        cb.update(&[0; 16]).unwrap();
        layout.set_constant_buffer(0, &cb);

        let first = layout.get_descriptor_set().unwrap();
        let second = layout.get_descriptor_set().unwrap();
        assert_eq!(first.handle, second.handle);
        assert!(!second.created);
        assert!(!second.needs_bind);
    }

    #[test]
    fn identical_bindings_dont_raise_the_bind_flag() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let sampler = Sampler::new(&device, SamplerDesc::default()).unwrap();
        let mut cb = ConstantBuffer::new(&device, "frame", 64, 4).unwrap();
        cb.update(&[0; 16]).unwrap();

        layout.set_sampler(0, &sampler);
        layout.set_constant_buffer(0, &cb);
        assert!(layout.needs_to_bind());
        layout.get_descriptor_set().unwrap();
        assert!(!layout.needs_to_bind());

        layout.set_sampler(0, &sampler);
        layout.set_constant_buffer(0, &cb);
        assert!(!layout.needs_to_bind());

        // A new dynamic offset needs a rebind but not a new set
        let before = layout.get_descriptor_set().unwrap();
        cb.update(&[1; 16]).unwrap();
        layout.set_constant_buffer(0, &cb);
        assert!(layout.needs_to_bind());
        let after = layout.get_descriptor_set().unwrap();
        assert_eq!(before.handle, after.handle);
        assert!(after.needs_bind);
    }

    #[test]
    fn unknown_slots_are_ignored() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let sampler = Sampler::new(&device, SamplerDesc::default()).unwrap();
        layout.set_sampler(5, &sampler);
        assert!(!layout.needs_to_bind());
    }

    #[test]
    fn texture_layout_selects_the_slot_kind() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let storage = texture(&device, "storage", ImageLayout::General);
        let sampled = texture(&device, "sampled", ImageLayout::ShaderReadOnlyOptimal);

        layout.set_texture(0, &storage, 0, 0);
        layout.set_texture(0, &sampled, 0, 0);

        let bound = |ty: DescriptorType, slot: u32| {
            layout
                .descriptors()
                .iter()
                .find(|d| d.descriptor_type == ty && d.slot == slot)
                .and_then(|d| d.resource)
                .map(|r| r.id())
        };
        assert_eq!(bound(DescriptorType::TextureStorage, SHADER_SHIFT_REGISTER_U), Some(storage.id()));
        assert_eq!(bound(DescriptorType::Texture, SHADER_SHIFT_REGISTER_T), Some(sampled.id()));
    }

    #[test]
    #[should_panic(expected = "can't be bound to a shader")]
    fn undefined_textures_cant_be_bound() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let texture = Texture::new(
            &device,
            &TextureDesc {
                name: "fresh",
                width: 16,
                height: 16,
                array_length: 1,
                mip_count: 1,
                format: Format::R8Unorm,
                usage: TextureUsage::SRV,
                is_cube: false,
            },
        )
        .unwrap();
        layout.set_texture(0, &texture, 0, 0);
    }

    #[test]
    #[should_panic(expected = "no more memory to allocate another descriptor set")]
    fn exhausting_the_pool_is_fatal() {
        let config = DeviceConfig {
            descriptor_set_capacity: 2,
            ..DeviceConfig::default()
        };
        let (device, _inspector) = headless_device_with(config, HeadlessBackend::new());
        let mut layout = frame_layout(&device);
        let textures: Vec<_> = (0..3)
            .map(|i| texture(&device, &format!("t{}", i), ImageLayout::ShaderReadOnlyOptimal))
            .collect();

        for texture in &textures {
            layout.set_texture(0, texture, 0, 0);
            layout.get_descriptor_set().unwrap();
        }
    }

    #[test]
    fn dynamic_offsets_follow_slot_order() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let mut cb = ConstantBuffer::new(&device, "frame", 256, 4).unwrap();
        let mut sb = StructuredBuffer::new(&device, "lights", 64, 4).unwrap();
        for _ in 0..2 {
            cb.update(&[0; 4]).unwrap();
        }
        for _ in 0..3 {
            sb.update(&[0; 4]).unwrap();
        }
        layout.set_constant_buffer(0, &cb);
        layout.set_structured_buffer(1, &sb);

        let mut offsets = vec![99];
        layout.get_dynamic_offsets(&mut offsets);
        // Structured buffer sits at u1, before the constant buffer at b0 (100)
        assert_eq!(offsets, [128, 256]);
    }

    #[test]
    fn command_lists_skip_redundant_binds() {
        let (device, inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let sampler = Sampler::new(&device, SamplerDesc::default()).unwrap();
        layout.set_sampler(0, &sampler);

        let mut cmd = device.immediate_begin(QueueType::Graphics).unwrap();
        inspector.clear_events();
        cmd.bind_descriptor_set(PipelineLayoutHandle::NULL, &mut layout, BindPoint::Graphics)
            .unwrap();
        cmd.bind_descriptor_set(PipelineLayoutHandle::NULL, &mut layout, BindPoint::Graphics)
            .unwrap();
        cmd.submit().unwrap();

        let binds = inspector
            .events()
            .iter()
            .filter(|e| matches!(e, BackendEvent::DescriptorSetBound(_)))
            .count();
        assert_eq!(binds, 1);
    }

    #[test]
    fn clearing_bindings_keeps_the_cache() {
        let (device, _inspector) = headless_device();
        let mut layout = frame_layout(&device);
        let sampler = Sampler::new(&device, SamplerDesc::default()).unwrap();
        layout.set_sampler(0, &sampler);
        layout.get_descriptor_set().unwrap();

        layout.clear_descriptor_data();
        assert!(layout.descriptors().iter().all(|d| d.resource.is_none()));
        assert_eq!(device.descriptor_set_count(), 1);
    }
}
