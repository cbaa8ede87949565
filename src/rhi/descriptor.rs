// Descriptor slot - one binding of a descriptor set layout plus its bound state

use super::definition::{
    hash_combine, DescriptorType, ImageLayout, ShaderStage, SHADER_SHIFT_REGISTER_B,
    SHADER_SHIFT_REGISTER_S, SHADER_SHIFT_REGISTER_T, SHADER_SHIFT_REGISTER_U,
};
use super::handle::{BufferHandle, ImageViewHandle, ResourceId, SamplerHandle};

/// Register shift applied to a shader register of the given type
pub const fn register_shift(descriptor_type: DescriptorType) -> u32 {
    match descriptor_type {
        DescriptorType::Sampler => SHADER_SHIFT_REGISTER_S,
        DescriptorType::Texture => SHADER_SHIFT_REGISTER_T,
        DescriptorType::ConstantBuffer => SHADER_SHIFT_REGISTER_B,
        DescriptorType::TextureStorage | DescriptorType::StructuredBuffer => SHADER_SHIFT_REGISTER_U,
    }
}

/// Object currently bound to a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundResource {
    Buffer { id: ResourceId, buffer: BufferHandle },
    Texture { id: ResourceId, view: ImageViewHandle },
    Sampler { id: ResourceId, sampler: SamplerHandle },
}

impl BoundResource {
    pub fn id(&self) -> ResourceId {
        match *self {
            BoundResource::Buffer { id, .. }
            | BoundResource::Texture { id, .. }
            | BoundResource::Sampler { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub name: String,
    pub descriptor_type: DescriptorType,
    /// Shader register, register shift included
    pub slot: u32,
    pub stage: ShaderStage,
    pub layout: ImageLayout,
    pub resource: Option<BoundResource>,
    pub dynamic_offset: u32,
    pub range: u64,
    pub mip: u32,
    pub mip_range: u32,
}

impl Descriptor {
    /// `slot` must already include the register shift
    pub fn new(name: impl Into<String>, descriptor_type: DescriptorType, slot: u32, stage: ShaderStage) -> Self {
        Self {
            name: name.into(),
            descriptor_type,
            slot,
            stage,
            layout: ImageLayout::Undefined,
            resource: None,
            dynamic_offset: 0,
            range: 0,
            mip: 0,
            mip_range: 0,
        }
    }

    /// Build from an unshifted shader register, as reflection reports it
    pub fn from_register(
        name: impl Into<String>,
        descriptor_type: DescriptorType,
        register: u32,
        stage: ShaderStage,
    ) -> Self {
        Self::new(name, descriptor_type, register + register_shift(descriptor_type), stage)
    }

    /// Structural hash: type and slot
    pub fn compute_hash(&self) -> u64 {
        let hash = hash_combine(0, self.descriptor_type.as_u64());
        hash_combine(hash, self.slot as u64)
    }

    pub fn is_storage(&self) -> bool {
        matches!(
            self.descriptor_type,
            DescriptorType::TextureStorage | DescriptorType::StructuredBuffer
        )
    }

    pub(crate) fn clear_data(&mut self) {
        self.resource = None;
        self.mip = 0;
        self.mip_range = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_shift_moves_slots_apart() {
        let texture = Descriptor::from_register("albedo", DescriptorType::Texture, 0, ShaderStage::PIXEL);
        let storage = Descriptor::from_register("output", DescriptorType::TextureStorage, 0, ShaderStage::COMPUTE);
        let buffer = Descriptor::from_register("frame", DescriptorType::ConstantBuffer, 0, ShaderStage::VERTEX);
        let sampler = Descriptor::from_register("point", DescriptorType::Sampler, 0, ShaderStage::PIXEL);
        assert_eq!(texture.slot, 200);
        assert_eq!(storage.slot, 0);
        assert_eq!(buffer.slot, 100);
        assert_eq!(sampler.slot, 300);
    }

    #[test]
    fn structural_hash_ignores_bound_data() {
        let a = Descriptor::new("a", DescriptorType::Texture, 200, ShaderStage::PIXEL);
        let mut b = a.clone();
        b.mip = 3;
        b.resource = Some(BoundResource::Texture {
            id: ResourceId::from_raw(7),
            view: ImageViewHandle::from_raw(1),
        });
        assert_eq!(a.compute_hash(), b.compute_hash());

        let c = Descriptor::new("c", DescriptorType::TextureStorage, 200, ShaderStage::PIXEL);
        assert_ne!(a.compute_hash(), c.compute_hash());
    }
}
