// Descriptor set - one pool-allocated combination of bindings
//
// Written once at creation and never updated; owned by the device's
// descriptor-set cache until the pool is recreated.

use super::context::DeviceContext;
use super::descriptor::Descriptor;
use super::handle::{DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle};
use anyhow::Result;

#[derive(Debug)]
pub struct DescriptorSet {
    handle: DescriptorSetHandle,
    name: String,
    hash: u64,
}

impl DescriptorSet {
    pub fn new(
        context: &DeviceContext,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        descriptors: &[Descriptor],
        name: &str,
        hash: u64,
    ) -> Result<Self> {
        let backend = context.backend();
        let handle = context.check(backend.allocate_descriptor_set(pool, layout, name))?;
        context.check(backend.update_descriptor_set(handle, descriptors))?;

        log::debug!("Created descriptor set \"{}\" ({:#018x})", name, hash);

        Ok(Self {
            handle,
            name: name.to_string(),
            hash,
        })
    }

    pub fn handle(&self) -> DescriptorSetHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}
