// rhi-core - device layer of a renderer
//
// `rhi` is the API-agnostic core, `backend` translates it to Vulkan or to an
// in-memory headless device.

pub mod backend;
pub mod config;
pub mod rhi;

#[cfg(test)]
pub(crate) mod testing;
