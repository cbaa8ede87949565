// RHI - render hardware interface
//
// API-agnostic layer over a `Backend`. The device owns queues, memory and the
// descriptor-set cache; command pools recycle command lists; layouts resolve
// their bindings to cached descriptor sets.

pub mod command_list;
pub mod command_pool;
pub mod context;
pub mod definition;
pub mod descriptor;
pub mod descriptor_set;
pub mod descriptor_set_layout;
pub mod device;
pub mod format;
pub mod handle;
pub mod physical_device;
pub mod pipeline_state;
pub mod profiler;
pub mod resources;
pub mod shader;
pub mod sync;
pub mod texture;

pub use command_list::CommandList;
pub use command_pool::CommandPool;
pub use descriptor::Descriptor;
pub use descriptor_set_layout::{DescriptorSetLayout, ResolvedDescriptorSet};
pub use device::{Device, ImmediateCommandList};
pub use format::Format;
pub use pipeline_state::PipelineState;
pub use resources::{ConstantBuffer, IndexBuffer, Sampler, StructuredBuffer, VertexBuffer};
pub use shader::{CompiledShader, Shader};
pub use sync::{Fence, Semaphore};
pub use texture::Texture;
