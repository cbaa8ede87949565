// RHI definitions - enums, flags and constants shared by every component

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiType {
    Vulkan,
    Headless,
}

/// Kind of adapter, declared in ranking order (worst first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysicalDeviceType {
    Undefined,
    Cpu,
    Virtual,
    Integrated,
    Discrete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Copy,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Graphics, QueueType::Compute, QueueType::Copy];

    pub const fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::Compute => 1,
            QueueType::Copy => 2,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            QueueType::Graphics => "graphics",
            QueueType::Compute => "compute",
            QueueType::Copy => "copy",
        }
    }

    /// Stage the queue's submissions wait at when chained behind a semaphore
    pub fn wait_stage(self) -> PipelineStage {
        match self {
            QueueType::Graphics => PipelineStage::COLOR_ATTACHMENT_OUTPUT,
            QueueType::Compute => PipelineStage::COMPUTE_SHADER,
            QueueType::Copy => PipelineStage::TRANSFER,
        }
    }
}

/// CPU-side view of a fence or semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandListState {
    #[default]
    Idle,
    Recording,
    Ended,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Sampler,
    Texture,
    TextureStorage,
    ConstantBuffer,
    StructuredBuffer,
}

impl DescriptorType {
    /// Buffers are bound with a dynamic offset
    pub const fn is_dynamic(self) -> bool {
        matches!(self, DescriptorType::ConstantBuffer | DescriptorType::StructuredBuffer)
    }

    pub(crate) const fn as_u64(self) -> u64 {
        match self {
            DescriptorType::Sampler => 0,
            DescriptorType::Texture => 1,
            DescriptorType::TextureStorage => 2,
            DescriptorType::ConstantBuffer => 3,
            DescriptorType::StructuredBuffer => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    Preinitialized,
    ColorAttachmentOptimal,
    DepthAttachmentOptimal,
    DepthStencilAttachmentOptimal,
    DepthStencilReadOnlyOptimal,
    ShaderReadOnlyOptimal,
    TransferSrcOptimal,
    TransferDstOptimal,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShaderCompilationState {
    #[default]
    Idle,
    Compiling,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    TriangleList,
    LineList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub const fn stride(self) -> u32 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerAddressMode {
    Wrap,
    Mirror,
    Clamp,
    ClampToZero,
    MirrorOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

bitflags! {
    /// Capabilities advertised by a queue family
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE  = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStage: u32 {
        const VERTEX  = 1 << 0;
        const PIXEL   = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStage: u32 {
        const TOP_OF_PIPE             = 1 << 0;
        const VERTEX_SHADER           = 1 << 1;
        const FRAGMENT_SHADER         = 1 << 2;
        const COMPUTE_SHADER          = 1 << 3;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 4;
        const TRANSFER                = 1 << 5;
        const BOTTOM_OF_PIPE          = 1 << 6;
        const ALL_COMMANDS            = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM      = 1 << 2;
        const STORAGE      = 1 << 3;
        const INDEX        = 1 << 4;
        const VERTEX       = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperty: u32 {
        const DEVICE_LOCAL  = 1 << 0;
        const HOST_VISIBLE  = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED   = 1 << 3;
    }
}

bitflags! {
    /// How a texture may be viewed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SRV = 1 << 0;
        const UAV = 1 << 1;
        const RTV = 1 << 2;
        const DSV = 1 << 3;
    }
}

// Shader register shifts, matching the shader compiler's binding layout
pub const SHADER_SHIFT_REGISTER_U: u32 = 0;
pub const SHADER_SHIFT_REGISTER_B: u32 = 100;
pub const SHADER_SHIFT_REGISTER_T: u32 = 200;
pub const SHADER_SHIFT_REGISTER_S: u32 = 300;

// Descriptor pool limits, per descriptor type
pub const DESCRIPTOR_MAX_SAMPLERS: u32 = 32;
pub const DESCRIPTOR_MAX_TEXTURES: u32 = 16384;
pub const DESCRIPTOR_MAX_STORAGE_TEXTURES: u32 = 16384;
pub const DESCRIPTOR_MAX_STORAGE_BUFFERS: u32 = 32;
pub const DESCRIPTOR_MAX_CONSTANT_BUFFERS_DYNAMIC: u32 = 32;
pub const DESCRIPTOR_SET_CAPACITY_DEFAULT: u32 = 2048;

pub const ALL_MIPS: u32 = u32::MAX;
pub const MAX_MIP_COUNT: u32 = 13;
pub const MAX_RENDER_TARGET_COUNT: usize = 8;
pub const FENCE_TIMEOUT_DEFAULT_NS: u64 = 1_000_000_000;

/// Fold `value` into `seed`
///
/// `seed ^= value + 0x9e3779b9 + (seed << 6) + (seed >> 2)`, with the value
/// hashed by identity. Order dependent.
#[inline]
pub fn hash_combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_combine_is_order_dependent() {
        let ab = hash_combine(hash_combine(0, 1), 2);
        let ba = hash_combine(hash_combine(0, 2), 1);
        assert_ne!(ab, ba);
    }

    #[test]
    fn hash_combine_matches_reference_fold() {
        // 0 ^ (5 + 0x9e3779b9 + 0 + 0)
        assert_eq!(hash_combine(0, 5), 0x9e37_79be);

        let seed = 0x9e37_79be_u64;
        let expected = seed ^ (7 + 0x9e37_79b9 + (seed << 6) + (seed >> 2));
        assert_eq!(hash_combine(seed, 7), expected);
    }

    #[test]
    fn physical_device_types_rank_discrete_first() {
        let mut types = vec![
            PhysicalDeviceType::Cpu,
            PhysicalDeviceType::Discrete,
            PhysicalDeviceType::Undefined,
            PhysicalDeviceType::Integrated,
            PhysicalDeviceType::Virtual,
        ];
        types.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            types,
            vec![
                PhysicalDeviceType::Discrete,
                PhysicalDeviceType::Integrated,
                PhysicalDeviceType::Virtual,
                PhysicalDeviceType::Cpu,
                PhysicalDeviceType::Undefined,
            ]
        );
    }

    #[test]
    fn queue_types_index_their_slots() {
        for (i, queue_type) in QueueType::ALL.iter().enumerate() {
            assert_eq!(queue_type.index(), i);
        }
    }
}
