// Opaque backend handles
//
// Each object category gets its own type so a fence can never be passed where
// a semaphore is expected. Zero is the null handle for every category.

macro_rules! define_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            pub struct $name(u64);

            impl $name {
                pub const NULL: Self = Self(0);

                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub const fn as_raw(self) -> u64 {
                    self.0
                }

                pub const fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

define_handle! {
    PhysicalDeviceHandle;
    BufferHandle;
    ImageHandle;
    ImageViewHandle;
    SamplerHandle;
    /// Backing memory of a buffer or image
    AllocationHandle;
    CommandPoolHandle;
    CommandBufferHandle;
    FenceHandle;
    SemaphoreHandle;
    DescriptorPoolHandle;
    DescriptorSetLayoutHandle;
    DescriptorSetHandle;
    /// Owned by pipeline construction, only consumed when binding sets
    PipelineLayoutHandle;
    SwapchainHandle;
    /// Identity of a bindable object, issued by the device context
    ResourceId;
}

/// GPU object that owns an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuResource {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

impl GpuResource {
    pub const fn is_null(self) -> bool {
        match self {
            GpuResource::Buffer(buffer) => buffer.is_null(),
            GpuResource::Image(image) => image.is_null(),
        }
    }
}

impl From<BufferHandle> for GpuResource {
    fn from(buffer: BufferHandle) -> Self {
        GpuResource::Buffer(buffer)
    }
}

impl From<ImageHandle> for GpuResource {
    fn from(image: ImageHandle) -> Self {
        GpuResource::Image(image)
    }
}
