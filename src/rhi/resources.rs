// Buffers and samplers
//
// Constant and structured buffers are host visible rings: every update moves
// a dynamic offset forward by one aligned stride, and the descriptor binds the
// buffer once with that offset supplied at bind time.
// Vertex and index buffers are either static (device local, filled once
// through a staging buffer on the copy queue) or dynamic (host visible).

use super::definition::{BufferUsage, IndexFormat, MemoryProperty, QueueType};
use super::device::Device;
use super::handle::{BufferHandle, ResourceId, SamplerHandle};
use crate::backend::{BufferDesc, SamplerDesc};
use anyhow::{ensure, Context, Result};
use std::sync::Arc;

fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

struct DynamicBuffer {
    device: Arc<Device>,
    id: ResourceId,
    name: String,
    buffer: BufferHandle,
    stride: u32,
    element_count: u32,
    offset: u32,
    reset_offset: bool,
}

impl DynamicBuffer {
    fn new(
        device: &Arc<Device>,
        name: &str,
        stride: u32,
        element_count: u32,
        alignment: u64,
        usage: BufferUsage,
    ) -> Result<Self> {
        assert!(stride > 0, "\"{}\" needs a non-zero stride", name);
        assert!(element_count > 0, "\"{}\" needs at least one element", name);

        let stride = u32::try_from(align_up(stride as u64, alignment))
            .with_context(|| format!("Aligned stride of \"{}\" doesn't fit in 32 bits", name))?;
        let size = stride as u64 * element_count as u64;
        // Every offset of the ring must be expressible as a 32 bit dynamic offset
        ensure!(
            size <= u32::MAX as u64,
            "\"{}\" needs {} bytes, more than dynamic offsets can address",
            name,
            size
        );
        let buffer = device.create_buffer(
            &BufferDesc {
                name,
                size,
                usage,
                memory: MemoryProperty::HOST_VISIBLE | MemoryProperty::HOST_COHERENT,
            },
            None,
        )?;

        Ok(Self {
            device: Arc::clone(device),
            id: device.context().next_resource_id(),
            name: name.to_string(),
            buffer,
            stride,
            element_count,
            offset: 0,
            reset_offset: true,
        })
    }

    fn update(&mut self, data: &[u8]) -> Result<()> {
        assert!(
            data.len() as u64 <= self.stride as u64,
            "Update of {} bytes exceeds the stride of \"{}\" ({} bytes)",
            data.len(),
            self.name,
            self.stride
        );

        let offset = if self.reset_offset {
            0
        } else {
            self.offset as u64 + self.stride as u64
        };

        let size = self.stride as u64 * self.element_count as u64;
        assert!(
            offset + self.stride as u64 <= size,
            "\"{}\" is out of memory, increase its element count",
            self.name
        );

        // Bounded by the size, which fits in 32 bits
        self.offset = offset as u32;
        self.reset_offset = false;
        self.device.write_mapped(self.buffer, offset, data)
    }
}

impl Drop for DynamicBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.device.queue_wait_all() {
            log::error!("Failed to wait for the queues before destroying \"{}\": {:#}", self.name, e);
        }
        self.device.destroy_buffer(self.buffer);
    }
}

macro_rules! dynamic_buffer_accessors {
    ($name:ident) => {
        impl $name {
            /// Write one element at the next offset of the ring
            pub fn update(&mut self, data: &[u8]) -> Result<()> {
                self.0.update(data)
            }

            /// Next update writes at offset zero again
            pub fn reset_offset(&mut self) {
                self.0.reset_offset = true;
            }

            pub fn id(&self) -> ResourceId {
                self.0.id
            }

            pub fn name(&self) -> &str {
                &self.0.name
            }

            pub fn buffer(&self) -> BufferHandle {
                self.0.buffer
            }

            /// Element size after alignment
            pub fn stride(&self) -> u32 {
                self.0.stride
            }

            pub fn element_count(&self) -> u32 {
                self.0.element_count
            }

            /// Dynamic offset of the last update
            pub fn offset(&self) -> u32 {
                self.0.offset
            }
        }
    };
}

/// Per-draw constants, bound as a dynamic uniform buffer
pub struct ConstantBuffer(DynamicBuffer);

impl ConstantBuffer {
    pub fn new(device: &Arc<Device>, name: &str, stride: u32, element_count: u32) -> Result<Self> {
        let alignment = device.limits().min_uniform_buffer_offset_alignment;
        DynamicBuffer::new(device, name, stride, element_count, alignment, BufferUsage::UNIFORM).map(Self)
    }
}

dynamic_buffer_accessors!(ConstantBuffer);

/// Shader storage, bound as a dynamic storage buffer
pub struct StructuredBuffer(DynamicBuffer);

impl StructuredBuffer {
    pub fn new(device: &Arc<Device>, name: &str, stride: u32, element_count: u32) -> Result<Self> {
        let alignment = device.limits().min_storage_buffer_offset_alignment;
        DynamicBuffer::new(device, name, stride, element_count, alignment, BufferUsage::STORAGE).map(Self)
    }
}

dynamic_buffer_accessors!(StructuredBuffer);

/// Create a device local buffer holding `data`, copied from a staging buffer
fn upload_staged(device: &Arc<Device>, desc: &BufferDesc<'_>, data: &[u8]) -> Result<BufferHandle> {
    let staging_name = format!("{}_staging", desc.name);
    let staging = device.create_buffer(
        &BufferDesc {
            name: &staging_name,
            size: desc.size,
            usage: BufferUsage::TRANSFER_SRC,
            memory: MemoryProperty::HOST_VISIBLE | MemoryProperty::HOST_COHERENT,
        },
        Some(data),
    )?;

    let uploaded = device.create_buffer(desc, None).and_then(|buffer| {
        let copied = device.immediate_begin(QueueType::Copy).and_then(|mut cmd_list| {
            cmd_list.copy_buffer(staging, buffer, desc.size);
            cmd_list.submit()
        });
        match copied {
            Ok(()) => Ok(buffer),
            Err(e) => {
                device.destroy_buffer(buffer);
                Err(e)
            }
        }
    });

    // The immediate submission already waited for the copy
    device.destroy_buffer(staging);
    uploaded
}

struct GeometryBuffer {
    device: Arc<Device>,
    name: String,
    buffer: BufferHandle,
    stride: u32,
    element_count: u32,
    mappable: bool,
}

impl GeometryBuffer {
    fn new_static(device: &Arc<Device>, name: &str, usage: BufferUsage, stride: u32, data: &[u8]) -> Result<Self> {
        assert!(stride > 0, "\"{}\" needs a non-zero stride", name);
        assert!(!data.is_empty(), "\"{}\" has no data to upload", name);
        assert!(
            data.len() % stride as usize == 0,
            "\"{}\" has {} bytes, not a whole number of {} byte elements",
            name,
            data.len(),
            stride
        );

        let element_count = u32::try_from(data.len() / stride as usize)
            .with_context(|| format!("\"{}\" has too many elements", name))?;
        let desc = BufferDesc {
            name,
            size: data.len() as u64,
            usage: usage | BufferUsage::TRANSFER_DST,
            memory: MemoryProperty::DEVICE_LOCAL,
        };
        let buffer = upload_staged(device, &desc, data)?;

        Ok(Self {
            device: Arc::clone(device),
            name: name.to_string(),
            buffer,
            stride,
            element_count,
            mappable: false,
        })
    }

    fn new_dynamic(device: &Arc<Device>, name: &str, usage: BufferUsage, stride: u32, element_count: u32) -> Result<Self> {
        assert!(stride > 0, "\"{}\" needs a non-zero stride", name);
        assert!(element_count > 0, "\"{}\" needs at least one element", name);

        let buffer = device.create_buffer(
            &BufferDesc {
                name,
                size: stride as u64 * element_count as u64,
                usage,
                memory: MemoryProperty::HOST_VISIBLE | MemoryProperty::HOST_COHERENT,
            },
            None,
        )?;

        Ok(Self {
            device: Arc::clone(device),
            name: name.to_string(),
            buffer,
            stride,
            element_count,
            mappable: true,
        })
    }

    fn update(&mut self, data: &[u8]) -> Result<()> {
        assert!(
            self.mappable,
            "\"{}\" lives in device local memory, only dynamic buffers can be updated",
            self.name
        );
        self.device.write_mapped(self.buffer, 0, data)
    }
}

impl Drop for GeometryBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.device.queue_wait_all() {
            log::error!("Failed to wait for the queues before destroying \"{}\": {:#}", self.name, e);
        }
        self.device.destroy_buffer(self.buffer);
    }
}

macro_rules! geometry_buffer_accessors {
    ($name:ident) => {
        impl $name {
            /// Overwrite the start of a dynamic buffer
            ///
            /// # Panics
            /// If the buffer is static, or `data` is larger than the buffer.
            pub fn update(&mut self, data: &[u8]) -> Result<()> {
                self.0.update(data)
            }

            pub fn name(&self) -> &str {
                &self.0.name
            }

            pub fn buffer(&self) -> BufferHandle {
                self.0.buffer
            }

            pub fn stride(&self) -> u32 {
                self.0.stride
            }

            /// Host visible and updatable
            pub fn is_mappable(&self) -> bool {
                self.0.mappable
            }

            pub fn size(&self) -> u64 {
                self.0.stride as u64 * self.0.element_count as u64
            }
        }
    };
}

pub struct VertexBuffer(GeometryBuffer);

impl VertexBuffer {
    /// Static vertices, `stride` bytes each
    pub fn new(device: &Arc<Device>, name: &str, stride: u32, vertices: &[u8]) -> Result<Self> {
        GeometryBuffer::new_static(device, name, BufferUsage::VERTEX, stride, vertices).map(Self)
    }

    pub fn new_dynamic(device: &Arc<Device>, name: &str, stride: u32, vertex_count: u32) -> Result<Self> {
        GeometryBuffer::new_dynamic(device, name, BufferUsage::VERTEX, stride, vertex_count).map(Self)
    }

    pub fn vertex_count(&self) -> u32 {
        self.0.element_count
    }
}

geometry_buffer_accessors!(VertexBuffer);

pub struct IndexBuffer(GeometryBuffer);

impl IndexBuffer {
    pub fn new_u16(device: &Arc<Device>, name: &str, indices: &[u16]) -> Result<Self> {
        let bytes: Vec<u8> = indices.iter().flat_map(|i| i.to_ne_bytes()).collect();
        Self::new_static(device, name, IndexFormat::U16, &bytes)
    }

    pub fn new_u32(device: &Arc<Device>, name: &str, indices: &[u32]) -> Result<Self> {
        let bytes: Vec<u8> = indices.iter().flat_map(|i| i.to_ne_bytes()).collect();
        Self::new_static(device, name, IndexFormat::U32, &bytes)
    }

    fn new_static(device: &Arc<Device>, name: &str, format: IndexFormat, bytes: &[u8]) -> Result<Self> {
        GeometryBuffer::new_static(device, name, BufferUsage::INDEX, format.stride(), bytes).map(Self)
    }

    pub fn new_dynamic(device: &Arc<Device>, name: &str, format: IndexFormat, index_count: u32) -> Result<Self> {
        GeometryBuffer::new_dynamic(device, name, BufferUsage::INDEX, format.stride(), index_count).map(Self)
    }

    pub fn index_count(&self) -> u32 {
        self.0.element_count
    }

    pub fn format(&self) -> IndexFormat {
        if self.0.stride == IndexFormat::U16.stride() {
            IndexFormat::U16
        } else {
            IndexFormat::U32
        }
    }

    pub fn is_16bit(&self) -> bool {
        self.format() == IndexFormat::U16
    }

    pub fn is_32bit(&self) -> bool {
        self.format() == IndexFormat::U32
    }
}

geometry_buffer_accessors!(IndexBuffer);

pub struct Sampler {
    device: Arc<Device>,
    id: ResourceId,
    handle: SamplerHandle,
    desc: SamplerDesc,
}

impl Sampler {
    pub fn new(device: &Arc<Device>, desc: SamplerDesc) -> Result<Self> {
        let handle = device.context().check(device.backend().create_sampler(&desc))?;
        Ok(Self {
            device: Arc::clone(device),
            id: device.context().next_resource_id(),
            handle,
            desc,
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn handle(&self) -> SamplerHandle {
        self.handle
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Err(e) = self.device.queue_wait_all() {
            log::error!("Failed to wait for the queues before destroying a sampler: {:#}", e);
        }
        self.device.backend().destroy_sampler(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendEvent;
    use crate::testing::headless_device;

    #[test]
    fn stride_is_aligned_to_device_limits() {
        let (device, _inspector) = headless_device();
        let cb = ConstantBuffer::new(&device, "frame", 80, 4).unwrap();
        assert_eq!(cb.stride(), 256);
        let sb = StructuredBuffer::new(&device, "particles", 80, 4).unwrap();
        assert_eq!(sb.stride(), 128);
    }

    #[test]
    fn updates_walk_the_ring() {
        let (device, inspector) = headless_device();
        let mut cb = ConstantBuffer::new(&device, "frame", 256, 3).unwrap();

        cb.update(&[1; 4]).unwrap();
        assert_eq!(cb.offset(), 0);
        cb.update(&[2; 4]).unwrap();
        assert_eq!(cb.offset(), 256);
        cb.update(&[3; 4]).unwrap();
        assert_eq!(cb.offset(), 512);

        let allocation = device.get_allocation_from_resource(cb.buffer()).unwrap();
        let contents = inspector.allocation_contents(allocation).unwrap();
        assert_eq!(contents[0], 1);
        assert_eq!(contents[256], 2);
        assert_eq!(contents[512], 3);

        cb.reset_offset();
        cb.update(&[4; 4]).unwrap();
        assert_eq!(cb.offset(), 0);
    }

    #[test]
    #[should_panic(expected = "is out of memory")]
    fn overflowing_the_ring_is_fatal() {
        let (device, _inspector) = headless_device();
        let mut sb = StructuredBuffer::new(&device, "small", 64, 2).unwrap();
        for _ in 0..3 {
            sb.update(&[0; 8]).unwrap();
        }
    }

    #[test]
    fn rings_past_32_bit_offsets_are_rejected() {
        let (device, _inspector) = headless_device();
        let result = ConstantBuffer::new(&device, "huge", 65536, 65537);
        assert!(result.is_err());
        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    fn last_element_of_a_full_ring_is_writable() {
        let (device, _inspector) = headless_device();
        let mut sb = StructuredBuffer::new(&device, "full", 64, 3).unwrap();
        for _ in 0..3 {
            sb.update(&[0; 8]).unwrap();
        }
        assert_eq!(sb.offset(), 128);
    }

    #[test]
    fn static_vertices_are_uploaded_through_the_copy_queue() {
        let (device, inspector) = headless_device();
        let vertices: Vec<u8> = (0..48).collect();
        inspector.clear_events();

        let vb = VertexBuffer::new(&device, "quad", 12, &vertices).unwrap();
        assert_eq!(vb.vertex_count(), 4);
        assert!(!vb.is_mappable());

        // Only the device local buffer survives, the staging buffer is gone
        assert_eq!(device.allocation_count(), 1);
        let allocation = device.get_allocation_from_resource(vb.buffer()).unwrap();
        assert_eq!(inspector.allocation_contents(allocation).unwrap(), vertices);

        let events = inspector.events();
        let copy = events
            .iter()
            .position(|e| matches!(e, BackendEvent::BufferCopied { dst, size: 48, .. } if *dst == vb.buffer()))
            .expect("vertices were copied");
        let submit = events
            .iter()
            .position(|e| matches!(e, BackendEvent::QueueSubmit { queue_type: QueueType::Copy, .. }))
            .expect("copy queue submission");
        let wait = events
            .iter()
            .rposition(|e| matches!(e, BackendEvent::FenceWait(_)))
            .expect("upload waited for the copy");
        assert!(copy < submit && submit < wait);
        assert_eq!(device.profiler().stats().immediate_submissions, 1);
    }

    #[test]
    fn consecutive_uploads_reuse_the_immediate_list() {
        let (device, inspector) = headless_device();
        let first = IndexBuffer::new_u16(&device, "first", &[0, 1, 2]).unwrap();
        let second = IndexBuffer::new_u32(&device, "second", &[0, 2, 3, 7]).unwrap();

        assert!(first.is_16bit());
        assert_eq!(first.index_count(), 3);
        assert!(second.is_32bit());
        assert_eq!(second.size(), 16);

        let allocation = device.get_allocation_from_resource(second.buffer()).unwrap();
        let expected: Vec<u8> = [0u32, 2, 3, 7].iter().flat_map(|i| i.to_ne_bytes()).collect();
        assert_eq!(inspector.allocation_contents(allocation).unwrap(), expected);
        assert_eq!(device.profiler().stats().immediate_submissions, 2);
    }

    #[test]
    fn dynamic_geometry_is_written_in_place() {
        let (device, inspector) = headless_device();
        let mut ib = IndexBuffer::new_dynamic(&device, "lines", IndexFormat::U32, 8).unwrap();
        assert!(ib.is_mappable());
        inspector.clear_events();

        ib.update(&[9; 8]).unwrap();
        let allocation = device.get_allocation_from_resource(ib.buffer()).unwrap();
        assert_eq!(&inspector.allocation_contents(allocation).unwrap()[..8], &[9; 8]);
        assert!(!inspector
            .events()
            .iter()
            .any(|e| matches!(e, BackendEvent::QueueSubmit { .. })));
    }

    #[test]
    #[should_panic(expected = "only dynamic buffers can be updated")]
    fn static_geometry_cant_be_updated() {
        let (device, _inspector) = headless_device();
        let mut vb = VertexBuffer::new(&device, "tri", 4, &[0; 12]).unwrap();
        let _ = vb.update(&[1; 4]);
    }

    #[test]
    #[should_panic(expected = "not a whole number of")]
    fn partial_vertices_are_fatal() {
        let (device, _inspector) = headless_device();
        let _ = VertexBuffer::new(&device, "broken", 12, &[0; 13]);
    }

    #[test]
    fn drop_frees_memory() {
        let (device, _inspector) = headless_device();
        let cb = ConstantBuffer::new(&device, "frame", 64, 1).unwrap();
        let sampler = Sampler::new(&device, SamplerDesc::default()).unwrap();
        assert_ne!(cb.id(), sampler.id());
        assert_eq!(device.allocation_count(), 1);
        drop(cb);
        drop(sampler);
        assert_eq!(device.allocation_count(), 0);
    }
}
