// Device - root owner of GPU state
//
// Responsibilities:
// - Physical device detection and selection
// - Queue submission, presentation and waits (through the device context)
// - Allocation table: every buffer/image and its backing memory
// - Descriptor pool and the descriptor-set cache
// - Command pool ownership and immediate (blocking) submission

use super::command_list::CommandList;
use super::command_pool::CommandPool;
use super::context::DeviceContext;
use super::definition::{
    ApiType, CommandListState, DescriptorType, PipelineStage, QueueType,
    DESCRIPTOR_MAX_CONSTANT_BUFFERS_DYNAMIC, DESCRIPTOR_MAX_SAMPLERS,
    DESCRIPTOR_MAX_STORAGE_BUFFERS, DESCRIPTOR_MAX_STORAGE_TEXTURES, DESCRIPTOR_MAX_TEXTURES,
    DESCRIPTOR_SET_CAPACITY_DEFAULT,
};
use super::descriptor::Descriptor;
use super::descriptor_set::DescriptorSet;
use super::handle::{
    AllocationHandle, BufferHandle, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, GpuResource, ImageHandle, SwapchainHandle,
};
use super::physical_device::{
    rank_physical_devices, select_queue_families, DeviceFeatures, DeviceLimits, PhysicalDevice,
    QueueFamilyIndices,
};
use super::profiler::Profiler;
use super::sync::{Fence, Semaphore};
use crate::backend::{Backend, BufferDesc, DescriptorPoolSize, TextureDesc};
use crate::config::DeviceConfig;
use anyhow::{bail, Context, Result};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

const DESCRIPTOR_POOL_SIZES: [DescriptorPoolSize; 5] = [
    DescriptorPoolSize { descriptor_type: DescriptorType::Sampler, count: DESCRIPTOR_MAX_SAMPLERS },
    DescriptorPoolSize { descriptor_type: DescriptorType::Texture, count: DESCRIPTOR_MAX_TEXTURES },
    DescriptorPoolSize { descriptor_type: DescriptorType::TextureStorage, count: DESCRIPTOR_MAX_STORAGE_TEXTURES },
    DescriptorPoolSize { descriptor_type: DescriptorType::StructuredBuffer, count: DESCRIPTOR_MAX_STORAGE_BUFFERS },
    DescriptorPoolSize { descriptor_type: DescriptorType::ConstantBuffer, count: DESCRIPTOR_MAX_CONSTANT_BUFFERS_DYNAMIC },
];

#[derive(Debug, Clone, Copy)]
struct TrackedAllocation {
    handle: AllocationHandle,
    size: u64,
}

struct DescriptorCache {
    pool: DescriptorPoolHandle,
    capacity: u32,
    sets: HashMap<u64, DescriptorSet>,
}

pub struct Device {
    context: Arc<DeviceContext>,
    physical_devices: Vec<PhysicalDevice>,
    primary_physical_device: usize,
    features: DeviceFeatures,
    limits: DeviceLimits,
    gpu_profiling: bool,
    enabled_graphics_stages: PipelineStage,
    allocations: Mutex<HashMap<GpuResource, TrackedAllocation>>,
    descriptors: Mutex<DescriptorCache>,
    cmd_pools: Mutex<Vec<Arc<Mutex<CommandPool>>>>,
    cmd_pools_immediate: Mutex<[CommandPool; 3]>,
    profiler: Profiler,
}

impl Device {
    /// Select a physical device and bring up everything the RHI needs on it
    pub fn new<B: Backend + 'static>(config: &DeviceConfig, mut backend: B) -> Result<Arc<Self>> {
        log::info!("Initializing {:?} device", backend.api_type());

        // ─── Detect physical devices ────────────────────────────────────────
        let mut physical_devices = backend
            .enumerate_physical_devices()
            .context("Failed to enumerate physical devices")?;
        if physical_devices.is_empty() {
            bail!("No {:?} capable GPU found", backend.api_type());
        }
        rank_physical_devices(&mut physical_devices);
        for physical_device in &physical_devices {
            log::info!(
                "Found {} {} ({} MB, API {})",
                physical_device.vendor_name(),
                physical_device.name(),
                physical_device.memory_mb(),
                physical_device.api_version_string()
            );
        }

        // ─── Select the primary physical device ─────────────────────────────
        let mut selected = None;
        for (i, physical_device) in physical_devices.iter().enumerate() {
            let families = backend.queue_family_flags(physical_device)?;
            if let Some(queue_families) = select_queue_families(&families) {
                selected = Some((i, queue_families));
                break;
            }
            log::warn!("{} doesn't expose every queue type, skipping it", physical_device.name());
        }
        let (primary_physical_device, queue_families) =
            selected.context("Couldn't find a suitable physical device")?;
        let physical_device = &physical_devices[primary_physical_device];

        // ─── Features and limits ────────────────────────────────────────────
        let supported = backend.supported_features(physical_device)?;
        let features = DeviceFeatures::resolve(&supported);
        let limits = backend.device_limits(physical_device)?;

        let mut gpu_profiling = config.gpu_profiling;
        if gpu_profiling && !limits.timestamp_compute_and_graphics {
            log::error!("Device doesn't support timestamps, GPU profiling will be disabled");
            gpu_profiling = false;
        }

        // ─── Logical device ─────────────────────────────────────────────────
        backend
            .create_device(physical_device, &queue_families, &features)
            .context("Failed to create the logical device")?;
        log::info!(
            "Selected {} (queue families: graphics {}, compute {}, copy {})",
            physical_device.name(),
            queue_families.graphics,
            queue_families.compute,
            queue_families.copy
        );

        let context = Arc::new(DeviceContext::new(Box::new(backend), queue_families, config.gpu_markers));

        // ─── Immediate command pools ────────────────────────────────────────
        let cmd_pools_immediate = [
            create_immediate_pool(&context, QueueType::Graphics)?,
            create_immediate_pool(&context, QueueType::Compute)?,
            create_immediate_pool(&context, QueueType::Copy)?,
        ];

        let device = Arc::new(Self {
            context,
            physical_devices,
            primary_physical_device,
            features,
            limits,
            gpu_profiling,
            enabled_graphics_stages: PipelineStage::VERTEX_SHADER | PipelineStage::FRAGMENT_SHADER,
            allocations: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(DescriptorCache {
                pool: DescriptorPoolHandle::NULL,
                capacity: DESCRIPTOR_SET_CAPACITY_DEFAULT,
                sets: HashMap::new(),
            }),
            cmd_pools: Mutex::new(Vec::new()),
            cmd_pools_immediate: Mutex::new(cmd_pools_immediate),
            profiler: Profiler::default(),
        });

        // ─── Descriptor pool ────────────────────────────────────────────────
        device.set_descriptor_set_capacity(config.descriptor_set_capacity)?;

        Ok(device)
    }

    // =========================================================================
    // QUEUES
    // =========================================================================

    pub fn queue_submit(
        &self,
        queue_type: QueueType,
        wait_stage: PipelineStage,
        cmd: CommandBufferHandle,
        wait_semaphore: Option<&Semaphore>,
        signal_semaphore: Option<&Semaphore>,
        signal_fence: Option<&Fence>,
    ) -> Result<()> {
        self.context
            .queue_submit(queue_type, wait_stage, cmd, wait_semaphore, signal_semaphore, signal_fence)
    }

    pub fn queue_present(&self, swapchain: SwapchainHandle, image_index: u32, wait_semaphores: &[&Semaphore]) -> Result<()> {
        self.context.queue_present(swapchain, image_index, wait_semaphores)
    }

    pub fn queue_wait(&self, queue_type: QueueType) -> Result<()> {
        self.context.queue_wait(queue_type)
    }

    pub fn queue_wait_all(&self) -> Result<()> {
        self.context.queue_wait_all()
    }

    pub fn queue_family_index(&self, queue_type: QueueType) -> u32 {
        self.context.queue_families().get(queue_type)
    }

    // =========================================================================
    // MEMORY
    // =========================================================================

    /// Create a buffer, optionally filled with `data_initial`
    ///
    /// # Panics
    /// If initial data is given for memory that isn't host visible.
    pub fn create_buffer(&self, desc: &BufferDesc<'_>, data_initial: Option<&[u8]>) -> Result<BufferHandle> {
        if let Some(data) = data_initial {
            assert!(
                desc.is_mappable(),
                "Can't map \"{}\", initial data requires host visible memory",
                desc.name
            );
            assert!(
                data.len() as u64 <= desc.size,
                "Initial data of \"{}\" is larger than the buffer",
                desc.name
            );
        }

        let backend = self.context.backend();
        let mut allocations = self.allocations.lock();

        let (buffer, allocation) = self
            .context
            .check(backend.create_buffer(desc).with_context(|| format!("Failed to create buffer \"{}\"", desc.name)))?;

        if let Some(data) = data_initial.filter(|d| !d.is_empty()) {
            let upload = (|| -> Result<()> {
                let mapped = backend.map_memory(allocation)?;
                // SAFETY: the mapping spans the whole buffer and `data` fits in it
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr(), data.len()) };
                let flushed = backend.flush_allocation(allocation, 0, data.len() as u64);
                backend.unmap_memory(allocation);
                flushed
            })();

            if let Err(e) = self
                .context
                .check(upload.with_context(|| format!("Failed to upload initial data of \"{}\"", desc.name)))
            {
                backend.destroy_buffer(buffer, allocation);
                return Err(e);
            }
        }

        allocations.insert(
            GpuResource::Buffer(buffer),
            TrackedAllocation { handle: allocation, size: desc.size },
        );
        log::debug!("Created buffer \"{}\" ({} bytes)", desc.name, desc.size);

        Ok(buffer)
    }

    /// Release a buffer and its memory, null is ignored
    pub fn destroy_buffer(&self, buffer: BufferHandle) {
        if buffer.is_null() {
            return;
        }

        let mut allocations = self.allocations.lock();
        match allocations.remove(&GpuResource::Buffer(buffer)) {
            Some(tracked) => self.context.backend().destroy_buffer(buffer, tracked.handle),
            None => log::warn!("Buffer {:?} has no allocation, it can't be destroyed", buffer),
        }
    }

    pub fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<ImageHandle> {
        let mut allocations = self.allocations.lock();
        let (image, allocation) = self.context.check(
            self.context
                .backend()
                .create_texture(desc)
                .with_context(|| format!("Failed to create texture \"{}\"", desc.name)),
        )?;
        allocations.insert(GpuResource::Image(image), TrackedAllocation { handle: allocation, size: 0 });
        log::debug!("Created texture \"{}\" ({}x{})", desc.name, desc.width, desc.height);
        Ok(image)
    }

    pub fn destroy_texture(&self, image: ImageHandle) {
        assert!(!image.is_null(), "Can't destroy a null image");

        let mut allocations = self.allocations.lock();
        match allocations.remove(&GpuResource::Image(image)) {
            Some(tracked) => self.context.backend().destroy_texture(image, tracked.handle),
            None => log::warn!("Image {:?} has no allocation, it can't be destroyed", image),
        }
    }

    pub fn map_memory(&self, resource: impl Into<GpuResource>) -> Result<NonNull<u8>> {
        let allocation = self.allocation(resource.into())?;
        self.context.check(self.context.backend().map_memory(allocation))
    }

    /// # Panics
    /// If `mapped` was already unmapped.
    pub fn unmap_memory(&self, resource: impl Into<GpuResource>, mapped: &mut Option<NonNull<u8>>) -> Result<()> {
        assert!(mapped.is_some(), "Memory is already unmapped");

        let allocation = self.allocation(resource.into())?;
        self.context.backend().unmap_memory(allocation);
        *mapped = None;
        Ok(())
    }

    pub fn flush_allocation(&self, resource: impl Into<GpuResource>, offset: u64, size: u64) -> Result<()> {
        let allocation = self.allocation(resource.into())?;
        self.context
            .check(self.context.backend().flush_allocation(allocation, offset, size))
    }

    /// Persistent mapping of a host visible buffer
    pub fn get_mapped_data_from_buffer(&self, buffer: BufferHandle) -> Option<NonNull<u8>> {
        let allocation = self.get_allocation_from_resource(buffer)?;
        self.context.backend().mapped_ptr(allocation)
    }

    pub fn get_allocation_from_resource(&self, resource: impl Into<GpuResource>) -> Option<AllocationHandle> {
        self.allocations
            .lock()
            .get(&resource.into())
            .map(|tracked| tracked.handle)
    }

    /// Copy into a host visible buffer at `offset` and flush the written range
    pub fn write_mapped(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let allocations = self.allocations.lock();
        let tracked = *allocations
            .get(&GpuResource::Buffer(buffer))
            .context("Buffer has no allocation")?;
        assert!(
            offset + data.len() as u64 <= tracked.size,
            "Writing {} bytes at offset {} overflows a {} byte buffer",
            data.len(),
            offset,
            tracked.size
        );

        let backend = self.context.backend();
        let mapped = backend
            .mapped_ptr(tracked.handle)
            .context("Buffer isn't host visible")?;
        // SAFETY: the range was checked against the buffer size above
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr().add(offset as usize), data.len());
        }
        self.context
            .check(backend.flush_allocation(tracked.handle, offset, data.len() as u64))
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().len()
    }

    fn allocation(&self, resource: GpuResource) -> Result<AllocationHandle> {
        self.allocations
            .lock()
            .get(&resource)
            .map(|tracked| tracked.handle)
            .with_context(|| format!("No allocation found for {:?}", resource))
    }

    // =========================================================================
    // DESCRIPTORS
    // =========================================================================

    /// Recreate the descriptor pool with room for `capacity` sets
    ///
    /// Every cached set dies with the old pool, so the cache is cleared under
    /// the same lock. A capacity of zero re-applies the current one.
    pub fn set_descriptor_set_capacity(&self, capacity: u32) -> Result<()> {
        let mut cache = self.descriptors.lock();
        let capacity = if capacity == 0 { cache.capacity } else { capacity };

        if capacity == cache.capacity && !cache.pool.is_null() {
            log::warn!("Descriptor set capacity is already {}, is this needed?", capacity);
        }

        // The GPU may still read from sets of the old pool
        self.context.queue_wait_all()?;

        let backend = self.context.backend();
        cache.sets.clear();
        if !cache.pool.is_null() {
            backend.destroy_descriptor_pool(cache.pool);
            cache.pool = DescriptorPoolHandle::NULL;
        }

        cache.pool = self
            .context
            .check(backend.create_descriptor_pool(capacity, &DESCRIPTOR_POOL_SIZES))?;
        cache.capacity = capacity;
        self.profiler.reset_descriptor_sets(capacity);

        log::info!("Descriptor set capacity has been set to {}", capacity);
        Ok(())
    }

    pub fn has_descriptor_set_capacity(&self) -> bool {
        let cache = self.descriptors.lock();
        (cache.sets.len() as u32) < cache.capacity
    }

    pub fn descriptor_set_capacity(&self) -> u32 {
        self.descriptors.lock().capacity
    }

    pub fn descriptor_set_count(&self) -> usize {
        self.descriptors.lock().sets.len()
    }

    /// Cached set for `hash`, created from `descriptors` on a miss
    ///
    /// Returns the set and whether it was just created.
    ///
    /// # Panics
    /// When a new set is needed but the pool is at capacity.
    pub(crate) fn get_or_create_descriptor_set(
        &self,
        hash: u64,
        layout: DescriptorSetLayoutHandle,
        descriptors: &[Descriptor],
        name: &str,
    ) -> Result<(DescriptorSetHandle, bool)> {
        let mut cache = self.descriptors.lock();
        if let Some(set) = cache.sets.get(&hash) {
            return Ok((set.handle(), false));
        }

        assert!(
            (cache.sets.len() as u32) < cache.capacity,
            "Descriptor pool has no more memory to allocate another descriptor set, capacity is {}",
            cache.capacity
        );

        let set = DescriptorSet::new(&self.context, cache.pool, layout, descriptors, name, hash)?;
        let handle = set.handle();
        cache.sets.insert(hash, set);
        self.profiler.descriptor_set_created();

        Ok((handle, true))
    }

    // =========================================================================
    // COMMAND POOLS
    // =========================================================================

    pub fn allocate_command_pool(&self, name: &str, swap_chain_id: u64) -> Arc<Mutex<CommandPool>> {
        let pool = Arc::new(Mutex::new(CommandPool::new(self.context.clone(), name, swap_chain_id)));
        self.cmd_pools.lock().push(Arc::clone(&pool));
        pool
    }

    pub fn destroy_command_pool(&self, pool: &Arc<Mutex<CommandPool>>) {
        self.cmd_pools.lock().retain(|p| !Arc::ptr_eq(p, pool));
    }

    pub fn command_pools(&self) -> Vec<Arc<Mutex<CommandPool>>> {
        self.cmd_pools.lock().clone()
    }

    /// Begin recording on the queue's immediate list
    ///
    /// The returned guard holds the immediate lock until it is submitted or
    /// dropped, so immediate work is serialized across threads.
    pub fn immediate_begin(&self, queue_type: QueueType) -> Result<ImmediateCommandList<'_>> {
        let guard = MutexGuard::map(self.cmd_pools_immediate.lock(), |pools| &mut pools[queue_type.index()]);
        let mut immediate = ImmediateCommandList {
            pool: guard,
            profiler: &self.profiler,
        };
        immediate.begin()?;
        Ok(immediate)
    }

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    pub fn backend(&self) -> &dyn Backend {
        self.context.backend()
    }

    pub fn api_type(&self) -> ApiType {
        self.context.backend().api_type()
    }

    pub fn physical_devices(&self) -> &[PhysicalDevice] {
        &self.physical_devices
    }

    pub fn primary_physical_device(&self) -> &PhysicalDevice {
        &self.physical_devices[self.primary_physical_device]
    }

    pub fn queue_families(&self) -> &QueueFamilyIndices {
        self.context.queue_families()
    }

    pub fn features(&self) -> &DeviceFeatures {
        &self.features
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn gpu_profiling(&self) -> bool {
        self.gpu_profiling
    }

    /// Shader stages a graphics pipeline can run on this device
    pub fn enabled_graphics_stages(&self) -> PipelineStage {
        self.enabled_graphics_stages
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn is_valid_resolution(&self, width: u32, height: u32) -> bool {
        width > 0
            && height > 0
            && width <= self.limits.max_texture_2d_dimension
            && height <= self.limits.max_texture_2d_dimension
    }
}

fn create_immediate_pool(context: &Arc<DeviceContext>, queue_type: QueueType) -> Result<CommandPool> {
    let name = format!("immediate_{}", queue_type.as_str());
    let mut pool = CommandPool::new(context.clone(), &name, 0);
    pool.allocate_command_lists(queue_type, 1, 1)?;
    Ok(pool)
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying device...");

        if let Err(e) = self.context.queue_wait_all() {
            log::error!("Failed to wait for the queues: {:#}", e);
        }

        self.cmd_pools.get_mut().clear();

        let backend = self.context.backend();
        let cache = self.descriptors.get_mut();
        cache.sets.clear();
        if !cache.pool.is_null() {
            backend.destroy_descriptor_pool(cache.pool);
            cache.pool = DescriptorPoolHandle::NULL;
        }

        let leaked = self.allocations.get_mut().len();
        assert!(
            leaked == 0,
            "There are still {} allocations, every buffer and texture must be destroyed before the device",
            leaked
        );
        backend.destroy_allocator();
    }
}

/// Recording immediate command list, see [`Device::immediate_begin`]
pub struct ImmediateCommandList<'a> {
    pool: MappedMutexGuard<'a, CommandPool>,
    profiler: &'a Profiler,
}

impl ImmediateCommandList<'_> {
    // The single list is idle here (the previous user submitted and waited, or
    // the abandoned guard recovered it), so its native pool can be reset
    fn begin(&mut self) -> Result<()> {
        self.pool.reset(0)?;
        self.pool.current_command_list().begin()
    }

    /// End, submit and block until the GPU is done
    pub fn submit(mut self) -> Result<()> {
        let cmd_list = self.pool.current_command_list();
        cmd_list.end()?;
        cmd_list.submit(None)?;
        cmd_list.wait(false)?;
        self.profiler.immediate_submitted();
        Ok(())
    }
}

impl Deref for ImmediateCommandList<'_> {
    type Target = CommandList;

    fn deref(&self) -> &CommandList {
        self.pool.current()
    }
}

impl DerefMut for ImmediateCommandList<'_> {
    fn deref_mut(&mut self) -> &mut CommandList {
        self.pool.current_command_list()
    }
}

impl Drop for ImmediateCommandList<'_> {
    fn drop(&mut self) {
        let cmd_list = self.pool.current_command_list();
        if cmd_list.state() == CommandListState::Idle {
            return;
        }

        // Abandoned without a submit, bring the list back to idle for the next user
        log::warn!("Immediate command list \"{}\" dropped without a submit", cmd_list.name());
        if let Err(e) = return_to_idle(cmd_list) {
            log::error!("Failed to recover immediate command list: {:#}", e);
        }
    }
}

fn return_to_idle(cmd_list: &mut CommandList) -> Result<()> {
    if cmd_list.state() == CommandListState::Recording {
        cmd_list.end()?;
    }
    if cmd_list.state() == CommandListState::Ended {
        cmd_list.discard();
        cmd_list.submit(None)?;
    }
    if cmd_list.state() == CommandListState::Submitted {
        cmd_list.wait(false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, HeadlessAdapter, HeadlessBackend};
    use crate::rhi::definition::{BufferUsage, MemoryProperty, PhysicalDeviceType, QueueFlags};
    use crate::testing::{headless_device, headless_device_with};

    fn upload_desc(name: &str) -> BufferDesc<'_> {
        BufferDesc {
            name,
            size: 64,
            usage: BufferUsage::TRANSFER_SRC,
            memory: MemoryProperty::HOST_VISIBLE | MemoryProperty::HOST_COHERENT,
        }
    }

    #[test]
    fn selects_best_adapter_with_every_queue() {
        let backend = HeadlessBackend::with_adapters(vec![
            HeadlessAdapter::new("integrated", PhysicalDeviceType::Integrated, 2048),
            HeadlessAdapter::discrete("compute only", 16384)
                .with_queue_families(vec![QueueFlags::COMPUTE | QueueFlags::TRANSFER]),
            HeadlessAdapter::discrete("discrete", 8192),
        ]);
        let (device, _inspector) = headless_device_with(DeviceConfig::default(), backend);

        assert_eq!(device.primary_physical_device().name(), "discrete");
        assert_eq!(device.physical_devices()[0].name(), "compute only");
        assert_eq!(device.queue_family_index(QueueType::Compute), 1);
        assert_eq!(device.queue_family_index(QueueType::Copy), 2);
        assert_eq!(
            device.enabled_graphics_stages(),
            PipelineStage::VERTEX_SHADER | PipelineStage::FRAGMENT_SHADER
        );
    }

    #[test]
    fn no_suitable_adapter_fails_startup() {
        let backend = HeadlessBackend::with_adapters(vec![HeadlessAdapter::discrete("copy only", 1)
            .with_queue_families(vec![QueueFlags::TRANSFER])]);
        assert!(Device::new(&DeviceConfig::default(), backend).is_err());
    }

    #[test]
    fn gpu_profiling_requires_timestamps() {
        let limits = DeviceLimits {
            timestamp_compute_and_graphics: false,
            ..DeviceLimits::default()
        };
        let backend = HeadlessBackend::with_adapters(vec![HeadlessAdapter::discrete("gpu", 1).with_limits(limits)]);
        let config = DeviceConfig {
            gpu_profiling: true,
            ..DeviceConfig::default()
        };
        let (device, _inspector) = headless_device_with(config, backend);
        assert!(!device.gpu_profiling());
    }

    #[test]
    fn initial_data_is_uploaded_and_flushed() {
        let (device, inspector) = headless_device();
        let data = [7u8; 16];
        let buffer = device.create_buffer(&upload_desc("staging"), Some(&data)).unwrap();

        let allocation = device.get_allocation_from_resource(buffer).unwrap();
        let contents = inspector.allocation_contents(allocation).unwrap();
        assert_eq!(&contents[..16], &data);
        assert!(contents[16..].iter().all(|b| *b == 0));
        assert!(!inspector.is_mapped(allocation));
        assert!(inspector.events().contains(&BackendEvent::AllocationFlushed {
            allocation,
            offset: 0,
            size: 16
        }));

        device.destroy_buffer(buffer);
        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    #[should_panic(expected = "initial data requires host visible memory")]
    fn initial_data_needs_mappable_memory() {
        let (device, _inspector) = headless_device();
        let desc = BufferDesc {
            name: "vertices",
            size: 64,
            usage: BufferUsage::VERTEX,
            memory: MemoryProperty::DEVICE_LOCAL,
        };
        let _ = device.create_buffer(&desc, Some(&[0u8; 4]));
    }

    #[test]
    fn mapping_round_trip() {
        let (device, inspector) = headless_device();
        let buffer = device.create_buffer(&upload_desc("readback"), None).unwrap();

        let mut mapped = Some(device.map_memory(buffer).unwrap());
        let allocation = device.get_allocation_from_resource(buffer).unwrap();
        assert!(inspector.is_mapped(allocation));

        device.write_mapped(buffer, 8, &[1, 2, 3]).unwrap();
        device.flush_allocation(buffer, 8, 3).unwrap();
        device.unmap_memory(buffer, &mut mapped).unwrap();
        assert!(mapped.is_none());
        assert_eq!(&inspector.allocation_contents(allocation).unwrap()[8..11], &[1, 2, 3]);

        device.destroy_buffer(buffer);
    }

    #[test]
    #[should_panic(expected = "Memory is already unmapped")]
    fn double_unmap_is_fatal() {
        let (device, _inspector) = headless_device();
        let buffer = device.create_buffer(&upload_desc("buffer"), None).unwrap();
        let mut mapped = None;
        let _ = device.unmap_memory(buffer, &mut mapped);
    }

    #[test]
    #[should_panic(expected = "There are still 1 allocations")]
    fn teardown_with_live_allocations_is_fatal() {
        let (device, _inspector) = headless_device();
        device.create_buffer(&upload_desc("leaked"), None).unwrap();
        drop(device);
    }

    #[test]
    fn teardown_releases_everything() {
        let (device, inspector) = headless_device();
        let pool = device.allocate_command_pool("frame", 0);
        pool.lock().allocate_command_lists(QueueType::Graphics, 2, 2).unwrap();
        drop(pool);
        drop(device);

        let events = inspector.events();
        assert!(events.contains(&BackendEvent::AllocatorDestroyed));
        assert!(events.iter().any(|e| matches!(e, BackendEvent::DescriptorPoolDestroyed(_))));
        assert_eq!(inspector.live_command_pools(), 0);
        assert_eq!(inspector.live_fences(), 0);
    }

    #[test]
    fn capacity_change_recreates_pool_and_clears_cache() {
        let (device, inspector) = headless_device();
        assert_eq!(device.descriptor_set_capacity(), DESCRIPTOR_SET_CAPACITY_DEFAULT);

        let layout = device.backend().create_descriptor_set_layout(&[], "layout").unwrap();
        device.get_or_create_descriptor_set(1, layout, &[], "a").unwrap();
        device.get_or_create_descriptor_set(2, layout, &[], "b").unwrap();
        assert_eq!(device.descriptor_set_count(), 2);
        assert_eq!(device.profiler().descriptor_set_count(), 2);

        inspector.clear_events();
        device.set_descriptor_set_capacity(16).unwrap();

        assert_eq!(device.descriptor_set_capacity(), 16);
        assert_eq!(device.descriptor_set_count(), 0);
        assert_eq!(device.profiler().descriptor_set_count(), 0);
        assert_eq!(inspector.live_descriptor_sets(), 0);

        let events = inspector.events();
        let destroyed = events
            .iter()
            .position(|e| matches!(e, BackendEvent::DescriptorPoolDestroyed(_)))
            .unwrap();
        let created = events
            .iter()
            .position(|e| matches!(e, BackendEvent::DescriptorPoolCreated { max_sets: 16, .. }))
            .unwrap();
        assert!(destroyed < created);

        // Zero keeps the current capacity
        device.set_descriptor_set_capacity(0).unwrap();
        assert_eq!(device.descriptor_set_capacity(), 16);
        device.backend().destroy_descriptor_set_layout(layout);
    }

    #[test]
    fn cache_hits_reuse_sets() {
        let (device, _inspector) = headless_device();
        let layout = device.backend().create_descriptor_set_layout(&[], "layout").unwrap();

        let (first, created) = device.get_or_create_descriptor_set(42, layout, &[], "set").unwrap();
        assert!(created);
        let (second, created) = device.get_or_create_descriptor_set(42, layout, &[], "set").unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert!(device.has_descriptor_set_capacity());
        device.backend().destroy_descriptor_set_layout(layout);
    }

    #[test]
    #[should_panic(expected = "no more memory to allocate another descriptor set")]
    fn cache_never_exceeds_capacity() {
        let config = DeviceConfig {
            descriptor_set_capacity: 2,
            ..DeviceConfig::default()
        };
        let (device, _inspector) = headless_device_with(config, HeadlessBackend::new());
        let layout = device.backend().create_descriptor_set_layout(&[], "layout").unwrap();
        for hash in 0..3 {
            device.get_or_create_descriptor_set(hash, layout, &[], "set").unwrap();
        }
    }

    #[test]
    fn immediate_submission_blocks_until_done() {
        let (device, inspector) = headless_device();
        inspector.clear_events();

        let cmd = device.immediate_begin(QueueType::Copy).unwrap();
        assert_eq!(cmd.state(), CommandListState::Recording);
        assert_eq!(cmd.queue_type(), QueueType::Copy);
        cmd.submit().unwrap();

        let events = inspector.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, BackendEvent::QueueSubmit { queue_type: QueueType::Copy, .. })));
        assert!(events.iter().any(|e| matches!(e, BackendEvent::FenceWait(_))));
        assert_eq!(device.profiler().stats().immediate_submissions, 1);

        // The list is idle again and can be reused right away
        device.immediate_begin(QueueType::Copy).unwrap().submit().unwrap();
    }

    #[test]
    fn immediate_pool_is_reset_before_every_recording() {
        let (device, inspector) = headless_device();
        inspector.clear_events();

        device.immediate_begin(QueueType::Copy).unwrap().submit().unwrap();
        device.immediate_begin(QueueType::Copy).unwrap().submit().unwrap();

        let events = inspector.events();
        let submits: Vec<_> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, BackendEvent::QueueSubmit { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(submits.len(), 2);
        let resets_between = events[submits[0]..submits[1]]
            .iter()
            .filter(|e| matches!(e, BackendEvent::CommandPoolReset(_)))
            .count();
        assert_eq!(resets_between, 1);
    }

    #[test]
    fn abandoned_immediate_list_recovers() {
        let (device, inspector) = headless_device();
        drop(device.immediate_begin(QueueType::Graphics).unwrap());
        inspector.clear_events();
        device.immediate_begin(QueueType::Graphics).unwrap().submit().unwrap();

        let events = inspector.events();
        let reset = events
            .iter()
            .position(|e| matches!(e, BackendEvent::CommandPoolReset(_)))
            .expect("immediate pool was reset");
        let submit = events
            .iter()
            .position(|e| matches!(e, BackendEvent::QueueSubmit { .. }))
            .expect("immediate list was submitted");
        assert!(reset < submit);
    }

    #[test]
    fn resolution_limits() {
        let (device, _inspector) = headless_device();
        assert!(device.is_valid_resolution(1920, 1080));
        assert!(!device.is_valid_resolution(0, 1080));
        assert!(!device.is_valid_resolution(32768, 16));
    }
}
