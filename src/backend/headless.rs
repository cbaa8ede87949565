// Headless backend - in-memory stand-in for a GPU
//
// Host allocations back buffers so mapping and flushing work, submissions
// complete when something waits on them, and every call that matters for
// ordering is recorded as a `BackendEvent`. A `HeadlessInspector` shares the
// state so tests can inspect it after the backend moved into a device.

use super::{
    Backend, BufferDesc, DescriptorPoolSize, ImageBarrier, ImageViewDesc, SamplerDesc, SubmitInfo,
    TextureDesc,
};
use crate::rhi::definition::{
    ApiType, BindPoint, ImageLayout, PhysicalDeviceType, QueueFlags, QueueType,
};
use crate::rhi::descriptor::Descriptor;
use crate::rhi::handle::{
    AllocationHandle, BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorPoolHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, FenceHandle, ImageHandle, ImageViewHandle,
    PhysicalDeviceHandle, PipelineLayoutHandle, SamplerHandle, SemaphoreHandle, SwapchainHandle,
};
use crate::rhi::physical_device::{
    make_version, DeviceFeatures, DeviceLimits, PhysicalDevice, QueueFamilyIndices,
};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Calls recorded by the headless backend, in call order
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    QueueSubmit { queue_type: QueueType, cmd: CommandBufferHandle },
    QueuePresent { swapchain: SwapchainHandle, image_index: u32 },
    QueueWaitIdle(QueueType),
    DeviceWaitIdle,
    FenceWait(FenceHandle),
    FenceReset(FenceHandle),
    CommandPoolReset(CommandPoolHandle),
    DescriptorPoolCreated { pool: DescriptorPoolHandle, max_sets: u32 },
    DescriptorPoolDestroyed(DescriptorPoolHandle),
    DescriptorSetAllocated(DescriptorSetHandle),
    DescriptorSetBound(DescriptorSetHandle),
    AllocationFlushed { allocation: AllocationHandle, offset: u64, size: u64 },
    ImageBarrier { image: ImageHandle, new_layout: ImageLayout },
    BufferCopied { src: BufferHandle, dst: BufferHandle, size: u64 },
    AllocatorDestroyed,
}

/// A simulated adapter
#[derive(Debug, Clone)]
pub struct HeadlessAdapter {
    pub info: PhysicalDevice,
    pub queue_families: Vec<QueueFlags>,
    pub features: DeviceFeatures,
    pub limits: DeviceLimits,
}

impl HeadlessAdapter {
    /// Discrete adapter with a general family plus async compute and copy families
    pub fn discrete(name: &str, memory_mb: u64) -> Self {
        Self::new(name, PhysicalDeviceType::Discrete, memory_mb)
    }

    pub fn new(name: &str, device_type: PhysicalDeviceType, memory_mb: u64) -> Self {
        Self {
            info: PhysicalDevice::new(
                make_version(1, 3, 0),
                1,
                0,
                device_type,
                name,
                memory_mb * 1024 * 1024,
                PhysicalDeviceHandle::NULL,
            ),
            queue_families: vec![
                QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
                QueueFlags::COMPUTE | QueueFlags::TRANSFER,
                QueueFlags::TRANSFER,
            ],
            features: DeviceFeatures::all(),
            limits: DeviceLimits::default(),
        }
    }

    pub fn with_queue_families(mut self, families: Vec<QueueFlags>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn with_features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }
}

struct HostAllocation {
    data: Box<[u8]>,
    mappable: bool,
    mapped: bool,
}

#[derive(Default)]
struct FenceSim {
    pending: bool,
    signaled: bool,
}

#[derive(Clone, Copy)]
struct BufferCopy {
    src: BufferHandle,
    dst: BufferHandle,
    size: u64,
}

struct CommandBufferSim {
    pool: CommandPoolHandle,
    recording: bool,
    // Only a freshly allocated or pool-reset buffer may begin recording
    initial: bool,
    copies: Vec<BufferCopy>,
}

struct DescriptorPoolSim {
    max_sets: u32,
    allocated: u32,
}

#[derive(Default)]
struct HeadlessState {
    device_created: bool,
    stalled: bool,
    events: Vec<BackendEvent>,
    allocations: HashMap<AllocationHandle, HostAllocation>,
    buffers: HashMap<BufferHandle, AllocationHandle>,
    fences: HashMap<FenceHandle, FenceSim>,
    semaphores: HashSet<SemaphoreHandle>,
    command_pools: HashMap<CommandPoolHandle, QueueType>,
    command_buffers: HashMap<CommandBufferHandle, CommandBufferSim>,
    descriptor_pools: HashMap<DescriptorPoolHandle, DescriptorPoolSim>,
    descriptor_set_layouts: HashSet<DescriptorSetLayoutHandle>,
    descriptor_sets: HashMap<DescriptorSetHandle, DescriptorPoolHandle>,
    views: HashSet<ImageViewHandle>,
    samplers: HashSet<SamplerHandle>,
}

impl HeadlessState {
    fn execute_copy(&mut self, copy: BufferCopy) -> Result<()> {
        let src = *self.buffers.get(&copy.src).context("Unknown copy source")?;
        let dst = *self.buffers.get(&copy.dst).context("Unknown copy destination")?;
        let size = copy.size as usize;

        let data = self
            .allocations
            .get(&src)
            .and_then(|host| host.data.get(..size))
            .context("Copy reads past the end of the source")?
            .to_vec();
        self.allocations
            .get_mut(&dst)
            .and_then(|host| host.data.get_mut(..size))
            .context("Copy writes past the end of the destination")?
            .copy_from_slice(&data);

        self.events.push(BackendEvent::BufferCopied {
            src: copy.src,
            dst: copy.dst,
            size: copy.size,
        });
        Ok(())
    }

    fn complete_pending(&mut self) {
        if self.stalled {
            return;
        }
        for fence in self.fences.values_mut().filter(|f| f.pending) {
            fence.pending = false;
            fence.signaled = true;
        }
    }
}

pub struct HeadlessBackend {
    adapters: Vec<HeadlessAdapter>,
    state: Arc<Mutex<HeadlessState>>,
    next_handle: AtomicU64,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::with_adapters(vec![HeadlessAdapter::discrete("Headless GPU", 8192)])
    }

    pub fn with_adapters(adapters: Vec<HeadlessAdapter>) -> Self {
        let adapters = adapters
            .into_iter()
            .enumerate()
            .map(|(i, mut adapter)| {
                let info = &adapter.info;
                adapter.info = PhysicalDevice::new(
                    info.api_version(),
                    info.driver_version(),
                    info.vendor_id(),
                    info.device_type(),
                    info.name(),
                    info.memory(),
                    PhysicalDeviceHandle::from_raw(i as u64 + 1),
                );
                adapter
            })
            .collect();

        Self {
            adapters,
            state: Arc::new(Mutex::new(HeadlessState::default())),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn inspector(&self) -> HeadlessInspector {
        HeadlessInspector {
            state: Arc::clone(&self.state),
        }
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn adapter(&self, physical_device: &PhysicalDevice) -> Result<&HeadlessAdapter> {
        self.adapters
            .iter()
            .find(|a| a.info.handle() == physical_device.handle())
            .with_context(|| format!("Unknown adapter {}", physical_device.name()))
    }

    fn host_allocation(&self, size: u64, mappable: bool) -> AllocationHandle {
        let allocation = AllocationHandle::from_raw(self.next_raw());
        self.state.lock().allocations.insert(
            allocation,
            HostAllocation {
                data: vec![0u8; size as usize].into_boxed_slice(),
                mappable,
                mapped: false,
            },
        );
        allocation
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for HeadlessBackend {
    fn api_type(&self) -> ApiType {
        ApiType::Headless
    }

    fn api_version(&self) -> u32 {
        make_version(1, 3, 0)
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        Ok(self.adapters.iter().map(|a| a.info.clone()).collect())
    }

    fn queue_family_flags(&self, physical_device: &PhysicalDevice) -> Result<Vec<QueueFlags>> {
        Ok(self.adapter(physical_device)?.queue_families.clone())
    }

    fn supported_features(&self, physical_device: &PhysicalDevice) -> Result<DeviceFeatures> {
        Ok(self.adapter(physical_device)?.features)
    }

    fn device_limits(&self, physical_device: &PhysicalDevice) -> Result<DeviceLimits> {
        Ok(self.adapter(physical_device)?.limits)
    }

    fn create_device(
        &mut self,
        physical_device: &PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        _features: &DeviceFeatures,
    ) -> Result<()> {
        let families = self.adapter(physical_device)?.queue_families.len() as u32;
        for queue_type in QueueType::ALL {
            if queue_families.get(queue_type) >= families {
                bail!("Invalid {} queue family index", queue_type.as_str());
            }
        }
        self.state.lock().device_created = true;
        Ok(())
    }

    fn queue_submit(&self, submit: &SubmitInfo) -> Result<()> {
        let mut state = self.state.lock();
        let copies = match state.command_buffers.get_mut(&submit.cmd) {
            Some(cmd) if cmd.recording => bail!("Command buffer is still recording"),
            Some(cmd) => std::mem::take(&mut cmd.copies),
            None => bail!("Unknown command buffer"),
        };
        for copy in copies {
            state.execute_copy(copy)?;
        }
        if let Some(fence) = submit.signal_fence {
            let fence = state.fences.get_mut(&fence).context("Unknown fence")?;
            fence.pending = true;
        }
        state.events.push(BackendEvent::QueueSubmit {
            queue_type: submit.queue_type,
            cmd: submit.cmd,
        });
        Ok(())
    }

    fn queue_present(&self, swapchain: SwapchainHandle, image_index: u32, _wait_semaphores: &[SemaphoreHandle]) -> Result<()> {
        self.state
            .lock()
            .events
            .push(BackendEvent::QueuePresent { swapchain, image_index });
        Ok(())
    }

    fn queue_wait_idle(&self, queue_type: QueueType) -> Result<()> {
        let mut state = self.state.lock();
        state.complete_pending();
        state.events.push(BackendEvent::QueueWaitIdle(queue_type));
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.complete_pending();
        state.events.push(BackendEvent::DeviceWaitIdle);
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<(BufferHandle, AllocationHandle)> {
        if desc.size == 0 {
            bail!("Buffer \"{}\" has a size of zero", desc.name);
        }
        let buffer = BufferHandle::from_raw(self.next_raw());
        let allocation = self.host_allocation(desc.size, desc.is_mappable());
        self.state.lock().buffers.insert(buffer, allocation);
        Ok((buffer, allocation))
    }

    fn destroy_buffer(&self, buffer: BufferHandle, allocation: AllocationHandle) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.allocations.remove(&allocation);
    }

    fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<(ImageHandle, AllocationHandle)> {
        if desc.width == 0 || desc.height == 0 {
            bail!("Texture \"{}\" has a zero dimension", desc.name);
        }
        let image = ImageHandle::from_raw(self.next_raw());
        let allocation = self.host_allocation(0, false);
        Ok((image, allocation))
    }

    fn destroy_texture(&self, _image: ImageHandle, allocation: AllocationHandle) {
        self.state.lock().allocations.remove(&allocation);
    }

    fn mapped_ptr(&self, allocation: AllocationHandle) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        let host = state.allocations.get_mut(&allocation)?;
        if host.mappable {
            NonNull::new(host.data.as_mut_ptr())
        } else {
            None
        }
    }

    fn map_memory(&self, allocation: AllocationHandle) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        let host = state
            .allocations
            .get_mut(&allocation)
            .context("Unknown allocation")?;
        if !host.mappable {
            bail!("Allocation is not host visible");
        }
        host.mapped = true;
        NonNull::new(host.data.as_mut_ptr()).context("Allocation has no backing memory")
    }

    fn unmap_memory(&self, allocation: AllocationHandle) {
        if let Some(host) = self.state.lock().allocations.get_mut(&allocation) {
            host.mapped = false;
        }
    }

    fn flush_allocation(&self, allocation: AllocationHandle, offset: u64, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        let host = state.allocations.get(&allocation).context("Unknown allocation")?;
        if offset + size > host.data.len() as u64 {
            bail!("Flush range {}..{} exceeds the allocation", offset, offset + size);
        }
        state
            .events
            .push(BackendEvent::AllocationFlushed { allocation, offset, size });
        Ok(())
    }

    fn destroy_allocator(&self) {
        self.state.lock().events.push(BackendEvent::AllocatorDestroyed);
    }

    fn create_image_view(&self, _desc: &ImageViewDesc<'_>) -> Result<ImageViewHandle> {
        let view = ImageViewHandle::from_raw(self.next_raw());
        self.state.lock().views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.state.lock().views.remove(&view);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<SamplerHandle> {
        let sampler = SamplerHandle::from_raw(self.next_raw());
        self.state.lock().samplers.insert(sampler);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.state.lock().samplers.remove(&sampler);
    }

    fn create_descriptor_pool(&self, max_sets: u32, _sizes: &[DescriptorPoolSize]) -> Result<DescriptorPoolHandle> {
        let pool = DescriptorPoolHandle::from_raw(self.next_raw());
        let mut state = self.state.lock();
        state
            .descriptor_pools
            .insert(pool, DescriptorPoolSim { max_sets, allocated: 0 });
        state
            .events
            .push(BackendEvent::DescriptorPoolCreated { pool, max_sets });
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state.lock();
        state.descriptor_pools.remove(&pool);
        state.descriptor_sets.retain(|_, owner| *owner != pool);
        state.events.push(BackendEvent::DescriptorPoolDestroyed(pool));
    }

    fn create_descriptor_set_layout(&self, _descriptors: &[Descriptor], _name: &str) -> Result<DescriptorSetLayoutHandle> {
        let layout = DescriptorSetLayoutHandle::from_raw(self.next_raw());
        self.state.lock().descriptor_set_layouts.insert(layout);
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        self.state.lock().descriptor_set_layouts.remove(&layout);
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
        _name: &str,
    ) -> Result<DescriptorSetHandle> {
        let set = DescriptorSetHandle::from_raw(self.next_raw());
        let mut state = self.state.lock();
        if !state.descriptor_set_layouts.contains(&layout) {
            bail!("Unknown descriptor set layout");
        }
        let sim = state
            .descriptor_pools
            .get_mut(&pool)
            .context("Unknown descriptor pool")?;
        if sim.allocated >= sim.max_sets {
            bail!("Descriptor pool is out of memory");
        }
        sim.allocated += 1;
        state.descriptor_sets.insert(set, pool);
        state.events.push(BackendEvent::DescriptorSetAllocated(set));
        Ok(set)
    }

    fn update_descriptor_set(&self, set: DescriptorSetHandle, _descriptors: &[Descriptor]) -> Result<()> {
        if !self.state.lock().descriptor_sets.contains_key(&set) {
            bail!("Unknown descriptor set");
        }
        Ok(())
    }

    fn create_command_pool(&self, queue_type: QueueType, _name: &str) -> Result<CommandPoolHandle> {
        let pool = CommandPoolHandle::from_raw(self.next_raw());
        self.state.lock().command_pools.insert(pool, queue_type);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state.lock();
        state.command_pools.remove(&pool);
        state.command_buffers.retain(|_, cmd| cmd.pool != pool);
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool) {
            bail!("Unknown command pool");
        }
        for cmd in state.command_buffers.values_mut().filter(|c| c.pool == pool) {
            cmd.recording = false;
            cmd.initial = true;
            cmd.copies.clear();
        }
        state.events.push(BackendEvent::CommandPoolReset(pool));
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: CommandPoolHandle, _name: &str) -> Result<CommandBufferHandle> {
        let cmd = CommandBufferHandle::from_raw(self.next_raw());
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool) {
            bail!("Unknown command pool");
        }
        state
            .command_buffers
            .insert(
                cmd,
                CommandBufferSim {
                    pool,
                    recording: false,
                    initial: true,
                    copies: Vec::new(),
                },
            );
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        let sim = state.command_buffers.get_mut(&cmd).context("Unknown command buffer")?;
        if sim.recording {
            bail!("Command buffer is already recording");
        }
        if !sim.initial {
            bail!("Command buffer was recorded before, its pool must be reset first");
        }
        sim.recording = true;
        sim.initial = false;
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        let sim = state.command_buffers.get_mut(&cmd).context("Unknown command buffer")?;
        if !sim.recording {
            bail!("Command buffer is not recording");
        }
        sim.recording = false;
        Ok(())
    }

    fn cmd_image_barrier(&self, _cmd: CommandBufferHandle, barrier: &ImageBarrier) {
        self.state.lock().events.push(BackendEvent::ImageBarrier {
            image: barrier.image,
            new_layout: barrier.new_layout,
        });
    }

    fn cmd_copy_buffer(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, size: u64) {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd) {
            Some(sim) if sim.recording => sim.copies.push(BufferCopy { src, dst, size }),
            _ => log::error!("Buffer copy recorded outside of a recording command buffer"),
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        _cmd: CommandBufferHandle,
        _bind_point: BindPoint,
        _pipeline_layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
        _dynamic_offsets: &[u32],
    ) {
        self.state.lock().events.push(BackendEvent::DescriptorSetBound(set));
    }

    fn create_fence(&self, _name: Option<&str>) -> Result<FenceHandle> {
        let fence = FenceHandle::from_raw(self.next_raw());
        self.state.lock().fences.insert(fence, FenceSim::default());
        Ok(fence)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().fences.remove(&fence);
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.fences.get(&fence).context("Unknown fence")?.signaled)
    }

    fn wait_fence(&self, fence: FenceHandle, _timeout_ns: u64) -> Result<bool> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::FenceWait(fence));
        let stalled = state.stalled;
        let sim = state.fences.get_mut(&fence).context("Unknown fence")?;
        if sim.pending && !stalled {
            sim.pending = false;
            sim.signaled = true;
        }
        Ok(sim.signaled)
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        let mut state = self.state.lock();
        let sim = state.fences.get_mut(&fence).context("Unknown fence")?;
        sim.signaled = false;
        sim.pending = false;
        state.events.push(BackendEvent::FenceReset(fence));
        Ok(())
    }

    fn create_semaphore(&self, _name: Option<&str>) -> Result<SemaphoreHandle> {
        let semaphore = SemaphoreHandle::from_raw(self.next_raw());
        self.state.lock().semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().semaphores.remove(&semaphore);
    }
}

/// Test-side view into a `HeadlessBackend`
#[derive(Clone)]
pub struct HeadlessInspector {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessInspector {
    pub fn events(&self) -> Vec<BackendEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// While stalled, submitted work never completes and fence waits time out
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Signal every fence with submitted work
    pub fn complete_all(&self) {
        self.state.lock().complete_pending();
    }

    pub fn device_created(&self) -> bool {
        self.state.lock().device_created
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.state.lock().descriptor_sets.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state.lock().command_pools.len()
    }

    /// Copy of an allocation's contents
    pub fn allocation_contents(&self, allocation: AllocationHandle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .allocations
            .get(&allocation)
            .map(|host| host.data.to_vec())
    }

    pub fn is_mapped(&self, allocation: AllocationHandle) -> bool {
        self.state
            .lock()
            .allocations
            .get(&allocation)
            .map_or(false, |host| host.mapped)
    }
}
