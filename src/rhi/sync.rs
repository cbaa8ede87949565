// Fences and semaphores
//
// Both mirror their GPU state on the CPU (`SyncState`) so submission can
// assert correct ordering before anything reaches the driver.

use super::context::DeviceContext;
use super::definition::{SyncState, FENCE_TIMEOUT_DEFAULT_NS};
use super::handle::{FenceHandle, SemaphoreHandle};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// CPU-waitable GPU completion signal
pub struct Fence {
    context: Arc<DeviceContext>,
    handle: FenceHandle,
    name: String,
    cpu_state: Mutex<SyncState>,
}

impl Fence {
    pub fn new(context: Arc<DeviceContext>, name: Option<&str>) -> Result<Self> {
        let handle = context.check(context.backend().create_fence(name))?;
        Ok(Self {
            context,
            handle,
            name: name.unwrap_or("fence").to_string(),
            cpu_state: Mutex::new(SyncState::Idle),
        })
    }

    pub fn handle(&self) -> FenceHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu_state(&self) -> SyncState {
        *self.cpu_state.lock()
    }

    pub(crate) fn set_cpu_state(&self, state: SyncState) {
        *self.cpu_state.lock() = state;
    }

    pub fn is_signaled(&self) -> Result<bool> {
        self.context.check(self.context.backend().fence_status(self.handle))
    }

    /// Block until signaled, `Ok(false)` if `timeout_ns` elapsed first
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        if self.is_signaled()? {
            return Ok(true);
        }
        self.context
            .check(self.context.backend().wait_fence(self.handle, timeout_ns))
    }

    pub fn wait_default(&self) -> Result<bool> {
        self.wait(FENCE_TIMEOUT_DEFAULT_NS)
    }

    pub fn reset(&self) -> Result<()> {
        self.context.check(self.context.backend().reset_fence(self.handle))?;
        self.set_cpu_state(SyncState::Idle);
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // The GPU may still reference the fence
        if let Err(e) = self.context.queue_wait_all() {
            log::error!("Failed to wait for the queues before destroying \"{}\": {:#}", self.name, e);
        }
        self.context.backend().destroy_fence(self.handle);
    }
}

/// GPU-to-GPU ordering signal between submissions
pub struct Semaphore {
    context: Arc<DeviceContext>,
    handle: SemaphoreHandle,
    name: String,
    cpu_state: Mutex<SyncState>,
}

impl Semaphore {
    pub fn new(context: Arc<DeviceContext>, name: Option<&str>) -> Result<Self> {
        let handle = context.check(context.backend().create_semaphore(name))?;
        Ok(Self {
            context,
            handle,
            name: name.unwrap_or("semaphore").to_string(),
            cpu_state: Mutex::new(SyncState::Idle),
        })
    }

    pub fn handle(&self) -> SemaphoreHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu_state(&self) -> SyncState {
        *self.cpu_state.lock()
    }

    pub(crate) fn set_cpu_state(&self, state: SyncState) {
        *self.cpu_state.lock() = state;
    }

    /// Return to the idle state
    ///
    /// A signaled binary semaphore can't be unsignaled from the host, so a
    /// submitted one is replaced by a fresh handle.
    pub fn reset(&mut self) -> Result<()> {
        if self.cpu_state() == SyncState::Submitted {
            let backend = self.context.backend();
            let handle = self.context.check(backend.create_semaphore(Some(&self.name)))?;
            backend.destroy_semaphore(self.handle);
            self.handle = handle;
        }
        self.set_cpu_state(SyncState::Idle);
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Err(e) = self.context.queue_wait_all() {
            log::error!("Failed to wait for the queues before destroying \"{}\": {:#}", self.name, e);
        }
        self.context.backend().destroy_semaphore(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, HeadlessBackend, HeadlessInspector};
    use crate::rhi::definition::QueueType;
    use crate::rhi::physical_device::QueueFamilyIndices;

    fn context() -> (Arc<DeviceContext>, HeadlessInspector) {
        let backend = HeadlessBackend::new();
        let inspector = backend.inspector();
        let families = QueueFamilyIndices { graphics: 0, compute: 1, copy: 2 };
        (Arc::new(DeviceContext::new(Box::new(backend), families, false)), inspector)
    }

    fn submit(ctx: &DeviceContext, signal: Option<&Semaphore>, fence: Option<&Fence>) {
        let pool = ctx.backend().create_command_pool(QueueType::Graphics, "pool").unwrap();
        let cmd = ctx.backend().allocate_command_buffer(pool, "cmd").unwrap();
        ctx.queue_submit(QueueType::Graphics, QueueType::Graphics.wait_stage(), cmd, None, signal, fence)
            .unwrap();
    }

    #[test]
    fn fence_follows_submission() {
        let (ctx, _inspector) = context();
        let fence = Fence::new(ctx.clone(), Some("frame")).unwrap();
        assert_eq!(fence.cpu_state(), SyncState::Idle);

        submit(&ctx, None, Some(&fence));
        assert_eq!(fence.cpu_state(), SyncState::Submitted);
        assert!(!fence.is_signaled().unwrap());

        assert!(fence.wait_default().unwrap());
        fence.reset().unwrap();
        assert_eq!(fence.cpu_state(), SyncState::Idle);
        assert!(!fence.is_signaled().unwrap());
    }

    #[test]
    fn fence_wait_times_out_when_gpu_stalls() {
        let (ctx, inspector) = context();
        let fence = Fence::new(ctx.clone(), None).unwrap();
        submit(&ctx, None, Some(&fence));
        inspector.set_stalled(true);
        assert!(!fence.wait(10).unwrap());
        inspector.set_stalled(false);
    }

    #[test]
    #[should_panic(expected = "signal semaphore is already signaled")]
    fn double_signal_is_fatal() {
        let (ctx, _inspector) = context();
        let semaphore = Semaphore::new(ctx.clone(), None).unwrap();
        submit(&ctx, Some(&semaphore), None);
        assert_eq!(semaphore.cpu_state(), SyncState::Submitted);
        submit(&ctx, Some(&semaphore), None);
    }

    #[test]
    #[should_panic(expected = "signal fence is already signaled")]
    fn fence_in_flight_cannot_be_signaled_again() {
        let (ctx, _inspector) = context();
        let fence = Fence::new(ctx.clone(), None).unwrap();
        submit(&ctx, None, Some(&fence));
        submit(&ctx, None, Some(&fence));
    }

    #[test]
    fn semaphore_reset_replaces_signaled_handle() {
        let (ctx, inspector) = context();
        let mut semaphore = Semaphore::new(ctx.clone(), Some("present")).unwrap();
        let original = semaphore.handle();

        semaphore.reset().unwrap();
        assert_eq!(semaphore.handle(), original);

        submit(&ctx, Some(&semaphore), None);
        semaphore.reset().unwrap();
        assert_ne!(semaphore.handle(), original);
        assert_eq!(semaphore.cpu_state(), SyncState::Idle);
        assert_eq!(inspector.live_semaphores(), 1);
    }

    #[test]
    fn drop_waits_for_queues() {
        let (ctx, inspector) = context();
        let fence = Fence::new(ctx.clone(), None).unwrap();
        inspector.clear_events();
        drop(fence);
        assert!(inspector.events().contains(&BackendEvent::QueueWaitIdle(QueueType::Graphics)));
        assert_eq!(inspector.live_fences(), 0);
    }
}
