// Device context - explicitly owned state shared by every RHI object
//
// Holds the backend and the per-queue submission locks. Objects keep an
// `Arc<DeviceContext>` so they can release their backend handles on drop.

use super::definition::{PipelineStage, QueueType, SyncState};
use super::handle::{CommandBufferHandle, ResourceId, SwapchainHandle};
use super::physical_device::QueueFamilyIndices;
use super::sync::{Fence, Semaphore};
use crate::backend::{Backend, SubmitInfo};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct DeviceContext {
    backend: Box<dyn Backend>,
    queue_families: QueueFamilyIndices,
    queue_locks: [Mutex<()>; 3],
    // Queue types sharing a family share a native queue, so they share a lock
    queue_lock_index: [usize; 3],
    next_resource_id: AtomicU64,
    gpu_markers: bool,
}

impl DeviceContext {
    pub fn new(backend: Box<dyn Backend>, queue_families: QueueFamilyIndices, gpu_markers: bool) -> Self {
        let mut queue_lock_index = [0; 3];
        for queue_type in QueueType::ALL {
            let family = queue_families.get(queue_type);
            queue_lock_index[queue_type.index()] = QueueType::ALL
                .iter()
                .position(|other| queue_families.get(*other) == family)
                .unwrap_or(queue_type.index());
        }

        Self {
            backend,
            queue_families,
            queue_locks: Default::default(),
            queue_lock_index,
            next_resource_id: AtomicU64::new(1),
            gpu_markers,
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    pub fn gpu_markers(&self) -> bool {
        self.gpu_markers
    }

    /// Identity for a new bindable object, never reused
    pub fn next_resource_id(&self) -> ResourceId {
        ResourceId::from_raw(self.next_resource_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Log a failed backend call once, at a single place
    pub fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            log::error!("{:#}", e);
        }
        result
    }

    fn queue_lock(&self, queue_type: QueueType) -> &Mutex<()> {
        &self.queue_locks[self.queue_lock_index[queue_type.index()]]
    }

    /// Submit a recorded command buffer
    ///
    /// # Panics
    /// On synchronization-order bugs: waiting on a semaphore nobody will
    /// signal, or signaling a semaphore/fence that is already in flight.
    pub fn queue_submit(
        &self,
        queue_type: QueueType,
        wait_stage: PipelineStage,
        cmd: CommandBufferHandle,
        wait_semaphore: Option<&Semaphore>,
        signal_semaphore: Option<&Semaphore>,
        signal_fence: Option<&Fence>,
    ) -> Result<()> {
        assert!(!cmd.is_null(), "Invalid command buffer");

        // Sync states are checked and updated under the same lock
        let _lock = self.queue_lock(queue_type).lock();

        if let Some(semaphore) = wait_semaphore {
            assert!(
                semaphore.cpu_state() == SyncState::Submitted,
                "The wait semaphore hasn't been signaled"
            );
        }
        if let Some(semaphore) = signal_semaphore {
            assert!(
                semaphore.cpu_state() != SyncState::Submitted,
                "The signal semaphore is already signaled"
            );
        }
        if let Some(fence) = signal_fence {
            assert!(
                fence.cpu_state() != SyncState::Submitted,
                "The signal fence is already signaled"
            );
        }

        let submit = SubmitInfo {
            queue_type,
            wait_stage,
            cmd,
            wait_semaphore: wait_semaphore.map(Semaphore::handle),
            signal_semaphore: signal_semaphore.map(Semaphore::handle),
            signal_fence: signal_fence.map(Fence::handle),
        };
        self.check(self.backend.queue_submit(&submit))?;

        if let Some(semaphore) = wait_semaphore {
            semaphore.set_cpu_state(SyncState::Idle);
        }
        if let Some(semaphore) = signal_semaphore {
            semaphore.set_cpu_state(SyncState::Submitted);
        }
        if let Some(fence) = signal_fence {
            fence.set_cpu_state(SyncState::Submitted);
        }

        Ok(())
    }

    /// Present a swapchain image, consuming the wait semaphores
    pub fn queue_present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait_semaphores: &[&Semaphore],
    ) -> Result<()> {
        let _lock = self.queue_lock(QueueType::Graphics).lock();

        for semaphore in wait_semaphores {
            assert!(
                semaphore.cpu_state() == SyncState::Submitted,
                "The wait semaphore hasn't been signaled"
            );
        }

        let handles: Vec<_> = wait_semaphores.iter().map(|s| s.handle()).collect();
        self.check(self.backend.queue_present(swapchain, image_index, &handles))?;

        for semaphore in wait_semaphores {
            semaphore.set_cpu_state(SyncState::Idle);
        }

        Ok(())
    }

    pub fn queue_wait(&self, queue_type: QueueType) -> Result<()> {
        let _lock = self.queue_lock(queue_type).lock();
        self.check(self.backend.queue_wait_idle(queue_type))
    }

    pub fn queue_wait_all(&self) -> Result<()> {
        for queue_type in QueueType::ALL {
            self.queue_wait(queue_type)?;
        }
        Ok(())
    }
}
