// Synchronization primitives
//
// Fences for GPU-CPU sync, binary semaphores for GPU-GPU sync. Fences are
// created unsignaled; the RHI tracks their CPU-side state.

use super::device::VulkanDevice;
use crate::rhi::handle::{FenceHandle, SemaphoreHandle};
use anyhow::{Context, Result};
use ash::vk::{self, Handle};

fn fence(handle: FenceHandle) -> vk::Fence {
    vk::Fence::from_raw(handle.as_raw())
}

impl VulkanDevice {
    pub(super) fn create_fence_vk(&self, name: Option<&str>) -> Result<FenceHandle> {
        let logical = self.logical()?;
        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { logical.device.create_fence(&fence_info, None) }.context("Failed to create fence")?;
        if let Some(name) = name {
            self.set_object_name(logical, fence, name);
        }
        Ok(FenceHandle::from_raw(fence.as_raw()))
    }

    pub(super) fn destroy_fence_vk(&self, handle: FenceHandle) {
        if let Some(logical) = &self.logical {
            unsafe { logical.device.destroy_fence(fence(handle), None) };
        }
    }

    pub(super) fn fence_status_vk(&self, handle: FenceHandle) -> Result<bool> {
        let logical = self.logical()?;
        unsafe { logical.device.get_fence_status(fence(handle)) }.context("Failed to query fence status")
    }

    pub(super) fn wait_fence_vk(&self, handle: FenceHandle, timeout_ns: u64) -> Result<bool> {
        let logical = self.logical()?;
        match unsafe { logical.device.wait_for_fences(&[fence(handle)], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e).context("Failed to wait for fence"),
        }
    }

    pub(super) fn reset_fence_vk(&self, handle: FenceHandle) -> Result<()> {
        let logical = self.logical()?;
        unsafe { logical.device.reset_fences(&[fence(handle)]) }.context("Failed to reset fence")
    }

    pub(super) fn create_semaphore_vk(&self, name: Option<&str>) -> Result<SemaphoreHandle> {
        let logical = self.logical()?;
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { logical.device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create semaphore")?;
        if let Some(name) = name {
            self.set_object_name(logical, semaphore, name);
        }
        Ok(SemaphoreHandle::from_raw(semaphore.as_raw()))
    }

    pub(super) fn destroy_semaphore_vk(&self, handle: SemaphoreHandle) {
        if let Some(logical) = &self.logical {
            unsafe {
                logical
                    .device
                    .destroy_semaphore(vk::Semaphore::from_raw(handle.as_raw()), None)
            };
        }
    }
}
