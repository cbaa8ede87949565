// Command recording and queue operations
//
// Queue access is serialized by the RHI's per-queue locks, nothing here
// locks on its own.

use super::device::VulkanDevice;
use super::vulkan::{to_vk_image_aspect, to_vk_image_layout, to_vk_pipeline_stage};
use super::{ImageBarrier, SubmitInfo};
use crate::rhi::definition::{BindPoint, ImageLayout, QueueType};
use crate::rhi::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorSetHandle, PipelineLayoutHandle, SemaphoreHandle,
    SwapchainHandle,
};
use anyhow::{Context, Result};
use ash::vk::{self, Handle};

fn command_buffer(handle: CommandBufferHandle) -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(handle.as_raw())
}

/// Access and stage a layout implies, for either side of a barrier
fn layout_access(layout: ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        ImageLayout::Undefined | ImageLayout::Preinitialized => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        ImageLayout::General => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ImageLayout::ColorAttachmentOptimal => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::DepthAttachmentOptimal | ImageLayout::DepthStencilAttachmentOptimal => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        ImageLayout::DepthStencilReadOnlyOptimal => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ImageLayout::ShaderReadOnlyOptimal => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        ImageLayout::TransferSrcOptimal => (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER),
        ImageLayout::TransferDstOptimal => (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
        ImageLayout::PresentSrc => (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE),
    }
}

/// Layout scope clipped to the stages the queue's family can run
///
/// Transfer and compute families reject graphics stages in a barrier, a scope
/// left with no stage falls back to `fallback` with no access.
fn barrier_scope(
    layout: ImageLayout,
    queue_type: QueueType,
    fallback: vk::PipelineStageFlags,
) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    let (access, stage) = layout_access(layout);
    let supported = match queue_type {
        QueueType::Graphics => return (access, stage),
        QueueType::Compute => {
            vk::PipelineStageFlags::TOP_OF_PIPE
                | vk::PipelineStageFlags::BOTTOM_OF_PIPE
                | vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::COMPUTE_SHADER
        }
        QueueType::Copy => {
            vk::PipelineStageFlags::TOP_OF_PIPE
                | vk::PipelineStageFlags::BOTTOM_OF_PIPE
                | vk::PipelineStageFlags::TRANSFER
        }
    };

    let narrowed = stage & supported;
    if narrowed.is_empty() {
        (vk::AccessFlags::empty(), fallback)
    } else {
        (access, narrowed)
    }
}

impl VulkanDevice {
    // =========================================================================
    // QUEUES
    // =========================================================================

    pub(super) fn queue_submit_vk(&self, submit: &SubmitInfo) -> Result<()> {
        let logical = self.logical()?;

        let wait_semaphores: Vec<_> = submit
            .wait_semaphore
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.as_raw()))
            .collect();
        let wait_stages: Vec<_> = wait_semaphores
            .iter()
            .map(|_| to_vk_pipeline_stage(submit.wait_stage))
            .collect();
        let signal_semaphores: Vec<_> = submit
            .signal_semaphore
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.as_raw()))
            .collect();
        let command_buffers = [command_buffer(submit.cmd)];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let fence = submit
            .signal_fence
            .map_or(vk::Fence::null(), |f| vk::Fence::from_raw(f.as_raw()));

        unsafe {
            logical
                .device
                .queue_submit(logical.queue(submit.queue_type), &[submit_info.build()], fence)
        }
        .with_context(|| format!("Failed to submit to the {} queue", submit.queue_type.as_str()))
    }

    pub(super) fn queue_present_vk(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait_semaphores: &[SemaphoreHandle],
    ) -> Result<()> {
        let logical = self.logical()?;
        let loader = logical
            .swapchain_loader
            .as_ref()
            .context("Presenting requires the swapchain extension")?;

        let semaphores: Vec<_> = wait_semaphores
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.as_raw()))
            .collect();
        let swapchains = [vk::SwapchainKHR::from_raw(swapchain.as_raw())];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(logical.queue(QueueType::Graphics), &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::warn!("Swapchain is suboptimal, it should be recreated");
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain is out of date, the frame was not presented");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to present"),
        }
    }

    pub(super) fn queue_wait_idle_vk(&self, queue_type: QueueType) -> Result<()> {
        let logical = self.logical()?;
        unsafe { logical.device.queue_wait_idle(logical.queue(queue_type)) }
            .with_context(|| format!("Failed to wait for the {} queue", queue_type.as_str()))
    }

    // =========================================================================
    // COMMAND POOLS AND BUFFERS
    // =========================================================================

    pub(super) fn create_command_pool_vk(&self, queue_type: QueueType, name: &str) -> Result<CommandPoolHandle> {
        let logical = self.logical()?;
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(logical.families.get(queue_type));

        let pool = unsafe { logical.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        self.set_object_name(logical, pool, name);
        Ok(CommandPoolHandle::from_raw(pool.as_raw()))
    }

    pub(super) fn destroy_command_pool_vk(&self, pool: CommandPoolHandle) {
        if let Some(logical) = &self.logical {
            unsafe {
                logical
                    .device
                    .destroy_command_pool(vk::CommandPool::from_raw(pool.as_raw()), None)
            };
        }
    }

    pub(super) fn reset_command_pool_vk(&self, pool: CommandPoolHandle) -> Result<()> {
        let logical = self.logical()?;
        unsafe {
            logical.device.reset_command_pool(
                vk::CommandPool::from_raw(pool.as_raw()),
                vk::CommandPoolResetFlags::empty(),
            )
        }
        .context("Failed to reset command pool")
    }

    pub(super) fn allocate_command_buffer_vk(&self, pool: CommandPoolHandle, name: &str) -> Result<CommandBufferHandle> {
        let logical = self.logical()?;
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(vk::CommandPool::from_raw(pool.as_raw()))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { logical.device.allocate_command_buffers(&allocate_info) }
            .context("Failed to allocate command buffer")?;
        let buffer = buffers
            .into_iter()
            .next()
            .context("No command buffer was allocated")?;
        self.set_object_name(logical, buffer, name);
        Ok(CommandBufferHandle::from_raw(buffer.as_raw()))
    }

    pub(super) fn begin_command_buffer_vk(&self, cmd: CommandBufferHandle) -> Result<()> {
        let logical = self.logical()?;
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { logical.device.begin_command_buffer(command_buffer(cmd), &begin_info) }
            .context("Failed to begin command buffer")
    }

    pub(super) fn end_command_buffer_vk(&self, cmd: CommandBufferHandle) -> Result<()> {
        let logical = self.logical()?;
        unsafe { logical.device.end_command_buffer(command_buffer(cmd)) }.context("Failed to end command buffer")
    }

    // =========================================================================
    // RECORDING
    // =========================================================================

    pub(super) fn cmd_image_barrier_vk(&self, cmd: CommandBufferHandle, barrier: &ImageBarrier) {
        let Some(logical) = &self.logical else {
            return;
        };

        let (src_access, src_stage) =
            barrier_scope(barrier.old_layout, barrier.queue_type, vk::PipelineStageFlags::TOP_OF_PIPE);
        let (dst_access, dst_stage) =
            barrier_scope(barrier.new_layout, barrier.queue_type, vk::PipelineStageFlags::BOTTOM_OF_PIPE);

        let image_barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(to_vk_image_layout(barrier.old_layout))
            .new_layout(to_vk_image_layout(barrier.new_layout))
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(vk::Image::from_raw(barrier.image.as_raw()))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: to_vk_image_aspect(barrier.format, true),
                base_mip_level: barrier.base_mip,
                level_count: barrier.mip_count,
                base_array_layer: 0,
                layer_count: barrier.layer_count,
            })
            .build();

        unsafe {
            logical.device.cmd_pipeline_barrier(
                command_buffer(cmd),
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            )
        };
    }

    pub(super) fn cmd_copy_buffer_vk(&self, cmd: CommandBufferHandle, src: BufferHandle, dst: BufferHandle, size: u64) {
        let Some(logical) = &self.logical else {
            return;
        };

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            logical.device.cmd_copy_buffer(
                command_buffer(cmd),
                vk::Buffer::from_raw(src.as_raw()),
                vk::Buffer::from_raw(dst.as_raw()),
                &[region],
            )
        };
    }

    pub(super) fn cmd_bind_descriptor_set_vk(
        &self,
        cmd: CommandBufferHandle,
        bind_point: BindPoint,
        pipeline_layout: PipelineLayoutHandle,
        set: DescriptorSetHandle,
        dynamic_offsets: &[u32],
    ) {
        let Some(logical) = &self.logical else {
            return;
        };

        let bind_point = match bind_point {
            BindPoint::Graphics => vk::PipelineBindPoint::GRAPHICS,
            BindPoint::Compute => vk::PipelineBindPoint::COMPUTE,
        };
        unsafe {
            logical.device.cmd_bind_descriptor_sets(
                command_buffer(cmd),
                bind_point,
                vk::PipelineLayout::from_raw(pipeline_layout.as_raw()),
                0,
                &[vk::DescriptorSet::from_raw(set.as_raw())],
                dynamic_offsets,
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphics_barriers_keep_the_full_scope() {
        let scope = barrier_scope(
            ImageLayout::ShaderReadOnlyOptimal,
            QueueType::Graphics,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        );
        assert_eq!(scope, layout_access(ImageLayout::ShaderReadOnlyOptimal));
    }

    #[test]
    fn copy_barriers_drop_shader_stages() {
        let (access, stage) = barrier_scope(
            ImageLayout::ShaderReadOnlyOptimal,
            QueueType::Copy,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        );
        assert_eq!(stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert!(access.is_empty());

        let (access, stage) =
            barrier_scope(ImageLayout::TransferDstOptimal, QueueType::Copy, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn compute_barriers_keep_compute_stages_only() {
        let (access, stage) =
            barrier_scope(ImageLayout::General, QueueType::Compute, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(access, vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);

        let (access, stage) = barrier_scope(
            ImageLayout::ColorAttachmentOptimal,
            QueueType::Compute,
            vk::PipelineStageFlags::TOP_OF_PIPE,
        );
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(access.is_empty());
    }
}
