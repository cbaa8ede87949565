// Command list - one native command buffer plus its lifecycle
//
// State machine: Idle -> Recording -> Ended -> Submitted -> Idle.
// Every transition is asserted; the submitted -> idle edge only happens
// once the processed fence says the GPU is done with the buffer.

use super::context::DeviceContext;
use super::definition::{
    BindPoint, CommandListState, ImageLayout, QueueType, SyncState, FENCE_TIMEOUT_DEFAULT_NS,
};
use super::descriptor_set_layout::DescriptorSetLayout;
use super::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorSetHandle, PipelineLayoutHandle,
};
use super::sync::{Fence, Semaphore};
use super::texture::Texture;
use crate::backend::ImageBarrier;
use anyhow::Result;
use std::sync::Arc;

pub struct CommandList {
    context: Arc<DeviceContext>,
    name: String,
    queue_type: QueueType,
    index: u32,
    cmd_buffer: CommandBufferHandle,
    processed_fence: Fence,
    processed_semaphore: Semaphore,
    state: CommandListState,
    discard: bool,
    bound_descriptor_set: Option<DescriptorSetHandle>,
    dynamic_offsets: Vec<u32>,
}

impl CommandList {
    pub fn new(
        context: Arc<DeviceContext>,
        queue_type: QueueType,
        index: u32,
        pool: CommandPoolHandle,
        name: &str,
    ) -> Result<Self> {
        let cmd_buffer = context.check(context.backend().allocate_command_buffer(pool, name))?;
        let processed_fence = Fence::new(context.clone(), Some(&format!("{}_fence_processed", name)))?;
        let processed_semaphore =
            Semaphore::new(context.clone(), Some(&format!("{}_semaphore_processed", name)))?;

        log::debug!("Created command list \"{}\"", name);

        Ok(Self {
            context,
            name: name.to_string(),
            queue_type,
            index,
            cmd_buffer,
            processed_fence,
            processed_semaphore,
            state: CommandListState::Idle,
            discard: false,
            bound_descriptor_set: None,
            dynamic_offsets: Vec::new(),
        })
    }

    pub fn begin(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            CommandListState::Idle,
            "\"{}\" must be idle before it can begin recording",
            self.name
        );

        self.context
            .check(self.context.backend().begin_command_buffer(self.cmd_buffer))?;
        self.state = CommandListState::Recording;
        self.discard = false;
        self.bound_descriptor_set = None;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            CommandListState::Recording,
            "\"{}\" must be recording before it can end",
            self.name
        );

        self.context
            .check(self.context.backend().end_command_buffer(self.cmd_buffer))?;
        self.state = CommandListState::Ended;
        Ok(())
    }

    /// Submit to the list's queue, signaling the processed fence and semaphore
    pub fn submit(&mut self, wait_semaphore: Option<&Semaphore>) -> Result<()> {
        assert_eq!(
            self.state,
            CommandListState::Ended,
            "\"{}\" must be ended before it can be submitted",
            self.name
        );

        if !self.discard {
            self.context.queue_submit(
                self.queue_type,
                self.queue_type.wait_stage(),
                self.cmd_buffer,
                wait_semaphore,
                Some(&self.processed_semaphore),
                Some(&self.processed_fence),
            )?;
        }

        self.state = CommandListState::Submitted;
        Ok(())
    }

    /// Block until the GPU is done with the list, then return it to idle
    ///
    /// # Panics
    /// If the list wasn't submitted, or the GPU doesn't finish within the
    /// default fence timeout.
    pub fn wait(&mut self, log_on_wait: bool) -> Result<()> {
        assert_eq!(
            self.state,
            CommandListState::Submitted,
            "\"{}\" hasn't been submitted, can't wait for it",
            self.name
        );

        if self.is_executing() {
            if log_on_wait {
                log::warn!("Waiting for \"{}\" to finish executing...", self.name);
            }
            let signaled = self.processed_fence.wait(FENCE_TIMEOUT_DEFAULT_NS)?;
            assert!(signaled, "Timed out while waiting for \"{}\"", self.name);
        }

        if self.processed_fence.cpu_state() == SyncState::Submitted {
            self.processed_fence.reset()?;
            self.processed_semaphore.reset()?;
        }

        self.state = CommandListState::Idle;
        Ok(())
    }

    /// Skip the submission, waiting on the list won't block
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn is_executing(&self) -> bool {
        if self.discard || self.state != CommandListState::Submitted {
            return false;
        }

        match self.processed_fence.is_signaled() {
            Ok(signaled) => !signaled,
            // Treat as executing so the caller ends up in a fence wait that reports the error
            Err(_) => true,
        }
    }

    /// Record a layout transition and track the new layout on the texture
    pub fn transition_texture(&mut self, texture: &Texture, layout: ImageLayout, mip_index: u32, mip_range: u32) {
        assert_eq!(
            self.state,
            CommandListState::Recording,
            "\"{}\" must be recording to transition textures",
            self.name
        );

        let (base_mip, mip_count) = texture.resolve_mip_range(mip_index, mip_range);
        let layouts = texture.layouts(base_mip, mip_count);
        if layouts.iter().all(|l| *l == layout) {
            return;
        }

        let barrier = |old_layout: ImageLayout, base_mip: u32, mip_count: u32| ImageBarrier {
            queue_type: self.queue_type,
            image: texture.image(),
            format: texture.format(),
            old_layout,
            new_layout: layout,
            base_mip,
            mip_count,
            layer_count: texture.layer_count(),
        };

        let backend = self.context.backend();
        if layouts.iter().all(|l| *l == layouts[0]) {
            backend.cmd_image_barrier(self.cmd_buffer, &barrier(layouts[0], base_mip, mip_count));
        } else {
            for (i, old_layout) in layouts.iter().enumerate() {
                if *old_layout != layout {
                    backend.cmd_image_barrier(self.cmd_buffer, &barrier(*old_layout, base_mip + i as u32, 1));
                }
            }
        }

        texture.set_layouts(layout, base_mip, mip_count);
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, size: u64) {
        assert_eq!(
            self.state,
            CommandListState::Recording,
            "\"{}\" must be recording to copy buffers",
            self.name
        );
        assert!(!src.is_null() && !dst.is_null(), "Can't copy between null buffers");

        self.context.backend().cmd_copy_buffer(self.cmd_buffer, src, dst, size);
    }

    /// Resolve the layout's current bindings and bind the matching set
    ///
    /// Binds when the set changed since the last bind on this list, or when
    /// the layout reports new bindings.
    pub fn bind_descriptor_set(
        &mut self,
        pipeline_layout: PipelineLayoutHandle,
        layout: &mut DescriptorSetLayout,
        bind_point: BindPoint,
    ) -> Result<()> {
        assert_eq!(
            self.state,
            CommandListState::Recording,
            "\"{}\" must be recording to bind descriptor sets",
            self.name
        );

        let resolved = layout.get_descriptor_set()?;
        if !resolved.needs_bind && self.bound_descriptor_set == Some(resolved.handle) {
            return Ok(());
        }

        layout.get_dynamic_offsets(&mut self.dynamic_offsets);
        self.context.backend().cmd_bind_descriptor_set(
            self.cmd_buffer,
            bind_point,
            pipeline_layout,
            resolved.handle,
            &self.dynamic_offsets,
        );
        self.bound_descriptor_set = Some(resolved.handle);
        Ok(())
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn handle(&self) -> CommandBufferHandle {
        self.cmd_buffer
    }

    pub fn processed_fence(&self) -> &Fence {
        &self.processed_fence
    }

    /// Signaled when the list's work completes, chain it into a present or
    /// another queue's submission
    pub fn processed_semaphore(&self) -> &Semaphore {
        &self.processed_semaphore
    }
}
