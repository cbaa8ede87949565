// Command pool - a 2-D ring of command lists
//
// `pool_count` native pools, each holding `list_count` lists. `step()` walks
// the lists of the current pool, then moves to the next pool. A pool is
// reclaimed (its submitted lists waited on, then the native pool reset) as
// the ring enters it, so the list handed out is always idle.

use super::command_list::CommandList;
use super::context::DeviceContext;
use super::definition::{CommandListState, QueueType};
use super::handle::CommandPoolHandle;
use anyhow::Result;
use std::sync::Arc;

pub struct CommandPool {
    context: Arc<DeviceContext>,
    name: String,
    swap_chain_id: u64,
    queue_type: QueueType,
    rhi_resources: Vec<CommandPoolHandle>,
    cmd_lists: Vec<CommandList>,
    cmd_list_count: u32,
    cmd_pool_count: u32,
    cmd_list_index: u32,
    cmd_pool_index: u32,
    first_step: bool,
}

impl CommandPool {
    pub fn new(context: Arc<DeviceContext>, name: &str, swap_chain_id: u64) -> Self {
        Self {
            context,
            name: name.to_string(),
            swap_chain_id,
            queue_type: QueueType::Graphics,
            rhi_resources: Vec::new(),
            cmd_lists: Vec::new(),
            cmd_list_count: 0,
            cmd_pool_count: 0,
            cmd_list_index: 0,
            cmd_pool_index: 0,
            first_step: true,
        }
    }

    /// Create `cmd_pool_count` native pools with `cmd_list_count` lists each
    pub fn allocate_command_lists(&mut self, queue_type: QueueType, cmd_list_count: u32, cmd_pool_count: u32) -> Result<()> {
        assert!(cmd_list_count > 0, "A command pool needs at least one command list");
        assert!(cmd_pool_count > 0, "A command pool needs at least one native pool");
        assert!(self.cmd_lists.is_empty(), "\"{}\" already has command lists", self.name);

        self.queue_type = queue_type;
        self.cmd_list_count = cmd_list_count;
        self.cmd_pool_count = cmd_pool_count;

        let backend = self.context.backend();
        for pool_index in 0..cmd_pool_count {
            let pool_name = format!("{}_cmd_pool_{}", self.name, pool_index);
            let pool = self.context.check(backend.create_command_pool(queue_type, &pool_name))?;
            self.rhi_resources.push(pool);

            for list_index in 0..cmd_list_count {
                let list_name = format!("{}_cmd_list_{}", pool_name, list_index);
                let cmd_list = CommandList::new(self.context.clone(), queue_type, list_index, pool, &list_name)?;
                self.cmd_lists.push(cmd_list);
            }
        }

        log::debug!(
            "Command pool \"{}\": {} pools x {} lists on the {} queue",
            self.name,
            cmd_pool_count,
            cmd_list_count,
            queue_type.as_str()
        );

        Ok(())
    }

    /// Advance to the next command list
    ///
    /// Returns true when the ring wrapped back to the first list of the first
    /// pool, which is when per-generation transient memory can be reused. The
    /// first call after construction only primes the ring.
    pub fn step(&mut self) -> Result<bool> {
        assert!(!self.cmd_lists.is_empty(), "\"{}\" has no command lists", self.name);

        if self.first_step {
            self.first_step = false;
            return Ok(false);
        }

        self.cmd_list_index = (self.cmd_list_index + 1) % self.cmd_list_count;
        if self.cmd_list_index != 0 {
            return Ok(false);
        }

        self.cmd_pool_index = (self.cmd_pool_index + 1) % self.cmd_pool_count;
        self.reclaim(self.cmd_pool_index)?;

        Ok(self.cmd_pool_index == 0)
    }

    // Wait for every submitted list of the pool, only then reset it
    fn reclaim(&mut self, pool_index: u32) -> Result<()> {
        let start = (pool_index * self.cmd_list_count) as usize;
        let end = start + self.cmd_list_count as usize;
        for cmd_list in &mut self.cmd_lists[start..end] {
            if cmd_list.state() == CommandListState::Submitted {
                cmd_list.wait(true)?;
            }
        }

        self.reset(pool_index)
    }

    /// Reset a native pool, its lists must not be in flight
    pub fn reset(&mut self, pool_index: u32) -> Result<()> {
        let pool = self.rhi_resources[pool_index as usize];
        self.context.check(self.context.backend().reset_command_pool(pool))
    }

    pub fn current_command_list(&mut self) -> &mut CommandList {
        let index = self.current_index();
        &mut self.cmd_lists[index]
    }

    pub fn current(&self) -> &CommandList {
        &self.cmd_lists[self.current_index()]
    }

    fn current_index(&self) -> usize {
        assert!(!self.cmd_lists.is_empty(), "\"{}\" has no command lists", self.name);
        (self.cmd_pool_index * self.cmd_list_count + self.cmd_list_index) as usize
    }

    pub fn command_lists(&self) -> &[CommandList] {
        &self.cmd_lists
    }

    pub fn command_lists_mut(&mut self) -> &mut [CommandList] {
        &mut self.cmd_lists
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn swap_chain_id(&self) -> u64 {
        self.swap_chain_id
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn cmd_list_index(&self) -> u32 {
        self.cmd_list_index
    }

    pub fn cmd_pool_index(&self) -> u32 {
        self.cmd_pool_index
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if let Err(e) = self.context.queue_wait_all() {
            log::error!("Failed to wait for the queues before destroying \"{}\": {:#}", self.name, e);
        }

        // Lists go first, their buffers belong to the native pools
        self.cmd_lists.clear();
        for pool in self.rhi_resources.drain(..) {
            self.context.backend().destroy_command_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, HeadlessBackend, HeadlessInspector};
    use crate::rhi::physical_device::QueueFamilyIndices;

    fn pool(list_count: u32, pool_count: u32) -> (CommandPool, HeadlessInspector) {
        let backend = HeadlessBackend::new();
        let inspector = backend.inspector();
        let families = QueueFamilyIndices { graphics: 0, compute: 1, copy: 2 };
        let ctx = Arc::new(DeviceContext::new(Box::new(backend), families, false));
        let mut pool = CommandPool::new(ctx, "frame", 1);
        pool.allocate_command_lists(QueueType::Graphics, list_count, pool_count).unwrap();
        (pool, inspector)
    }

    fn record_and_submit(pool: &mut CommandPool) {
        let cmd = pool.current_command_list();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd.submit(None).unwrap();
    }

    #[test]
    fn lists_are_named_after_their_pool() {
        let (pool, _inspector) = pool(2, 2);
        let names: Vec<_> = pool.command_lists().iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            [
                "frame_cmd_pool_0_cmd_list_0",
                "frame_cmd_pool_0_cmd_list_1",
                "frame_cmd_pool_1_cmd_list_0",
                "frame_cmd_pool_1_cmd_list_1",
            ]
        );
    }

    #[test]
    fn step_wraps_after_full_cycle() {
        let (mut pool, _inspector) = pool(2, 2);

        let mut results = Vec::new();
        let mut indices = Vec::new();
        for _ in 0..5 {
            results.push(pool.step().unwrap());
            indices.push((pool.cmd_pool_index(), pool.cmd_list_index()));
            record_and_submit(&mut pool);
        }

        assert_eq!(results, [false, false, false, false, true]);
        assert_eq!(indices, [(0, 0), (0, 1), (1, 0), (1, 1), (0, 0)]);
    }

    #[test]
    fn reclaim_waits_before_reset() {
        let (mut pool, inspector) = pool(2, 2);
        for _ in 0..4 {
            pool.step().unwrap();
            record_and_submit(&mut pool);
        }

        let fences: Vec<_> = pool.command_lists()[0..2]
            .iter()
            .map(|c| c.processed_fence().handle())
            .collect();
        let native_pool = pool.rhi_resources[0];

        inspector.clear_events();
        assert!(pool.step().unwrap());

        let events = inspector.events();
        let reset = events
            .iter()
            .position(|e| *e == BackendEvent::CommandPoolReset(native_pool))
            .expect("pool 0 was reset");
        for fence in fences {
            let wait = events
                .iter()
                .position(|e| *e == BackendEvent::FenceWait(fence))
                .expect("list was waited on");
            assert!(wait < reset);
        }

        assert!(pool.command_lists()[0..2]
            .iter()
            .all(|c| c.state() == CommandListState::Idle));
        // Pool 1 is still in flight
        assert!(pool.command_lists()[2..4]
            .iter()
            .all(|c| c.state() == CommandListState::Submitted));
    }

    #[test]
    fn current_list_is_idle_after_every_step() {
        let (mut pool, _inspector) = pool(3, 2);
        for _ in 0..20 {
            pool.step().unwrap();
            assert_eq!(pool.current().state(), CommandListState::Idle);
            record_and_submit(&mut pool);
        }
    }

    #[test]
    fn single_list_single_pool_wraps_every_step() {
        let (mut pool, _inspector) = pool(1, 1);
        assert!(!pool.step().unwrap());
        record_and_submit(&mut pool);
        assert!(pool.step().unwrap());
        assert_eq!(pool.current().state(), CommandListState::Idle);
    }

    #[test]
    fn drop_releases_native_pools() {
        let (pool, inspector) = pool(2, 3);
        assert_eq!(inspector.live_command_pools(), 3);
        drop(pool);
        assert_eq!(inspector.live_command_pools(), 0);
        assert_eq!(inspector.live_fences(), 0);
    }
}
