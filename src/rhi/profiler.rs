// Device counters, cheap enough to update on every call

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Profiler {
    descriptor_set_count: AtomicU32,
    descriptor_set_capacity: AtomicU32,
    immediate_submissions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilerStats {
    pub descriptor_set_count: u32,
    pub descriptor_set_capacity: u32,
    pub immediate_submissions: u64,
}

impl Profiler {
    pub(crate) fn descriptor_set_created(&self) {
        self.descriptor_set_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The pool was recreated, every set it held is gone
    pub(crate) fn reset_descriptor_sets(&self, capacity: u32) {
        self.descriptor_set_count.store(0, Ordering::Relaxed);
        self.descriptor_set_capacity.store(capacity, Ordering::Relaxed);
    }

    pub(crate) fn immediate_submitted(&self) {
        self.immediate_submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn descriptor_set_count(&self) -> u32 {
        self.descriptor_set_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ProfilerStats {
        ProfilerStats {
            descriptor_set_count: self.descriptor_set_count.load(Ordering::Relaxed),
            descriptor_set_capacity: self.descriptor_set_capacity.load(Ordering::Relaxed),
            immediate_submissions: self.immediate_submissions.load(Ordering::Relaxed),
        }
    }
}
