// Shared fixtures for unit tests

use crate::backend::{HeadlessBackend, HeadlessInspector};
use crate::config::DeviceConfig;
use crate::rhi::device::Device;
use std::sync::Arc;

pub(crate) fn headless_device() -> (Arc<Device>, HeadlessInspector) {
    headless_device_with(DeviceConfig::default(), HeadlessBackend::new())
}

pub(crate) fn headless_device_with(config: DeviceConfig, backend: HeadlessBackend) -> (Arc<Device>, HeadlessInspector) {
    let inspector = backend.inspector();
    let device = Device::new(&config, backend).expect("headless device");
    (device, inspector)
}
