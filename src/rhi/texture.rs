// Texture - image, views and per-mip layout tracking

use super::definition::{ImageLayout, TextureUsage, ALL_MIPS, MAX_MIP_COUNT};
use super::device::Device;
use super::format::Format;
use super::handle::{ImageHandle, ImageViewHandle, ResourceId};
use crate::backend::{ImageViewDesc, TextureDesc};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct Texture {
    device: Arc<Device>,
    id: ResourceId,
    name: String,
    width: u32,
    height: u32,
    array_length: u32,
    mip_count: u32,
    format: Format,
    usage: TextureUsage,
    is_cube: bool,
    image: ImageHandle,
    view: ImageViewHandle,
    mip_views: Vec<ImageViewHandle>,
    layouts: Mutex<Vec<ImageLayout>>,
}

impl Texture {
    pub fn new(device: &Arc<Device>, desc: &TextureDesc<'_>) -> Result<Self> {
        assert!(
            (1..=MAX_MIP_COUNT).contains(&desc.mip_count),
            "\"{}\" has {} mips, expected 1 to {}",
            desc.name,
            desc.mip_count,
            MAX_MIP_COUNT
        );
        assert!(desc.array_length > 0, "\"{}\" needs at least one layer", desc.name);
        assert!(
            device.is_valid_resolution(desc.width, desc.height),
            "{}x{} is not a valid resolution for \"{}\"",
            desc.width,
            desc.height,
            desc.name
        );

        let image = device.create_texture(desc)?;
        let layer_count = if desc.is_cube { desc.array_length * 6 } else { desc.array_length };

        let view_desc = |base_mip: u32, mip_count: u32| ImageViewDesc {
            name: desc.name,
            image,
            format: desc.format,
            base_mip,
            mip_count,
            base_layer: 0,
            layer_count,
            is_cube: desc.is_cube,
        };

        let backend = device.backend();
        let mut views = Vec::new();
        let created = (|| -> Result<()> {
            views.push(device.context().check(backend.create_image_view(&view_desc(0, desc.mip_count)))?);
            if desc.mip_count > 1 {
                for mip in 0..desc.mip_count {
                    views.push(device.context().check(backend.create_image_view(&view_desc(mip, 1)))?);
                }
            }
            Ok(())
        })();

        if let Err(e) = created {
            for view in views {
                backend.destroy_image_view(view);
            }
            device.destroy_texture(image);
            return Err(e);
        }

        let view = views[0];
        let mip_views = views.split_off(1);

        Ok(Self {
            device: Arc::clone(device),
            id: device.context().next_resource_id(),
            name: desc.name.to_string(),
            width: desc.width,
            height: desc.height,
            array_length: desc.array_length,
            mip_count: desc.mip_count,
            format: desc.format,
            usage: desc.usage,
            is_cube: desc.is_cube,
            image,
            view,
            mip_views,
            layouts: Mutex::new(vec![ImageLayout::Undefined; desc.mip_count as usize]),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn array_length(&self) -> u32 {
        self.array_length
    }

    pub fn layer_count(&self) -> u32 {
        if self.is_cube {
            self.array_length * 6
        } else {
            self.array_length
        }
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    pub fn is_srv(&self) -> bool {
        self.usage.contains(TextureUsage::SRV)
    }

    pub fn is_uav(&self) -> bool {
        self.usage.contains(TextureUsage::UAV)
    }

    pub fn is_rtv(&self) -> bool {
        self.usage.contains(TextureUsage::RTV)
    }

    pub fn is_dsv(&self) -> bool {
        self.usage.contains(TextureUsage::DSV)
    }

    pub fn image(&self) -> ImageHandle {
        self.image
    }

    /// View for a mip selection as taken by the binding calls
    pub fn view_for(&self, mip_index: u32, mip_range: u32) -> ImageViewHandle {
        let (base_mip, mip_count) = self.resolve_mip_range(mip_index, mip_range);
        if mip_count == 1 && !self.mip_views.is_empty() {
            self.mip_views[base_mip as usize]
        } else {
            self.view
        }
    }

    /// `(base, count)` of a mip selection, `ALL_MIPS` covers the whole chain
    /// and a zero range means a single mip
    pub fn resolve_mip_range(&self, mip_index: u32, mip_range: u32) -> (u32, u32) {
        if mip_index == ALL_MIPS {
            return (0, self.mip_count);
        }

        let mip_count = if mip_range == 0 || mip_range == ALL_MIPS { 1 } else { mip_range };
        assert!(
            mip_index + mip_count <= self.mip_count,
            "Mips {}..{} are out of range for \"{}\" ({} mips)",
            mip_index,
            mip_index + mip_count,
            self.name,
            self.mip_count
        );
        (mip_index, mip_count)
    }

    pub fn layout(&self, mip: u32) -> ImageLayout {
        self.layouts.lock()[mip as usize]
    }

    pub fn layouts(&self, base_mip: u32, mip_count: u32) -> Vec<ImageLayout> {
        let start = base_mip as usize;
        self.layouts.lock()[start..start + mip_count as usize].to_vec()
    }

    pub(crate) fn set_layouts(&self, layout: ImageLayout, base_mip: u32, mip_count: u32) {
        let start = base_mip as usize;
        for current in &mut self.layouts.lock()[start..start + mip_count as usize] {
            *current = layout;
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if let Err(e) = self.device.queue_wait_all() {
            log::error!("Failed to wait for the queues before destroying \"{}\": {:#}", self.name, e);
        }

        let backend = self.device.backend();
        backend.destroy_image_view(self.view);
        for view in self.mip_views.drain(..) {
            backend.destroy_image_view(view);
        }
        self.device.destroy_texture(self.image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendEvent;
    use crate::rhi::definition::QueueType;
    use crate::testing::headless_device;

    fn desc(name: &str, mip_count: u32) -> TextureDesc<'_> {
        TextureDesc {
            name,
            width: 256,
            height: 256,
            array_length: 1,
            mip_count,
            format: Format::R8G8B8A8Unorm,
            usage: TextureUsage::SRV | TextureUsage::UAV,
            is_cube: false,
        }
    }

    #[test]
    fn mip_views_and_ranges() {
        let (device, _inspector) = headless_device();
        let texture = Texture::new(&device, &desc("bloom", 4)).unwrap();

        assert_eq!(texture.resolve_mip_range(ALL_MIPS, 0), (0, 4));
        assert_eq!(texture.resolve_mip_range(2, 0), (2, 1));
        assert_eq!(texture.resolve_mip_range(1, 3), (1, 3));
        assert_ne!(texture.view_for(2, 1), texture.view_for(ALL_MIPS, 0));
        assert_eq!(texture.view_for(1, 2), texture.view_for(ALL_MIPS, 0));
        assert_eq!(texture.layout(0), ImageLayout::Undefined);
    }

    #[test]
    fn transitions_track_layouts_per_mip() {
        let (device, inspector) = headless_device();
        let texture = Texture::new(&device, &desc("chain", 3)).unwrap();

        let mut cmd = device.immediate_begin(QueueType::Graphics).unwrap();
        cmd.transition_texture(&texture, ImageLayout::General, 1, 1);
        assert_eq!(texture.layouts(0, 3), [ImageLayout::Undefined, ImageLayout::General, ImageLayout::Undefined]);

        inspector.clear_events();
        cmd.transition_texture(&texture, ImageLayout::ShaderReadOnlyOptimal, ALL_MIPS, 0);
        cmd.submit().unwrap();

        let barriers = inspector
            .events()
            .iter()
            .filter(|e| matches!(e, BackendEvent::ImageBarrier { .. }))
            .count();
        // Mixed source layouts need one barrier per mip
        assert_eq!(barriers, 3);
        assert!(texture
            .layouts(0, 3)
            .iter()
            .all(|l| *l == ImageLayout::ShaderReadOnlyOptimal));
    }

    #[test]
    fn drop_releases_image_and_views() {
        let (device, _inspector) = headless_device();
        let texture = Texture::new(&device, &desc("temp", 2)).unwrap();
        assert_eq!(device.allocation_count(), 1);
        drop(texture);
        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn mip_range_is_checked() {
        let (device, _inspector) = headless_device();
        let texture = Texture::new(&device, &desc("small", 2)).unwrap();
        texture.resolve_mip_range(1, 2);
    }
}
