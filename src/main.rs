// =============================================================================
// RHI CORE - device layer demo
// =============================================================================
//
// Brings up a device on the configured backend and drives a few frames
// through the command list ring, the dynamic constant buffer and the
// descriptor set cache.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Device (adapter selection, queues, memory, descriptor cache)   │
// │    └── CommandPool (ring of command lists over native pools)    │
// │          └── CommandList (record, submit, fence + semaphore)    │
// │    └── DescriptorSetLayout (bindings → cached descriptor sets)  │
// │    └── Backend (Vulkan via ash, or headless)                    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Step the command pool (reclaims the pool it enters)
// 2. Record: transition, update constants, resolve the descriptor set
// 3. Submit, signaling the list's fence and semaphore
//
// Static geometry is uploaded once up front with an immediate copy.
//
// =============================================================================

use anyhow::{Context, Result};
use rhi_core::backend::{HeadlessBackend, TextureDesc, VulkanDevice};
use rhi_core::config::{BackendKind, Config};
use rhi_core::rhi::definition::{DescriptorType, ImageLayout, QueueType, ShaderStage, TextureUsage, ALL_MIPS};
use rhi_core::rhi::descriptor::Descriptor;
use rhi_core::rhi::{ConstantBuffer, DescriptorSetLayout, Device, Format, IndexBuffer, Texture, VertexBuffer};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

/// Per-frame constants, laid out the way a shader's cbuffer reads them
#[repr(C)]
#[derive(Clone, Copy)]
struct FrameConstants {
    frame: u32,
    time: f32,
    _padding: [u32; 2],
}

impl FrameConstants {
    fn as_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.frame.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.time.to_le_bytes());
        bytes
    }
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting rhi-core ({} backend)", config.device.backend);

    let device = match create_device(&config) {
        Ok(device) => device,
        Err(e) => {
            log::error!("Failed to initialize the device: {:#}", e);
            return Err(e);
        }
    };

    run_frames(&device, &config)?;

    let stats = device.profiler().stats();
    log::info!(
        "Descriptor sets: {}/{}, immediate submissions: {}",
        stats.descriptor_set_count,
        stats.descriptor_set_capacity,
        stats.immediate_submissions
    );

    device.queue_wait_all()?;
    log::info!("Shutdown complete");
    Ok(())
}

/// Initialize logging, optionally redirected into a truncated log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.debug.level_filter());

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== RHI Core Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Couldn't open {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

fn create_device(config: &Config) -> Result<Arc<Device>> {
    match config.device.backend_kind() {
        BackendKind::Vulkan => {
            let backend = VulkanDevice::new(
                &config.device.app_name,
                config.device.validation_layers,
                config.device.gpu_markers,
            )
            .context("Failed to create the Vulkan instance")?;
            Device::new(&config.device, backend)
        }
        BackendKind::Headless => Device::new(&config.device, HeadlessBackend::new()),
    }
}

// =============================================================================
// FRAME LOOP
// =============================================================================

fn run_frames(device: &Arc<Device>, config: &Config) -> Result<()> {
    let cmd_list_count = config.command.cmd_list_count;
    let cmd_pool_count = config.command.cmd_pool_count;

    let pool = device.allocate_command_pool("demo", 0);
    pool.lock()
        .allocate_command_lists(QueueType::Graphics, cmd_list_count, cmd_pool_count)?;

    let texture = Texture::new(
        device,
        &TextureDesc {
            name: "demo_texture",
            width: 256,
            height: 256,
            array_length: 1,
            mip_count: 1,
            format: Format::R8G8B8A8Unorm,
            usage: TextureUsage::SRV | TextureUsage::UAV,
            is_cube: false,
        },
    )?;

    // Full screen quad, uploaded once through the copy queue
    let quad_positions: [[f32; 3]; 4] = [[-1.0, -1.0, 0.0], [1.0, -1.0, 0.0], [1.0, 1.0, 0.0], [-1.0, 1.0, 0.0]];
    let quad_bytes: Vec<u8> = quad_positions
        .iter()
        .flatten()
        .flat_map(|component| component.to_ne_bytes())
        .collect();
    let quad_vertices = VertexBuffer::new(device, "quad_vertices", 12, &quad_bytes)?;
    let quad_indices = IndexBuffer::new_u16(device, "quad_indices", &[0, 1, 2, 2, 3, 0])?;
    log::info!(
        "Uploaded quad: {} vertices, {} indices",
        quad_vertices.vertex_count(),
        quad_indices.index_count()
    );

    // One constants slot per list in flight, the ring is rewound when the pool wraps
    let mut constants = ConstantBuffer::new(
        device,
        "frame_constants",
        std::mem::size_of::<FrameConstants>() as u32,
        cmd_list_count * cmd_pool_count,
    )?;

    let mut layout = DescriptorSetLayout::new(
        device,
        vec![
            Descriptor::from_register(
                "frame_constants",
                DescriptorType::ConstantBuffer,
                0,
                ShaderStage::VERTEX | ShaderStage::PIXEL,
            ),
            Descriptor::from_register("albedo", DescriptorType::Texture, 0, ShaderStage::PIXEL),
        ],
        "demo_layout",
    )?;

    let start = Instant::now();
    for frame in 0..config.demo.frame_count {
        let mut pool = pool.lock();
        if pool.step()? {
            constants.reset_offset();
        }

        let cmd_list = pool.current_command_list();
        cmd_list.begin()?;
        cmd_list.transition_texture(&texture, ImageLayout::ShaderReadOnlyOptimal, 0, ALL_MIPS);

        let frame_constants = FrameConstants {
            frame,
            time: start.elapsed().as_secs_f32(),
            _padding: [0; 2],
        };
        constants.update(&frame_constants.as_bytes())?;

        layout.set_constant_buffer(0, &constants);
        layout.set_texture(0, &texture, 0, ALL_MIPS);
        let resolved = layout.get_descriptor_set()?;
        if resolved.created {
            log::debug!("Frame {}: created descriptor set {:#x}", frame, resolved.hash);
        }

        cmd_list.end()?;
        cmd_list.submit(None)?;
    }

    log::info!(
        "Recorded {} frames in {:.2} ms",
        config.demo.frame_count,
        start.elapsed().as_secs_f64() * 1000.0
    );

    // Everything must be off the GPU before the resources go away
    device.queue_wait_all()?;
    drop(layout);
    drop(quad_indices);
    drop(quad_vertices);
    drop(constants);
    drop(texture);
    device.destroy_command_pool(&pool);
    Ok(())
}
