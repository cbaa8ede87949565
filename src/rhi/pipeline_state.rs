// Pipeline state - everything a draw or dispatch needs besides bindings
//
// Value objects only. Backends build native pipelines from these and cache
// them by `compute_hash`.

use super::definition::{
    hash_combine, CompareFunction, CullMode, PolygonMode, PrimitiveTopology, MAX_RENDER_TARGET_COUNT,
};
use super::descriptor::Descriptor;
use super::format::Format;
use super::handle::SwapchainHandle;
use super::shader::Shader;
use super::texture::Texture;
use std::sync::Arc;

pub const COLOR_LOAD: [f32; 4] = [f32::INFINITY, 0.0, 0.0, 0.0];
pub const COLOR_DONT_CARE: [f32; 4] = [f32::MAX, 0.0, 0.0, 0.0];
pub const DEPTH_LOAD: f32 = f32::INFINITY;
pub const DEPTH_DONT_CARE: f32 = f32::MAX;
pub const STENCIL_LOAD: u32 = u32::MAX - 1;
pub const STENCIL_DONT_CARE: u32 = u32::MAX;

/// Floats enter hashes at a fixed precision
fn hash_f32(hash: u64, value: f32) -> u64 {
    hash_combine(hash, (value * 100.0) as i64 as u64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub cull_mode: CullMode,
    pub polygon_mode: PolygonMode,
    pub depth_clip_enabled: bool,
    pub scissor_enabled: bool,
    pub antialiased_line_enabled: bool,
    pub depth_bias: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope_scaled: f32,
    pub line_width: f32,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            polygon_mode: PolygonMode::Solid,
            depth_clip_enabled: true,
            scissor_enabled: false,
            antialiased_line_enabled: false,
            depth_bias: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_scaled: 0.0,
            line_width: 1.0,
        }
    }
}

impl RasterizerState {
    pub fn hash(&self) -> u64 {
        let mut hash = hash_combine(0, self.cull_mode as u64);
        hash = hash_combine(hash, self.polygon_mode as u64);
        hash = hash_combine(hash, self.depth_clip_enabled as u64);
        hash = hash_combine(hash, self.scissor_enabled as u64);
        hash = hash_combine(hash, self.antialiased_line_enabled as u64);
        hash = hash_f32(hash, self.depth_bias);
        hash = hash_f32(hash, self.depth_bias_clamp);
        hash = hash_f32(hash, self.depth_bias_slope_scaled);
        hash_f32(hash, self.line_width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendOperation {
    #[default]
    Add,
    Subtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlendState {
    pub blend_enabled: bool,
    pub source_blend: BlendFactor,
    pub dest_blend: BlendFactor,
    pub blend_op: BlendOperation,
    pub source_blend_alpha: BlendFactor,
    pub dest_blend_alpha: BlendFactor,
    pub blend_op_alpha: BlendOperation,
    pub blend_factor: f32,
}

impl BlendState {
    pub fn alpha_blend() -> Self {
        Self {
            blend_enabled: true,
            source_blend: BlendFactor::SrcAlpha,
            dest_blend: BlendFactor::InvSrcAlpha,
            ..Self::default()
        }
    }

    pub fn hash(&self) -> u64 {
        let mut hash = hash_combine(0, self.blend_enabled as u64);
        hash = hash_combine(hash, self.source_blend as u64);
        hash = hash_combine(hash, self.dest_blend as u64);
        hash = hash_combine(hash, self.blend_op as u64);
        hash = hash_combine(hash, self.source_blend_alpha as u64);
        hash = hash_combine(hash, self.dest_blend_alpha as u64);
        hash = hash_combine(hash, self.blend_op_alpha as u64);
        hash_f32(hash, self.blend_factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub depth_test_enabled: bool,
    pub depth_write_enabled: bool,
    pub depth_comparison: CompareFunction,
    pub stencil_test_enabled: bool,
    pub stencil_write_enabled: bool,
    pub stencil_comparison: CompareFunction,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enabled: true,
            depth_write_enabled: true,
            depth_comparison: CompareFunction::LessEqual,
            stencil_test_enabled: false,
            stencil_write_enabled: false,
            stencil_comparison: CompareFunction::Always,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
        }
    }
}

impl DepthStencilState {
    pub fn hash(&self) -> u64 {
        let mut hash = hash_combine(0, self.depth_test_enabled as u64);
        hash = hash_combine(hash, self.depth_write_enabled as u64);
        hash = hash_combine(hash, self.depth_comparison as u64);
        hash = hash_combine(hash, self.stencil_test_enabled as u64);
        hash = hash_combine(hash, self.stencil_write_enabled as u64);
        hash = hash_combine(hash, self.stencil_comparison as u64);
        hash = hash_combine(hash, self.stencil_read_mask as u64);
        hash_combine(hash, self.stencil_write_mask as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Swapchain image used as the color target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainTarget {
    pub handle: SwapchainHandle,
    pub width: u32,
    pub height: u32,
    pub format: Format,
}

#[derive(Clone)]
pub struct PipelineState {
    pub name: String,
    pub shader_vertex: Option<Arc<Shader>>,
    pub shader_pixel: Option<Arc<Shader>>,
    pub shader_compute: Option<Arc<Shader>>,
    pub rasterizer_state: Option<RasterizerState>,
    pub blend_state: Option<BlendState>,
    pub depth_stencil_state: Option<DepthStencilState>,
    pub primitive_topology: Option<PrimitiveTopology>,
    pub render_target_swapchain: Option<SwapchainTarget>,
    pub render_target_color_textures: [Option<Arc<Texture>>; MAX_RENDER_TARGET_COUNT],
    pub render_target_depth_texture: Option<Arc<Texture>>,
    pub render_target_color_texture_array_index: u32,
    pub render_target_depth_stencil_texture_array_index: u32,
    pub clear_color: [[f32; 4]; MAX_RENDER_TARGET_COUNT],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub viewport: Viewport,
    pub scissor: Rect,
    pub dynamic_scissor: bool,
    pub can_use_vertex_index_buffers: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            name: String::new(),
            shader_vertex: None,
            shader_pixel: None,
            shader_compute: None,
            rasterizer_state: None,
            blend_state: None,
            depth_stencil_state: None,
            primitive_topology: None,
            render_target_swapchain: None,
            render_target_color_textures: Default::default(),
            render_target_depth_texture: None,
            render_target_color_texture_array_index: 0,
            render_target_depth_stencil_texture_array_index: 0,
            clear_color: [COLOR_LOAD; MAX_RENDER_TARGET_COUNT],
            clear_depth: DEPTH_LOAD,
            clear_stencil: STENCIL_LOAD,
            viewport: Viewport::default(),
            scissor: Rect::default(),
            dynamic_scissor: false,
            can_use_vertex_index_buffers: true,
        }
    }
}

fn compiled(shader: &Option<Arc<Shader>>) -> bool {
    shader.as_ref().is_some_and(|s| s.is_compiled())
}

impl PipelineState {
    pub fn is_graphics(&self) -> bool {
        (compiled(&self.shader_vertex) || compiled(&self.shader_pixel)) && !compiled(&self.shader_compute)
    }

    pub fn is_compute(&self) -> bool {
        compiled(&self.shader_compute) && !compiled(&self.shader_vertex) && !compiled(&self.shader_pixel)
    }

    /// At least one compiled shader, and for graphics: every fixed-function
    /// state plus exactly one kind of color target (textures or swapchain)
    pub fn is_valid(&self) -> bool {
        if !self.is_graphics() && !self.is_compute() {
            return false;
        }

        if self.is_compute() {
            return true;
        }

        let has_graphics_states = self.rasterizer_state.is_some()
            && self.blend_state.is_some()
            && self.depth_stencil_state.is_some()
            && self.primitive_topology.is_some();
        let has_render_target =
            self.render_target_color_textures[0].is_some() || self.render_target_depth_texture.is_some();
        let has_swapchain = self.render_target_swapchain.is_some();

        has_graphics_states && (has_render_target != has_swapchain)
    }

    pub fn has_clear_values(&self) -> bool {
        if self.clear_depth != DEPTH_LOAD && self.clear_depth != DEPTH_DONT_CARE {
            return true;
        }

        if self.clear_stencil != STENCIL_LOAD && self.clear_stencil != STENCIL_DONT_CARE {
            return true;
        }

        self.clear_color
            .iter()
            .any(|color| *color != COLOR_LOAD && *color != COLOR_DONT_CARE)
    }

    pub fn width(&self) -> u32 {
        if let Some(swapchain) = &self.render_target_swapchain {
            return swapchain.width;
        }
        self.render_target_color_textures[0]
            .as_ref()
            .or(self.render_target_depth_texture.as_ref())
            .map_or(0, |texture| texture.width())
    }

    pub fn height(&self) -> u32 {
        if let Some(swapchain) = &self.render_target_swapchain {
            return swapchain.height;
        }
        self.render_target_color_textures[0]
            .as_ref()
            .or(self.render_target_depth_texture.as_ref())
            .map_or(0, |texture| texture.height())
    }

    /// Identity of the native pipeline these states produce; clear values
    /// aren't part of it
    pub fn compute_hash(&self) -> u64 {
        let mut hash = hash_combine(0, self.can_use_vertex_index_buffers as u64);
        hash = hash_combine(hash, self.dynamic_scissor as u64);
        hash = hash_f32(hash, self.viewport.x);
        hash = hash_f32(hash, self.viewport.y);
        hash = hash_f32(hash, self.viewport.width);
        hash = hash_f32(hash, self.viewport.height);
        hash = hash_combine(hash, self.primitive_topology.map_or(0, |t| t as u64 + 1));
        hash = hash_combine(hash, self.render_target_color_texture_array_index as u64);
        hash = hash_combine(hash, self.render_target_depth_stencil_texture_array_index as u64);

        if let Some(swapchain) = &self.render_target_swapchain {
            hash = hash_combine(hash, u32::from(swapchain.format) as u64);
        }

        if !self.dynamic_scissor {
            hash = hash_combine(hash, self.scissor.left as u64);
            hash = hash_combine(hash, self.scissor.top as u64);
            hash = hash_combine(hash, self.scissor.right as u64);
            hash = hash_combine(hash, self.scissor.bottom as u64);
        }

        if let Some(state) = &self.rasterizer_state {
            hash = hash_combine(hash, state.hash());
        }
        if let Some(state) = &self.blend_state {
            hash = hash_combine(hash, state.hash());
        }
        if let Some(state) = &self.depth_stencil_state {
            hash = hash_combine(hash, state.hash());
        }

        for shader in [&self.shader_compute, &self.shader_vertex, &self.shader_pixel]
            .into_iter()
            .flatten()
        {
            hash = hash_combine(hash, shader.hash());
        }

        for texture in self.render_target_color_textures.iter().flatten() {
            hash = hash_combine(hash, texture.id().as_raw());
        }
        if let Some(texture) = &self.render_target_depth_texture {
            hash = hash_combine(hash, texture.id().as_raw());
        }

        hash
    }

    /// Reflected descriptors of every stage, merged by type and slot
    pub fn descriptors(&self) -> Vec<Descriptor> {
        let mut merged: Vec<Descriptor> = Vec::new();

        if let Some(shader) = &self.shader_compute {
            merged = shader.descriptors();
        } else {
            for shader in [&self.shader_vertex, &self.shader_pixel].into_iter().flatten() {
                for descriptor in shader.descriptors() {
                    match merged
                        .iter_mut()
                        .find(|d| d.descriptor_type == descriptor.descriptor_type && d.slot == descriptor.slot)
                    {
                        Some(existing) => existing.stage |= descriptor.stage,
                        None => merged.push(descriptor),
                    }
                }
            }
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::definition::{DescriptorType, ShaderStage};
    use crate::rhi::shader::CompiledShader;

    fn shader(name: &str, stage: ShaderStage, descriptors: Vec<Descriptor>) -> Arc<Shader> {
        let shader = Shader::new(name, stage);
        shader.compile(|| {
            Ok(CompiledShader {
                bytecode: Vec::new(),
                descriptors,
            })
        });
        Arc::new(shader)
    }

    fn graphics_state() -> PipelineState {
        let frame = Descriptor::from_register("frame", DescriptorType::ConstantBuffer, 0, ShaderStage::VERTEX);
        let mut frame_ps = frame.clone();
        frame_ps.stage = ShaderStage::PIXEL;
        let albedo = Descriptor::from_register("albedo", DescriptorType::Texture, 0, ShaderStage::PIXEL);

        PipelineState {
            name: "quad".to_string(),
            shader_vertex: Some(shader("quad_vs", ShaderStage::VERTEX, vec![frame])),
            shader_pixel: Some(shader("quad_ps", ShaderStage::PIXEL, vec![frame_ps, albedo])),
            rasterizer_state: Some(RasterizerState::default()),
            blend_state: Some(BlendState::default()),
            depth_stencil_state: Some(DepthStencilState::default()),
            primitive_topology: Some(PrimitiveTopology::TriangleList),
            render_target_swapchain: Some(SwapchainTarget {
                handle: SwapchainHandle::from_raw(1),
                width: 1280,
                height: 720,
                format: Format::B8R8G8A8Unorm,
            }),
            ..PipelineState::default()
        }
    }

    #[test]
    fn validity_rules() {
        assert!(!PipelineState::default().is_valid());

        let state = graphics_state();
        assert!(state.is_graphics());
        assert!(state.is_valid());
        assert_eq!((state.width(), state.height()), (1280, 720));

        let missing_states = PipelineState {
            blend_state: None,
            ..graphics_state()
        };
        assert!(!missing_states.is_valid());

        let no_target = PipelineState {
            render_target_swapchain: None,
            ..graphics_state()
        };
        assert!(!no_target.is_valid());

        let compute = PipelineState {
            shader_compute: Some(shader("blur_cs", ShaderStage::COMPUTE, Vec::new())),
            ..PipelineState::default()
        };
        assert!(compute.is_compute());
        assert!(compute.is_valid());
    }

    #[test]
    fn uncompiled_shaders_dont_count() {
        let state = PipelineState {
            shader_compute: Some(Arc::new(Shader::new("pending_cs", ShaderStage::COMPUTE))),
            ..PipelineState::default()
        };
        assert!(!state.is_compute());
        assert!(!state.is_valid());
    }

    #[test]
    fn clear_values() {
        let mut state = graphics_state();
        assert!(!state.has_clear_values());

        state.clear_stencil = STENCIL_DONT_CARE;
        state.clear_color[3] = COLOR_DONT_CARE;
        assert!(!state.has_clear_values());

        state.clear_stencil = 0;
        assert!(state.has_clear_values());

        state.clear_stencil = STENCIL_LOAD;
        state.clear_color[0] = [0.0, 0.0, 0.0, 1.0];
        assert!(state.has_clear_values());
    }

    #[test]
    fn hash_tracks_pipeline_identity() {
        let state = graphics_state();
        let mut cleared = graphics_state();
        cleared.clear_depth = 0.0;
        assert_eq!(state.compute_hash(), cleared.compute_hash());

        let mut wireframe = graphics_state();
        wireframe.rasterizer_state = Some(RasterizerState {
            polygon_mode: PolygonMode::Wireframe,
            ..RasterizerState::default()
        });
        assert_ne!(state.compute_hash(), wireframe.compute_hash());

        let mut blended = graphics_state();
        blended.blend_state = Some(BlendState::alpha_blend());
        assert_ne!(state.compute_hash(), blended.compute_hash());

        // Scissor only matters when it's baked into the pipeline
        let mut scissored = graphics_state();
        scissored.dynamic_scissor = true;
        let mut moved = scissored.clone();
        moved.scissor.right = 64;
        assert_eq!(scissored.compute_hash(), moved.compute_hash());
    }

    #[test]
    fn descriptors_merge_stages() {
        let descriptors = graphics_state().descriptors();
        assert_eq!(descriptors.len(), 2);

        let frame = descriptors
            .iter()
            .find(|d| d.descriptor_type == DescriptorType::ConstantBuffer)
            .unwrap();
        assert_eq!(frame.stage, ShaderStage::VERTEX | ShaderStage::PIXEL);
    }
}
