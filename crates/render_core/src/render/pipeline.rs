//! Shading models and graphics pipeline construction
//!
//! A [`ShadingModel`] picks the forward shader pair and the material binding
//! layout from a fixed table of construction functions. The scene-wide
//! layout depends on how many cameras and lights the scene holds, so the
//! forward pipeline is rebuilt when those counts change.

use serde::{Deserialize, Serialize};

use crate::render::api::{
    BindingLayout, GpuBackend, PipelineDesc, PushConstantRange, RawPipeline, RawRenderPass, ShaderStages,
    VertexAttribute, VertexFormat, VertexInputLayout,
};
use crate::render::mesh::Vertex;
use crate::render::shader_cache::ShaderCache;
use crate::render::RenderResult;

/// Bytes of per-draw push data (one model matrix)
pub const PUSH_CONSTANT_SIZE: u32 = 64;

/// Postfx shader pair
pub const POSTFX_SHADERS: (&str, &str) = ("postfx.vert.spv", "postfx.frag.spv");

/// Texture inputs a material may provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSlot {
    /// Albedo
    BaseColor,
    /// Tangent-space normals
    Normal,
    /// Metallic in B, roughness in G
    MetallicRoughness,
    /// Ambient occlusion
    Occlusion,
    /// Emitted light
    Emissive,
}

impl TextureSlot {
    /// Texel used when the material has no texture for this slot
    pub const fn fallback_texel(self) -> [u8; 4] {
        match self {
            Self::Normal => [128, 128, 255, 255],
            Self::Emissive => [0, 0, 0, 255],
            Self::BaseColor | Self::MetallicRoughness | Self::Occlusion => [255, 255, 255, 255],
        }
    }
}

/// Lighting model of the forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShadingModel {
    /// Base color only, lights ignored
    Unlit,
    /// Blinn-Phong with base color and normal maps
    #[default]
    DefaultLit,
    /// Metallic-roughness PBR
    Pbr,
}

/// Everything that differs between shading models
#[derive(Debug, Clone, Copy)]
pub struct ShadingModelInfo {
    /// Model this entry describes
    pub model: ShadingModel,
    /// Vertex shader file
    pub vertex_shader: &'static str,
    /// Fragment shader file
    pub fragment_shader: &'static str,
    /// Whether the scene layout carries the light array
    pub uses_lights: bool,
    /// Whether material sets carry a factors block at binding 0
    pub uses_factors: bool,
    /// Sampled textures in binding order
    pub textures: &'static [TextureSlot],
    /// Builds the set 1 layout
    pub material_layout: fn() -> BindingLayout,
}

fn unlit_material_layout() -> BindingLayout {
    BindingLayout::new().combined_image_sampler(0, ShaderStages::FRAGMENT)
}

fn default_lit_material_layout() -> BindingLayout {
    BindingLayout::new()
        .combined_image_sampler(0, ShaderStages::FRAGMENT)
        .combined_image_sampler(1, ShaderStages::FRAGMENT)
}

fn pbr_material_layout() -> BindingLayout {
    BindingLayout::new()
        .uniform_buffer(0, 1, ShaderStages::FRAGMENT)
        .combined_image_sampler(1, ShaderStages::FRAGMENT)
        .combined_image_sampler(2, ShaderStages::FRAGMENT)
        .combined_image_sampler(3, ShaderStages::FRAGMENT)
        .combined_image_sampler(4, ShaderStages::FRAGMENT)
        .combined_image_sampler(5, ShaderStages::FRAGMENT)
}

static SHADING_MODELS: [ShadingModelInfo; 3] = [
    ShadingModelInfo {
        model: ShadingModel::Unlit,
        vertex_shader: "unlit.vert.spv",
        fragment_shader: "unlit.frag.spv",
        uses_lights: false,
        uses_factors: false,
        textures: &[TextureSlot::BaseColor],
        material_layout: unlit_material_layout,
    },
    ShadingModelInfo {
        model: ShadingModel::DefaultLit,
        vertex_shader: "default_lit.vert.spv",
        fragment_shader: "default_lit.frag.spv",
        uses_lights: true,
        uses_factors: false,
        textures: &[TextureSlot::BaseColor, TextureSlot::Normal],
        material_layout: default_lit_material_layout,
    },
    ShadingModelInfo {
        model: ShadingModel::Pbr,
        vertex_shader: "pbr.vert.spv",
        fragment_shader: "pbr.frag.spv",
        uses_lights: true,
        uses_factors: true,
        textures: &[
            TextureSlot::BaseColor,
            TextureSlot::MetallicRoughness,
            TextureSlot::Normal,
            TextureSlot::Occlusion,
            TextureSlot::Emissive,
        ],
        material_layout: pbr_material_layout,
    },
];

impl ShadingModel {
    /// Every model, in table order
    pub const ALL: [Self; 3] = [Self::Unlit, Self::DefaultLit, Self::Pbr];

    /// Table entry for this model
    pub fn info(self) -> &'static ShadingModelInfo {
        match self {
            Self::Unlit => &SHADING_MODELS[0],
            Self::DefaultLit => &SHADING_MODELS[1],
            Self::Pbr => &SHADING_MODELS[2],
        }
    }

    /// Set 1 layout
    pub fn material_layout(self) -> BindingLayout {
        (self.info().material_layout)()
    }

    /// Binding number of a texture slot, if the model samples it
    pub fn texture_binding(self, slot: TextureSlot) -> Option<u32> {
        let info = self.info();
        let first = u32::from(info.uses_factors);
        info.textures
            .iter()
            .position(|candidate| *candidate == slot)
            .and_then(|index| u32::try_from(index).ok())
            .map(|index| first + index)
    }
}

/// Number of array elements a scene layout reserves for cameras and lights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneCounts {
    /// Camera array length
    pub cameras: u32,
    /// Light array length
    pub lights: u32,
}

impl SceneCounts {
    /// Counts for a scene; arrays always hold at least one element
    pub fn new(cameras: usize, lights: usize) -> Self {
        let clamp = |count: usize| u32::try_from(count).unwrap_or(u32::MAX).max(1);
        Self {
            cameras: clamp(cameras),
            lights: clamp(lights),
        }
    }
}

/// Set 0 layout: scene info, camera array and (for lit models) light array
pub fn scene_layout(model: ShadingModel, counts: SceneCounts) -> BindingLayout {
    let stages = ShaderStages::VERTEX | ShaderStages::FRAGMENT;
    let layout = BindingLayout::new()
        .uniform_buffer(0, 1, stages)
        .uniform_buffer(1, counts.cameras, stages);
    if model.info().uses_lights {
        layout.uniform_buffer(2, counts.lights, ShaderStages::FRAGMENT)
    } else {
        layout
    }
}

/// Interleaved [`Vertex`] input
pub fn mesh_vertex_input() -> VertexInputLayout {
    VertexInputLayout {
        stride: Vertex::STRIDE,
        attributes: vec![
            VertexAttribute {
                location: 0,
                format: VertexFormat::Float3,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                format: VertexFormat::Float3,
                offset: 12,
            },
            VertexAttribute {
                location: 2,
                format: VertexFormat::Float2,
                offset: 24,
            },
            VertexAttribute {
                location: 3,
                format: VertexFormat::Float3,
                offset: 32,
            },
        ],
    }
}

/// Full-screen quad input: position and uv, two floats each
pub fn quad_vertex_input() -> VertexInputLayout {
    VertexInputLayout {
        stride: 16,
        attributes: vec![
            VertexAttribute {
                location: 0,
                format: VertexFormat::Float2,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                format: VertexFormat::Float2,
                offset: 8,
            },
        ],
    }
}

/// Every shader file the renderer may load
pub fn shader_files() -> Vec<&'static str> {
    SHADING_MODELS
        .iter()
        .flat_map(|info| [info.vertex_shader, info.fragment_shader])
        .chain([POSTFX_SHADERS.0, POSTFX_SHADERS.1])
        .collect()
}

/// Forward pipeline together with the layouts it was built against
#[derive(Debug)]
pub struct ForwardPipeline {
    model: ShadingModel,
    counts: SceneCounts,
    scene_layout: BindingLayout,
    material_layout: BindingLayout,
    raw: RawPipeline,
}

impl ForwardPipeline {
    /// Build the forward pipeline for `model` in `render_pass`
    pub fn build<B: GpuBackend>(
        backend: &mut B,
        shaders: &mut ShaderCache,
        render_pass: RawRenderPass,
        model: ShadingModel,
        counts: SceneCounts,
    ) -> RenderResult<Self> {
        let info = model.info();
        let vertex_shader = shaders.get_or_load(backend, info.vertex_shader)?;
        let fragment_shader = shaders.get_or_load(backend, info.fragment_shader)?;

        let scene_layout = scene_layout(model, counts);
        let material_layout = model.material_layout();
        let raw = backend.create_pipeline(&PipelineDesc {
            render_pass,
            vertex_shader,
            fragment_shader,
            vertex_input: mesh_vertex_input(),
            set_layouts: vec![scene_layout.clone(), material_layout.clone()],
            push_constants: Some(PushConstantRange {
                stages: ShaderStages::VERTEX,
                size: PUSH_CONSTANT_SIZE,
            }),
            depth_test: true,
            cull_back_faces: true,
        })?;

        log::info!(
            "Built {:?} forward pipeline for {} cameras, {} lights",
            model,
            counts.cameras,
            counts.lights
        );
        Ok(Self {
            model,
            counts,
            scene_layout,
            material_layout,
            raw,
        })
    }

    /// Shading model
    pub const fn model(&self) -> ShadingModel {
        self.model
    }

    /// Array lengths of the scene layout
    pub const fn counts(&self) -> SceneCounts {
        self.counts
    }

    /// Set 0 layout
    pub const fn scene_layout(&self) -> &BindingLayout {
        &self.scene_layout
    }

    /// Set 1 layout
    pub const fn material_layout(&self) -> &BindingLayout {
        &self.material_layout
    }

    /// Backend pipeline
    pub const fn raw(&self) -> RawPipeline {
        self.raw
    }

    /// Destroy the pipeline
    pub fn destroy<B: GpuBackend>(&self, backend: &mut B) {
        backend.destroy_pipeline(self.raw);
    }
}

/// Build the postfx pipeline: one sampled input, no depth, no culling
pub fn build_postfx_pipeline<B: GpuBackend>(
    backend: &mut B,
    shaders: &mut ShaderCache,
    render_pass: RawRenderPass,
    input_layout: &BindingLayout,
) -> RenderResult<RawPipeline> {
    let vertex_shader = shaders.get_or_load(backend, POSTFX_SHADERS.0)?;
    let fragment_shader = shaders.get_or_load(backend, POSTFX_SHADERS.1)?;
    backend.create_pipeline(&PipelineDesc {
        render_pass,
        vertex_shader,
        fragment_shader,
        vertex_input: quad_vertex_input(),
        set_layouts: vec![input_layout.clone()],
        push_constants: None,
        depth_test: false,
        cull_back_faces: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::{AttachmentDesc, BindingKind, Format, ImageLayout, LoadOp, RenderPassDesc, StoreOp};
    use crate::render::backends::{stub_spirv, HeadlessBackend};
    use crate::render::RenderError;

    fn render_pass(backend: &mut HeadlessBackend) -> RawRenderPass {
        backend
            .create_render_pass(&RenderPassDesc {
                color: vec![AttachmentDesc {
                    format: Format::B8G8R8A8Unorm,
                    load: LoadOp::Clear,
                    store: StoreOp::Store,
                    initial_layout: ImageLayout::Undefined,
                    final_layout: ImageLayout::ColorAttachment,
                }],
                depth: None,
            })
            .unwrap()
    }

    #[test]
    fn test_table_entries_match_their_model() {
        for model in ShadingModel::ALL {
            assert_eq!(model.info().model, model);
        }
        assert_eq!(shader_files().len(), 8);
    }

    #[test]
    fn test_material_layouts_per_model() {
        let unlit = ShadingModel::Unlit.material_layout();
        assert_eq!(unlit.slots().len(), 1);

        let lit = ShadingModel::DefaultLit.material_layout();
        assert_eq!(lit.slots().len(), 2);
        assert_eq!(ShadingModel::DefaultLit.texture_binding(TextureSlot::Normal), Some(1));

        let pbr = ShadingModel::Pbr.material_layout();
        assert_eq!(pbr.slots().len(), 6);
        assert_eq!(pbr.slots()[0].kind, BindingKind::UniformBuffer);
        assert_eq!(ShadingModel::Pbr.texture_binding(TextureSlot::BaseColor), Some(1));
        assert_eq!(ShadingModel::Pbr.texture_binding(TextureSlot::Emissive), Some(5));
        assert_eq!(ShadingModel::Unlit.texture_binding(TextureSlot::Normal), None);
    }

    #[test]
    fn test_scene_layout_counts_are_at_least_one() {
        let counts = SceneCounts::new(0, 0);
        assert_eq!(counts, SceneCounts { cameras: 1, lights: 1 });

        let lit = scene_layout(ShadingModel::DefaultLit, SceneCounts::new(2, 3));
        assert_eq!(lit.slots().len(), 3);
        assert_eq!(lit.slots()[1].count, 2);
        assert_eq!(lit.slots()[2].count, 3);

        let unlit = scene_layout(ShadingModel::Unlit, SceneCounts::new(2, 3));
        assert_eq!(unlit.slots().len(), 2);
    }

    #[test]
    fn test_vertex_input_covers_stride() {
        let input = mesh_vertex_input();
        assert_eq!(input.stride, 44);
        assert_eq!(input.attributes.last().map(|a| a.offset), Some(32));
    }

    #[test]
    fn test_forward_pipeline_builds_from_preloaded_shaders() {
        let mut backend = HeadlessBackend::default();
        let mut shaders = ShaderCache::new("shaders");
        for name in shader_files() {
            shaders.preload(&mut backend, name, &stub_spirv()).unwrap();
        }
        let pass = render_pass(&mut backend);

        let pipeline =
            ForwardPipeline::build(&mut backend, &mut shaders, pass, ShadingModel::Pbr, SceneCounts::new(1, 4)).unwrap();
        assert_eq!(pipeline.counts().lights, 4);
        assert_eq!(pipeline.material_layout(), &ShadingModel::Pbr.material_layout());
        pipeline.destroy(&mut backend);
    }

    #[test]
    fn test_missing_shader_fails_pipeline_build() {
        let mut backend = HeadlessBackend::default();
        let mut shaders = ShaderCache::new("/nonexistent");
        let pass = render_pass(&mut backend);
        let err = ForwardPipeline::build(&mut backend, &mut shaders, pass, ShadingModel::Unlit, SceneCounts::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, RenderError::ShaderOrPipelineBuildFailure(_)));
    }
}
