//! Render pass graph
//!
//! Passes declare the images they write (with the layout they leave them in)
//! and the images they sample. Layout transitions between passes are derived
//! from those declarations once, when the graph is built, and replayed every
//! frame in declaration order.
//!
//! The graph is fixed at two passes:
//!
//! ```text
//! forward  writes ForwardColor (ColorAttachment), ForwardDepth (DepthStencilAttachment)
//!    │
//!    │  ForwardColor: ColorAttachment ─▶ ShaderReadOnly
//!    ▼
//! postfx   samples ForwardColor, writes Surface (PresentSrc)
//! ```
//!
//! # Surface-sized state
//!
//! Framebuffers and postfx input sets exist once per swapchain image and
//! hold views of the current [`SurfaceTargets`]. On resize the orchestrator
//! waits for the device, calls [`RenderGraph::release_targets`], rebuilds the
//! targets and hands them back through [`RenderGraph::attach_targets`].
//! Pipelines and render passes survive a resize. The forward pipeline is
//! only rebuilt when the scene's camera or light count changes the scene
//! binding layout.

use crate::render::api::{
    Extent2D, GpuBackend, ImageAspect, ImageBarrier, ImageLayout, RawDescriptorSet, RawImage,
};
use crate::render::commands::RecordingSession;
use crate::render::passes::forward::{DrawItem, ForwardPass};
use crate::render::passes::postfx::PostFxPass;
use crate::render::passes::targets::SurfaceTargets;
use crate::render::pipeline::{SceneCounts, ShadingModel};
use crate::render::{RenderDevice, RenderError, RenderResult};

/// Images the graph routes between passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphImage {
    /// Offscreen color written by the forward pass
    ForwardColor,
    /// Forward depth
    ForwardDepth,
    /// Acquired swapchain image
    Surface,
}

impl GraphImage {
    const fn aspect(self) -> ImageAspect {
        match self {
            Self::ForwardDepth => ImageAspect::Depth,
            Self::ForwardColor | Self::Surface => ImageAspect::Color,
        }
    }
}

/// An image a pass writes and the layout it leaves it in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageWrite {
    /// Image
    pub image: GraphImage,
    /// Layout after the pass
    pub final_layout: ImageLayout,
}

/// What one pass reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassDeclaration {
    /// Debug name
    pub name: &'static str,
    /// Written images
    pub writes: Vec<ImageWrite>,
    /// Images sampled in fragment shaders
    pub samples: Vec<GraphImage>,
}

/// A barrier recorded before a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Index of the pass the barrier precedes
    pub before_pass: usize,
    /// Image
    pub image: GraphImage,
    /// Layout the previous writer left it in
    pub from: ImageLayout,
    /// Layout the reader needs
    pub to: ImageLayout,
}

/// Derive the barriers implied by `passes`
///
/// Sampling an image that no earlier pass writes is an error.
pub fn derive_transitions(passes: &[PassDeclaration]) -> RenderResult<Vec<Transition>> {
    let mut layouts: Vec<(GraphImage, ImageLayout)> = Vec::new();
    let mut transitions = Vec::new();

    for (index, pass) in passes.iter().enumerate() {
        for sampled in &pass.samples {
            let Some(entry) = layouts.iter_mut().find(|(image, _)| image == sampled) else {
                return Err(RenderError::invalid_operation(format!(
                    "pass '{}' samples {sampled:?} before any pass writes it",
                    pass.name
                )));
            };
            if entry.1 != ImageLayout::ShaderReadOnly {
                transitions.push(Transition {
                    before_pass: index,
                    image: *sampled,
                    from: entry.1,
                    to: ImageLayout::ShaderReadOnly,
                });
                entry.1 = ImageLayout::ShaderReadOnly;
            }
        }
        for write in &pass.writes {
            match layouts.iter_mut().find(|(image, _)| *image == write.image) {
                Some(entry) => entry.1 = write.final_layout,
                None => layouts.push((write.image, write.final_layout)),
            }
        }
    }
    Ok(transitions)
}

/// Per-frame inputs of the graph
#[derive(Debug, Clone, Copy)]
pub struct GraphFrame<'a> {
    /// Acquired swapchain image
    pub image_index: usize,
    /// Set 0 of the forward pass
    pub scene_set: RawDescriptorSet,
    /// Forward draws
    pub draws: &'a [DrawItem],
}

/// The forward pass followed by the postfx pass
#[derive(Debug)]
pub struct RenderGraph {
    forward: ForwardPass,
    postfx: PostFxPass,
    transitions: Vec<Transition>,
    extent: Extent2D,
    forward_color: Vec<RawImage>,
    forward_depth: Vec<RawImage>,
    surface: Vec<RawImage>,
}

impl RenderGraph {
    /// Build both passes against `targets`
    pub fn new<B: GpuBackend>(
        device: &mut RenderDevice<B>,
        targets: &SurfaceTargets,
        model: ShadingModel,
        counts: SceneCounts,
        clear_color: [f32; 4],
    ) -> RenderResult<Self> {
        let transitions = derive_transitions(&[ForwardPass::declaration(), PostFxPass::declaration()])?;
        let mut forward = ForwardPass::new(device, targets, model, counts, clear_color)?;
        let postfx = match PostFxPass::new(device, targets) {
            Ok(postfx) => postfx,
            Err(err) => {
                forward.destroy(device);
                return Err(err);
            }
        };
        log::debug!("Render graph built with {} derived transitions", transitions.len());

        let mut graph = Self {
            forward,
            postfx,
            transitions,
            extent: targets.extent(),
            forward_color: Vec::new(),
            forward_depth: Vec::new(),
            surface: Vec::new(),
        };
        graph.cache_images(targets);
        Ok(graph)
    }

    fn cache_images(&mut self, targets: &SurfaceTargets) {
        self.extent = targets.extent();
        self.forward_color = targets.color().iter().map(|a| a.image).collect();
        self.forward_depth = targets.depth().iter().map(|a| a.image).collect();
        self.surface = targets.swapchain_images().to_vec();
    }

    /// Barriers replayed each frame
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Forward pass
    pub const fn forward(&self) -> &ForwardPass {
        &self.forward
    }

    /// Postfx pass
    pub const fn postfx(&self) -> &PostFxPass {
        &self.postfx
    }

    /// Record every pass for one frame
    ///
    /// Returns the number of forward draws recorded.
    pub fn record(&self, session: &mut RecordingSession<'_>, frame: &GraphFrame<'_>) -> RenderResult<usize> {
        self.record_transitions(session, 0, frame.image_index)?;
        let draws = self
            .forward
            .record(session, frame.image_index, self.extent, frame.scene_set, frame.draws)?;
        self.record_transitions(session, 1, frame.image_index)?;
        self.postfx.record(session, frame.image_index, self.extent)?;
        Ok(draws)
    }

    fn record_transitions(
        &self,
        session: &mut RecordingSession<'_>,
        pass: usize,
        image_index: usize,
    ) -> RenderResult<()> {
        for transition in self.transitions.iter().filter(|t| t.before_pass == pass) {
            let images = match transition.image {
                GraphImage::ForwardColor => &self.forward_color,
                GraphImage::ForwardDepth => &self.forward_depth,
                GraphImage::Surface => &self.surface,
            };
            let image = images.get(image_index).copied().ok_or_else(|| {
                RenderError::InvalidArgument(format!("swapchain image {image_index} has no {:?}", transition.image))
            })?;
            session.image_barrier(ImageBarrier {
                image,
                aspect: transition.image.aspect(),
                old_layout: transition.from,
                new_layout: transition.to,
                base_mip: 0,
                mip_count: 1,
            });
        }
        Ok(())
    }

    /// Drop everything tied to the current surface; the device must be idle
    pub fn release_targets<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) {
        self.forward.release_framebuffers(device);
        self.postfx.release_targets(device);
        self.forward_color.clear();
        self.forward_depth.clear();
        self.surface.clear();
    }

    /// Rebuild framebuffers and input sets for new targets
    pub fn attach_targets<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        targets: &SurfaceTargets,
    ) -> RenderResult<()> {
        self.forward.create_framebuffers(device, targets)?;
        self.postfx.create_targets(device, targets)?;
        self.cache_images(targets);
        Ok(())
    }

    /// Rebuild the forward pipeline for new scene counts; the device must be idle
    pub fn rebuild_forward_pipeline<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        counts: SceneCounts,
    ) -> RenderResult<()> {
        self.forward.rebuild_pipeline(device, counts)
    }

    /// Destroy both passes; the device must be idle
    pub fn destroy<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) {
        self.release_targets(device);
        self.forward.destroy(device);
        self.postfx.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_color_is_made_readable_before_postfx() {
        let transitions = derive_transitions(&[ForwardPass::declaration(), PostFxPass::declaration()]).unwrap();
        assert_eq!(
            transitions,
            vec![Transition {
                before_pass: 1,
                image: GraphImage::ForwardColor,
                from: ImageLayout::ColorAttachment,
                to: ImageLayout::ShaderReadOnly,
            }]
        );
    }

    #[test]
    fn test_sampling_unwritten_image_is_rejected() {
        let err = derive_transitions(&[PostFxPass::declaration()]).unwrap_err();
        assert!(matches!(err, RenderError::InvalidOperation { .. }));
    }

    #[test]
    fn test_already_readable_image_needs_no_barrier() {
        let passes = [
            PassDeclaration {
                name: "bake",
                writes: vec![ImageWrite {
                    image: GraphImage::ForwardColor,
                    final_layout: ImageLayout::ShaderReadOnly,
                }],
                samples: Vec::new(),
            },
            PassDeclaration {
                name: "read",
                writes: Vec::new(),
                samples: vec![GraphImage::ForwardColor],
            },
        ];
        assert!(derive_transitions(&passes).unwrap().is_empty());
    }
}
