//! End-to-end frame loop tests on the headless backend

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::core::RendererConfig;
    use crate::foundation::math::{Transform, Vec3};
    use crate::render::api::{Command, Extent2D, ImageLayout};
    use crate::render::backends::HeadlessBackend;
    use crate::render::material::MaterialData;
    use crate::render::mesh::{MeshData, MeshHandle, ModelData};
    use crate::render::pipeline::{SceneCounts, ShadingModel, TextureSlot};
    use crate::render::resources::ImageData;
    use crate::render::testing::headless_orchestrator;
    use crate::scene::{Attachment, Camera, Light, NodeId, Scene};

    fn textured_cube() -> ModelData {
        ModelData {
            meshes: vec![MeshData::cube("cube", Some(0))],
            materials: vec![MaterialData {
                name: "checker".to_string(),
                base_color_texture: Some(0),
                ..MaterialData::default()
            }],
            textures: vec![ImageData::solid(8, 8, [200, 40, 40, 255])],
        }
    }

    /// Camera at +Z looking at the origin, one light, one mesh node
    fn lit_scene(mesh: MeshHandle) -> (Scene, NodeId) {
        let mut scene = Scene::new();
        let root = scene.root();

        let camera = scene.add_node(root).unwrap();
        scene
            .set_transform(camera, &Transform::from_position(Vec3::new(0.0, 0.0, 6.0)))
            .unwrap();
        scene.attach(camera, Attachment::Camera(Camera::default())).unwrap();

        let light = scene.add_node(root).unwrap();
        scene.attach(light, Attachment::Light(Light::new(Vec3::new(1.0, 1.0, 1.0)))).unwrap();

        let node = scene.add_node(root).unwrap();
        scene.attach(node, Attachment::Mesh(mesh)).unwrap();
        (scene, node)
    }

    fn loaded(config: RendererConfig) -> (FrameOrchestrator<HeadlessBackend>, MeshHandle) {
        let mut renderer = headless_orchestrator(config);
        let meshes = renderer.load_model(&textured_cube()).unwrap();
        (renderer, meshes[0])
    }

    fn presented(outcome: FrameOutcome) -> bool {
        matches!(outcome, FrameOutcome::Presented { .. })
    }

    fn assert_clean(renderer: &mut FrameOrchestrator<HeadlessBackend>) {
        renderer.device_mut().wait_idle().unwrap();
        let errors = renderer.device().backend().validation_errors();
        assert!(errors.is_empty(), "validation errors: {errors:#?}");
    }

    #[test]
    fn test_frames_render_without_validation_errors() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);

        for frame in 0..6 {
            match renderer.render_frame(&scene).unwrap() {
                FrameOutcome::Presented { slot, draws, .. } => {
                    assert_eq!(slot, frame % 2);
                    assert_eq!(draws, 1);
                }
                other => panic!("frame {frame} skipped: {other:?}"),
            }
        }
        assert_eq!(renderer.frame_number(), 6);
        assert_clean(&mut renderer);

        let stats = renderer.device().backend().stats();
        assert_eq!(stats.presents, 6);
        assert_eq!(stats.draws, 6 * 2);
    }

    #[test]
    fn test_forward_color_is_readable_before_postfx_samples_it() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        renderer.device_mut().wait_idle().unwrap();
        renderer.device_mut().backend_mut().clear_trace();

        renderer.render_frame(&scene).unwrap();
        renderer.device_mut().wait_idle().unwrap();

        let color_images: Vec<_> = renderer.targets().color().iter().map(|a| a.image).collect();
        let trace = renderer.device().backend().trace();
        let barrier = trace
            .iter()
            .position(|entry| {
                matches!(&entry.command, Command::ImageBarrier(b)
                    if b.new_layout == ImageLayout::ShaderReadOnly && color_images.contains(&b.image))
            })
            .expect("forward color transition recorded");
        let postfx_draw = trace
            .iter()
            .position(|entry| matches!(entry.command, Command::Draw { vertex_count: 6, .. }))
            .expect("postfx quad draw recorded");
        let forward_draw = trace
            .iter()
            .position(|entry| matches!(entry.command, Command::DrawIndexed { index_count: 36, .. }))
            .expect("cube draw recorded");

        assert!(forward_draw < barrier);
        assert!(barrier < postfx_draw);
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_resize_rebuilds_every_surface_resource() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        for _ in 0..3 {
            assert!(presented(renderer.render_frame(&scene).unwrap()));
        }
        let mut old_framebuffers = renderer.graph().forward().framebuffers().to_vec();
        old_framebuffers.extend_from_slice(renderer.graph().postfx().framebuffers());
        let old_color: Vec<_> = renderer.targets().color().iter().map(|a| a.image).collect();

        let large = Extent2D::new(1920, 1080);
        renderer.device_mut().backend_mut().resize_surface(large);
        assert_eq!(
            renderer.render_frame(&scene).unwrap(),
            FrameOutcome::Skipped(SkipReason::SurfaceOutOfDate)
        );
        for _ in 0..2 {
            assert!(presented(renderer.render_frame(&scene).unwrap()));
        }

        assert_eq!(renderer.targets().extent(), large);
        let backend = renderer.device().backend();
        for attachment in renderer.targets().color().iter().chain(renderer.targets().depth()) {
            assert_eq!(backend.image_extent(attachment.image), Some(large));
        }
        assert_eq!(backend.swapchain_state().map(|(_, extent, _)| extent), Some(large));

        for cb in renderer.slot_command_buffers() {
            for command in renderer.device().recorder().commands(*cb).unwrap() {
                match command {
                    Command::BeginRenderPass { framebuffer, extent, .. } => {
                        assert!(!old_framebuffers.contains(framebuffer));
                        assert_eq!(*extent, large);
                    }
                    Command::ImageBarrier(barrier) => assert!(!old_color.contains(&barrier.image)),
                    _ => {}
                }
            }
        }
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_single_out_of_date_skips_one_frame() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        assert!(presented(renderer.render_frame(&scene).unwrap()));
        let created = renderer.device().backend().stats().swapchains_created;

        renderer.device_mut().backend_mut().inject_acquire_failures(1);
        assert_eq!(
            renderer.render_frame(&scene).unwrap(),
            FrameOutcome::Skipped(SkipReason::SurfaceOutOfDate)
        );
        assert!(presented(renderer.render_frame(&scene).unwrap()));
        assert_eq!(renderer.device().backend().stats().swapchains_created, created + 1);
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_persistent_out_of_date_is_surfaced() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);

        renderer.device_mut().backend_mut().inject_acquire_failures(2);
        assert_eq!(
            renderer.render_frame(&scene).unwrap(),
            FrameOutcome::Skipped(SkipReason::SurfaceOutOfDate)
        );
        assert!(matches!(renderer.render_frame(&scene), Err(RenderError::SurfaceOutOfDate)));

        // The session continues once the surface settles.
        assert!(presented(renderer.render_frame(&scene).unwrap()));
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_steady_state_frames_never_wait_for_queue_idle() {
        let (mut renderer, mesh) = loaded(RendererConfig::default().with_frames_in_flight(3));
        let (scene, _) = lit_scene(mesh);
        for _ in 0..3 {
            renderer.render_frame(&scene).unwrap();
        }
        let before = renderer.device().backend().stats();

        for _ in 0..30 {
            assert!(presented(renderer.render_frame(&scene).unwrap()));
        }
        let after = renderer.device().backend().stats();
        assert_eq!(after.queue_idle_waits, before.queue_idle_waits);
        assert_eq!(after.submissions, before.submissions + 30);
    }

    #[test]
    fn test_removed_mesh_outlives_in_flight_frames() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (mut scene, node) = lit_scene(mesh);
        for _ in 0..2 {
            renderer.render_frame(&scene).unwrap();
        }

        scene.detach(node).unwrap();
        renderer.remove_mesh(mesh).unwrap();
        assert_eq!(renderer.device().arena().pending_release_count(), 2);

        for _ in 0..3 {
            match renderer.render_frame(&scene).unwrap() {
                FrameOutcome::Presented { draws, .. } => assert_eq!(draws, 0),
                other => panic!("frame skipped: {other:?}"),
            }
        }
        assert_eq!(renderer.device().arena().pending_release_count(), 0);
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_texture_hot_swap_reaches_every_slot() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        for _ in 0..2 {
            renderer.render_frame(&scene).unwrap();
        }

        let material = renderer.meshes().get(mesh).unwrap().primitives()[0].material;
        let replacement = renderer.create_texture(&ImageData::solid(16, 16, [0, 0, 255, 255])).unwrap();
        renderer
            .set_material_texture(material, TextureSlot::BaseColor, replacement)
            .unwrap();

        for _ in 0..4 {
            assert!(presented(renderer.render_frame(&scene).unwrap()));
        }
        assert_eq!(
            renderer.materials().texture_of(material, TextureSlot::BaseColor),
            Some(replacement)
        );
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_more_lights_rebuild_scene_bindings() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (mut scene, _) = lit_scene(mesh);
        renderer.render_frame(&scene).unwrap();
        assert_eq!(renderer.uniforms().counts(), SceneCounts::new(1, 1));

        for _ in 0..2 {
            let light = scene.add_node(scene.root()).unwrap();
            scene.attach(light, Attachment::Light(Light::new(Vec3::new(0.5, 0.5, 0.5)))).unwrap();
        }
        assert!(presented(renderer.render_frame(&scene).unwrap()));
        assert!(presented(renderer.render_frame(&scene).unwrap()));

        assert_eq!(renderer.uniforms().counts(), SceneCounts::new(1, 3));
        assert_eq!(renderer.graph().forward().pipeline().counts(), SceneCounts::new(1, 3));
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_hidden_nodes_are_not_drawn() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (mut scene, node) = lit_scene(mesh);
        let second = scene.add_node(scene.root()).unwrap();
        scene.attach(second, Attachment::Mesh(mesh)).unwrap();
        scene.set_visible(node, false).unwrap();

        match renderer.render_frame(&scene).unwrap() {
            FrameOutcome::Presented { draws, .. } => assert_eq!(draws, 1),
            other => panic!("frame skipped: {other:?}"),
        }
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_unlit_model_renders() {
        let (mut renderer, mesh) = loaded(RendererConfig::default().with_shading_model(ShadingModel::Unlit));
        let (scene, _) = lit_scene(mesh);
        for _ in 0..3 {
            assert!(presented(renderer.render_frame(&scene).unwrap()));
        }
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_minimized_surface_skips_frames() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        renderer.render_frame(&scene).unwrap();

        renderer.device_mut().backend_mut().resize_surface(Extent2D::new(0, 0));
        assert_eq!(
            renderer.render_frame(&scene).unwrap(),
            FrameOutcome::Skipped(SkipReason::SurfaceMinimized)
        );
        let frames = renderer.frame_number();

        renderer.device_mut().backend_mut().resize_surface(Extent2D::new(1024, 768));
        assert_eq!(
            renderer.render_frame(&scene).unwrap(),
            FrameOutcome::Skipped(SkipReason::SurfaceOutOfDate)
        );
        assert!(presented(renderer.render_frame(&scene).unwrap()));
        assert_eq!(renderer.frame_number(), frames + 1);
        assert_eq!(renderer.targets().extent(), Extent2D::new(1024, 768));
    }

    #[test]
    fn test_device_loss_is_fatal() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        renderer.render_frame(&scene).unwrap();

        renderer.device_mut().backend_mut().lose_device();
        let err = renderer.render_frame(&scene).unwrap_err();
        assert!(matches!(err, RenderError::DeviceLost));
        assert_eq!(err.severity(), ErrorSeverity::Session);
    }

    #[test]
    fn test_stale_buffer_drops_frame_before_acquire() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (mut scene, node) = lit_scene(mesh);
        renderer.render_frame(&scene).unwrap();

        let vertex_buffer = renderer.meshes().get(mesh).unwrap().primitives()[0].vertex_buffer;
        renderer.device_mut().destroy(vertex_buffer).unwrap();
        assert!(matches!(
            renderer.render_frame(&scene),
            Err(RenderError::StaleHandle { kind: "buffer" })
        ));

        scene.detach(node).unwrap();
        for frame in 0..8 {
            let outcome = renderer.render_frame(&scene).unwrap();
            assert!(presented(outcome), "frame {frame}: {outcome:?}");
        }
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_failed_submit_hands_the_image_back() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        renderer.render_frame(&scene).unwrap();

        renderer.device_mut().backend_mut().inject_submit_failures(1);
        assert!(matches!(
            renderer.render_frame(&scene),
            Err(RenderError::ResourceExhausted(_))
        ));

        // More frames than swapchain images, so a leaked image would surface.
        for frame in 0..8 {
            let outcome = renderer.render_frame(&scene).unwrap();
            assert!(presented(outcome), "frame {frame}: {outcome:?}");
        }
        assert_clean(&mut renderer);
        assert_eq!(renderer.frame_number(), 10);
        assert_eq!(renderer.device().backend().stats().presents, 10);
    }

    #[test]
    fn test_removed_texture_is_released_after_frames_retire() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        let texture = renderer.create_texture(&ImageData::solid(4, 4, [0, 255, 0, 255])).unwrap();
        renderer.render_frame(&scene).unwrap();

        renderer.remove_texture(texture).unwrap();
        assert!(matches!(
            renderer.remove_texture(texture),
            Err(RenderError::StaleHandle { kind: "texture" })
        ));
        for _ in 0..4 {
            assert!(presented(renderer.render_frame(&scene).unwrap()));
        }
        assert_clean(&mut renderer);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (mut renderer, mesh) = loaded(RendererConfig::default());
        let (scene, _) = lit_scene(mesh);
        for _ in 0..3 {
            renderer.render_frame(&scene).unwrap();
        }

        renderer.shutdown();
        let (buffers, images, views, sets) = renderer.device().backend().live_objects();
        assert_eq!((buffers, images, views, sets), (0, 0, 0, 0));
        assert!(renderer.device().backend().validation_errors().is_empty());
        assert!(matches!(
            renderer.render_frame(&scene),
            Err(RenderError::InvalidOperation { .. })
        ));
    }
}
