//! Scene compilation
//!
//! Walks the node arena breadth-first from the root, resolving world
//! transforms (`parent_world * local`) and inherited visibility, and emits
//! the flat render list plus the camera and light uniform arrays for one
//! frame. Entries keep traversal order; nothing is sorted.

use std::collections::{HashSet, VecDeque};

use super::graph::{Attachment, NodeId, Scene};
use super::SceneError;
use crate::foundation::math::Mat4;
use crate::render::material::MaterialHandle;
use crate::render::mesh::PrimitiveSource;
use crate::render::resources::{BufferHandle, CameraUniform, LightUniform, SceneInfo};
use crate::render::RenderResult;

/// One primitive to draw this frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderListEntry {
    /// Node the mesh is attached to
    pub node: NodeId,
    /// Vertex buffer
    pub vertex_buffer: BufferHandle,
    /// Index buffer
    pub index_buffer: BufferHandle,
    /// First index
    pub first_index: u32,
    /// Index count
    pub index_count: u32,
    /// Material
    pub material: MaterialHandle,
    /// Object to world
    pub world: Mat4,
    /// False when the node or an ancestor is hidden
    pub visible: bool,
}

/// Output of [`compile`]
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledScene {
    /// Render list in traversal order
    pub entries: Vec<RenderListEntry>,
    /// Camera uniforms in traversal order
    pub cameras: Vec<CameraUniform>,
    /// Light uniforms in traversal order
    pub lights: Vec<LightUniform>,
    /// Scene-wide block
    pub info: SceneInfo,
}

impl CompiledScene {
    /// Entries that will actually be drawn
    pub fn visible_entries(&self) -> impl Iterator<Item = &RenderListEntry> {
        self.entries.iter().filter(|entry| entry.visible && entry.index_count > 0)
    }
}

/// Compile `scene` against uploaded meshes for a surface of `aspect` ratio
pub fn compile(scene: &Scene, meshes: &impl PrimitiveSource, aspect: f32) -> RenderResult<CompiledScene> {
    let mut entries = Vec::new();
    let mut cameras = Vec::new();
    let mut lights = Vec::new();

    let mut visited = HashSet::with_capacity(scene.nodes.len());
    let mut queue = VecDeque::from([(scene.root(), Mat4::identity(), true)]);

    while let Some((id, parent_world, parent_visible)) = queue.pop_front() {
        if !visited.insert(id) {
            return Err(SceneError::CycleDetected.into());
        }
        let node = scene.nodes.get(id).ok_or(SceneError::UnknownNode)?;
        let world = parent_world * node.local;
        let visible = parent_visible && node.visible;

        match &node.attachment {
            Some(Attachment::Mesh(mesh)) => {
                entries.extend(meshes.primitives(*mesh)?.iter().map(|primitive| RenderListEntry {
                    node: id,
                    vertex_buffer: primitive.vertex_buffer,
                    index_buffer: primitive.index_buffer,
                    first_index: primitive.first_index,
                    index_count: primitive.index_count,
                    material: primitive.material,
                    world,
                    visible,
                }));
            }
            Some(Attachment::Camera(camera)) => cameras.push(camera.uniform(&world, aspect)),
            Some(Attachment::Light(light)) => lights.push(light.uniform(&world)),
            None => {}
        }

        queue.extend(node.children.iter().map(|child| (*child, world, visible)));
    }

    let count = |len: usize| u32::try_from(len).unwrap_or(u32::MAX);
    let info = SceneInfo::new(scene.ambient(), count(cameras.len()), count(lights.len()));
    log::trace!(
        "Compiled scene: {} entries, {} cameras, {} lights",
        entries.len(),
        cameras.len(),
        lights.len()
    );
    Ok(CompiledScene {
        entries,
        cameras,
        lights,
        info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Quat, Transform, Vec3};
    use crate::render::mesh::{GpuPrimitive, MeshHandle};
    use crate::render::RenderError;
    use crate::scene::{Camera, Light};
    use approx::assert_relative_eq;
    use slotmap::SlotMap;
    use std::collections::HashMap;

    /// Mesh source that hands out fake buffer handles
    #[derive(Default)]
    struct FakeMeshes {
        meshes: SlotMap<MeshHandle, ()>,
        buffers: SlotMap<BufferHandle, ()>,
        materials: SlotMap<MaterialHandle, ()>,
        primitives: HashMap<MeshHandle, Vec<GpuPrimitive>>,
    }

    impl FakeMeshes {
        fn add(&mut self, primitive_count: usize) -> MeshHandle {
            let handle = self.meshes.insert(());
            let material = self.materials.insert(());
            let primitives = (0..primitive_count)
                .map(|index| GpuPrimitive {
                    vertex_buffer: self.buffers.insert(()),
                    index_buffer: self.buffers.insert(()),
                    first_index: 0,
                    index_count: 3 * (index as u32 + 1),
                    material,
                })
                .collect();
            self.primitives.insert(handle, primitives);
            handle
        }
    }

    impl PrimitiveSource for FakeMeshes {
        fn primitives(&self, mesh: MeshHandle) -> RenderResult<&[GpuPrimitive]> {
            self.primitives
                .get(&mesh)
                .map(Vec::as_slice)
                .ok_or(RenderError::StaleHandle { kind: "mesh" })
        }
    }

    #[test]
    fn test_world_is_product_of_chain() {
        let mut meshes = FakeMeshes::default();
        let mesh = meshes.add(1);
        let mut scene = Scene::new();

        let a = scene.add_node(scene.root()).unwrap();
        let b = scene.add_node(a).unwrap();
        let c = scene.add_node(b).unwrap();
        let leaf = scene.add_node(c).unwrap();

        let ta = Transform::from_position(Vec3::new(1.0, 0.0, 0.0));
        let tb = Transform::from_position_rotation(
            Vec3::new(0.0, 2.0, 0.0),
            Quat::from_axis_angle(&Vec3::z_axis(), std::f32::consts::FRAC_PI_2),
        );
        let tc = Transform::from_position(Vec3::new(0.0, 0.0, 3.0)).with_uniform_scale(2.0);
        let tleaf = Transform::from_position(Vec3::new(1.0, 0.0, 0.0));
        scene.set_transform(a, &ta).unwrap();
        scene.set_transform(b, &tb).unwrap();
        scene.set_transform(c, &tc).unwrap();
        scene.set_transform(leaf, &tleaf).unwrap();
        scene.attach(leaf, Attachment::Mesh(mesh)).unwrap();

        let compiled = compile(&scene, &meshes, 1.0).unwrap();
        assert_eq!(compiled.entries.len(), 1);

        let world = compiled.entries[0].world;
        let expected = ta.to_matrix() * tb.to_matrix() * tc.to_matrix() * tleaf.to_matrix();
        assert_relative_eq!(world, expected, epsilon = 1e-5);

        // Leaf origin by hand: (1,0,0) -> scale 2 -> (2,0,0) + (0,0,3)
        // -> rotate 90 about Z -> (0,2,3) + (0,2,0) -> (0,4,3) + (1,0,0)
        let origin = world.transform_point(&nalgebra::Point3::origin());
        assert_relative_eq!(origin.coords, Vec3::new(1.0, 4.0, 3.0), epsilon = 1e-5);
    }

    #[test]
    fn test_one_entry_per_reachable_primitive() {
        let mut meshes = FakeMeshes::default();
        let three = meshes.add(3);
        let two = meshes.add(2);
        let mut scene = Scene::new();

        let mut parent = scene.root();
        for depth in 0..6 {
            let node = scene.add_node(parent).unwrap();
            let mesh = if depth % 2 == 0 { three } else { two };
            scene.attach(node, Attachment::Mesh(mesh)).unwrap();
            let _empty = scene.add_node(node).unwrap();
            parent = node;
        }

        let compiled = compile(&scene, &meshes, 1.0).unwrap();
        assert_eq!(compiled.entries.len(), 3 * 3 + 3 * 2);
    }

    #[test]
    fn test_breadth_first_order() {
        let mut meshes = FakeMeshes::default();
        let mesh = meshes.add(1);
        let mut scene = Scene::new();
        let a = scene.add_node(scene.root()).unwrap();
        let deep = scene.add_node(a).unwrap();
        let b = scene.add_node(scene.root()).unwrap();
        for node in [a, deep, b] {
            scene.attach(node, Attachment::Mesh(mesh)).unwrap();
        }

        let order: Vec<NodeId> = compile(&scene, &meshes, 1.0)
            .unwrap()
            .entries
            .iter()
            .map(|entry| entry.node)
            .collect();
        assert_eq!(order, vec![a, b, deep]);
    }

    #[test]
    fn test_hidden_subtree_is_emitted_but_not_visible() {
        let mut meshes = FakeMeshes::default();
        let mesh = meshes.add(2);
        let mut scene = Scene::new();
        let group = scene.add_node(scene.root()).unwrap();
        let child = scene.add_node(group).unwrap();
        scene.attach(child, Attachment::Mesh(mesh)).unwrap();
        scene.set_visible(group, false).unwrap();

        let compiled = compile(&scene, &meshes, 1.0).unwrap();
        assert_eq!(compiled.entries.len(), 2);
        assert!(compiled.entries.iter().all(|entry| !entry.visible));
        assert_eq!(compiled.visible_entries().count(), 0);
    }

    #[test]
    fn test_cameras_and_lights_are_counted() {
        let meshes = FakeMeshes::default();
        let mut scene = Scene::new();
        let camera = scene.add_node(scene.root()).unwrap();
        scene.attach(camera, Attachment::Camera(Camera::default())).unwrap();
        for _ in 0..3 {
            let light = scene.add_node(scene.root()).unwrap();
            scene
                .attach(light, Attachment::Light(Light::new(Vec3::new(1.0, 1.0, 1.0))))
                .unwrap();
        }

        let compiled = compile(&scene, &meshes, 4.0 / 3.0).unwrap();
        assert_eq!(compiled.cameras.len(), 1);
        assert_eq!(compiled.lights.len(), 3);
        assert_eq!(compiled.info.camera_count, 1);
        assert_eq!(compiled.info.light_count, 3);
        assert_eq!(compiled.info.ambient, [0.2, 0.2, 0.2, 1.0]);
    }

    #[test]
    fn test_stale_mesh_fails_compile() {
        let mut meshes = FakeMeshes::default();
        let mesh = meshes.add(1);
        meshes.primitives.clear();
        let mut scene = Scene::new();
        let node = scene.add_node(scene.root()).unwrap();
        scene.attach(node, Attachment::Mesh(mesh)).unwrap();

        assert!(matches!(
            compile(&scene, &meshes, 1.0),
            Err(RenderError::StaleHandle { kind: "mesh" })
        ));
    }

    #[test]
    fn test_corrupted_links_are_detected() {
        let meshes = FakeMeshes::default();
        let mut scene = Scene::new();
        let a = scene.add_node(scene.root()).unwrap();
        let b = scene.add_node(a).unwrap();
        let root = scene.root();
        scene.nodes[b].children.push(a);
        scene.nodes[root].children.push(b);

        assert!(matches!(
            compile(&scene, &meshes, 1.0),
            Err(RenderError::Scene(SceneError::CycleDetected))
        ));
    }
}
