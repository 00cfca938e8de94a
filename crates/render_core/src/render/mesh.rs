//! Mesh data and GPU-resident meshes
//!
//! Loaders hand over [`MeshData`]; the [`MeshLibrary`] uploads every
//! primitive into device-local vertex and index buffers owned by the
//! resource arena. Index data is always `u32`.

use bytemuck::{Pod, Zeroable};
use slotmap::{new_key_type, SlotMap};

use crate::render::api::{BufferUsage, GpuBackend, MemoryLocality};
use crate::render::material::{MaterialData, MaterialHandle};
use crate::render::resources::{BufferHandle, ImageData};
use crate::render::{RenderDevice, RenderError, RenderResult};

new_key_type! {
    /// Mesh uploaded to the GPU
    pub struct MeshHandle;
}

/// Interleaved vertex: position, normal, uv, color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Texture coordinate
    pub uv: [f32; 2],
    /// Vertex color
    pub color: [f32; 3],
}

impl Vertex {
    /// Bytes per vertex
    pub const STRIDE: u32 = 44;

    /// White vertex facing +Z
    pub const fn new(position: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal: [0.0, 0.0, 1.0],
            uv,
            color: [1.0, 1.0, 1.0],
        }
    }
}

/// One drawable piece of a mesh
#[derive(Debug, Clone, Default)]
pub struct PrimitiveData {
    /// Vertices
    pub vertices: Vec<Vertex>,
    /// Indices into `vertices`; `None` draws the vertices in order
    pub indices: Option<Vec<u32>>,
    /// Index into [`ModelData::materials`]
    pub material: Option<usize>,
}

/// Mesh as produced by a loader
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    /// Debug name
    pub name: String,
    /// Primitives in draw order
    pub primitives: Vec<PrimitiveData>,
}

impl MeshData {
    /// Cube spanning -1..1 on every axis with one flat-shaded quad per face
    ///
    /// 24 vertices, 36 indices, counter-clockwise winding seen from outside.
    pub fn cube(name: impl Into<String>, material: Option<usize>) -> Self {
        // (normal, u, v) with u x v = normal
        const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];
        const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in FACES {
            let base = vertices.len() as u32;
            for (s, t) in CORNERS {
                let position = [0, 1, 2].map(|axis| normal[axis] + s * u[axis] + t * v[axis]);
                vertices.push(Vertex {
                    position,
                    normal,
                    uv: [(s + 1.0) * 0.5, (1.0 - t) * 0.5],
                    color: [1.0, 1.0, 1.0],
                });
            }
            indices.extend([0, 1, 2, 2, 3, 0].map(|offset| base + offset));
        }

        Self {
            name: name.into(),
            primitives: vec![PrimitiveData {
                vertices,
                indices: Some(indices),
                material,
            }],
        }
    }
}

/// Loader hand-off: meshes plus the materials and textures they reference
#[derive(Debug, Clone, Default)]
pub struct ModelData {
    /// Meshes
    pub meshes: Vec<MeshData>,
    /// Materials, referenced by [`PrimitiveData::material`]
    pub materials: Vec<MaterialData>,
    /// Decoded textures, referenced by [`MaterialData`] texture indices
    pub textures: Vec<ImageData>,
}

/// GPU buffers of one primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuPrimitive {
    /// Vertex buffer
    pub vertex_buffer: BufferHandle,
    /// `u32` index buffer
    pub index_buffer: BufferHandle,
    /// First index to draw
    pub first_index: u32,
    /// Indices to draw; zero for empty primitives
    pub index_count: u32,
    /// Material
    pub material: MaterialHandle,
}

/// Uploaded mesh
#[derive(Debug, Clone)]
pub struct GpuMesh {
    name: String,
    primitives: Vec<GpuPrimitive>,
}

impl GpuMesh {
    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primitives in draw order
    pub fn primitives(&self) -> &[GpuPrimitive] {
        &self.primitives
    }
}

/// Read access to uploaded primitives
pub trait PrimitiveSource {
    /// Primitives of `mesh`, or [`RenderError::StaleHandle`]
    fn primitives(&self, mesh: MeshHandle) -> RenderResult<&[GpuPrimitive]>;
}

/// Meshes uploaded to device-local memory
#[derive(Debug, Default)]
pub struct MeshLibrary {
    meshes: SlotMap<MeshHandle, GpuMesh>,
}

impl MeshLibrary {
    /// Create an empty library
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload `data`; `materials` resolves primitive material indices
    ///
    /// Primitives without a material, or whose index is out of range, use
    /// `fallback`. Blocks on the staging copies.
    pub fn upload<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        data: &MeshData,
        materials: &[MaterialHandle],
        fallback: MaterialHandle,
    ) -> RenderResult<MeshHandle> {
        let mut primitives = Vec::with_capacity(data.primitives.len());
        for primitive in &data.primitives {
            let material = primitive
                .material
                .and_then(|index| materials.get(index).copied())
                .unwrap_or(fallback);
            match upload_primitive(device, primitive, material) {
                Ok(uploaded) => primitives.push(uploaded),
                Err(err) => {
                    for uploaded in primitives {
                        release_primitive(device, &uploaded, true);
                    }
                    return Err(err);
                }
            }
        }

        log::debug!("Uploaded mesh '{}' with {} primitives", data.name, primitives.len());
        Ok(self.meshes.insert(GpuMesh {
            name: data.name.clone(),
            primitives,
        }))
    }

    /// Look up a mesh
    pub fn get(&self, handle: MeshHandle) -> RenderResult<&GpuMesh> {
        self.meshes.get(handle).ok_or(RenderError::StaleHandle { kind: "mesh" })
    }

    /// Remove a mesh; its buffers are released once in-flight frames retire
    pub fn remove<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>, handle: MeshHandle) -> RenderResult<()> {
        let mesh = self.meshes.remove(handle).ok_or(RenderError::StaleHandle { kind: "mesh" })?;
        for primitive in &mesh.primitives {
            release_primitive(device, primitive, false);
        }
        Ok(())
    }

    /// Number of meshes
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    /// Whether the library is empty
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Forget every mesh; the arena releases the buffers at teardown
    pub fn clear(&mut self) {
        self.meshes.clear();
    }
}

impl PrimitiveSource for MeshLibrary {
    fn primitives(&self, mesh: MeshHandle) -> RenderResult<&[GpuPrimitive]> {
        self.get(mesh).map(GpuMesh::primitives)
    }
}

fn upload_primitive<B: GpuBackend>(
    device: &mut RenderDevice<B>,
    primitive: &PrimitiveData,
    material: MaterialHandle,
) -> RenderResult<GpuPrimitive> {
    let vertex_count = u32::try_from(primitive.vertices.len())
        .map_err(|_| RenderError::InvalidArgument("too many vertices in primitive".to_string()))?;
    let indices: Vec<u32> = match &primitive.indices {
        Some(indices) => {
            if let Some(bad) = indices.iter().find(|index| **index >= vertex_count) {
                return Err(RenderError::InvalidArgument(format!(
                    "index {bad} out of range for {vertex_count} vertices"
                )));
            }
            indices.clone()
        }
        None => (0..vertex_count).collect(),
    };
    let index_count = u32::try_from(indices.len())
        .map_err(|_| RenderError::InvalidArgument("too many indices in primitive".to_string()))?;

    // Empty primitives keep one element of backing so every entry has buffers
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&primitive.vertices);
    let vertex_size = (vertex_bytes.len() as u64).max(u64::from(Vertex::STRIDE));
    let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
    let index_size = (index_bytes.len() as u64).max(4);

    let vertex_buffer = device.create_buffer(
        vertex_size,
        BufferUsage::VERTEX,
        MemoryLocality::DeviceLocal,
        Some(vertex_bytes),
    )?;
    let index_buffer =
        match device.create_buffer(index_size, BufferUsage::INDEX, MemoryLocality::DeviceLocal, Some(index_bytes)) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.arena.destroy_immediate(&mut device.backend, vertex_buffer)?;
                return Err(err);
            }
        };

    Ok(GpuPrimitive {
        vertex_buffer,
        index_buffer,
        first_index: 0,
        index_count,
        material,
    })
}

fn release_primitive<B: GpuBackend>(device: &mut RenderDevice<B>, primitive: &GpuPrimitive, immediate: bool) {
    for buffer in [primitive.vertex_buffer, primitive.index_buffer] {
        let result = if immediate {
            device.arena.destroy_immediate(&mut device.backend, buffer)
        } else {
            device.arena.destroy(buffer)
        };
        if let Err(err) = result {
            log::warn!("Releasing mesh buffer failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::testing::headless_device;
    use slotmap::SlotMap;

    fn triangle() -> Vec<Vertex> {
        vec![
            Vertex::new([0.0, 0.5, 0.0], [0.5, 0.0]),
            Vertex::new([-0.5, -0.5, 0.0], [0.0, 1.0]),
            Vertex::new([0.5, -0.5, 0.0], [1.0, 1.0]),
        ]
    }

    fn material_key() -> MaterialHandle {
        let mut keys: SlotMap<MaterialHandle, ()> = SlotMap::with_key();
        keys.insert(())
    }

    #[test]
    fn test_vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), Vertex::STRIDE as usize);
    }

    #[test]
    fn test_missing_indices_become_sequential() {
        let mut device = headless_device();
        let mut library = MeshLibrary::new();
        let data = MeshData {
            name: "tri".to_string(),
            primitives: vec![PrimitiveData {
                vertices: triangle(),
                indices: None,
                material: None,
            }],
        };

        let handle = library.upload(&mut device, &data, &[], material_key()).unwrap();
        let primitive = library.get(handle).unwrap().primitives()[0];
        assert_eq!(primitive.index_count, 3);

        let indices = device.read_buffer(primitive.index_buffer).unwrap();
        assert_eq!(indices, bytemuck::cast_slice::<u32, u8>(&[0, 1, 2]).to_vec());
        let vertices = device.read_buffer(primitive.vertex_buffer).unwrap();
        assert_eq!(vertices, bytemuck::cast_slice::<Vertex, u8>(&triangle()).to_vec());
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let mut device = headless_device();
        let mut library = MeshLibrary::new();
        let data = MeshData {
            name: "broken".to_string(),
            primitives: vec![PrimitiveData {
                vertices: triangle(),
                indices: Some(vec![0, 1, 3]),
                material: None,
            }],
        };
        assert!(matches!(
            library.upload(&mut device, &data, &[], material_key()),
            Err(RenderError::InvalidArgument(_))
        ));
        assert_eq!(device.arena.live_counts().0, 0);
    }

    #[test]
    fn test_empty_primitive_has_zero_index_count() {
        let mut device = headless_device();
        let mut library = MeshLibrary::new();
        let data = MeshData {
            name: "empty".to_string(),
            primitives: vec![PrimitiveData::default()],
        };
        let handle = library.upload(&mut device, &data, &[], material_key()).unwrap();
        assert_eq!(library.get(handle).unwrap().primitives()[0].index_count, 0);
    }

    #[test]
    fn test_removed_mesh_is_stale_and_buffers_deferred() {
        let mut device = headless_device();
        let mut library = MeshLibrary::new();
        let data = MeshData {
            name: "tri".to_string(),
            primitives: vec![PrimitiveData {
                vertices: triangle(),
                indices: None,
                material: None,
            }],
        };
        let handle = library.upload(&mut device, &data, &[], material_key()).unwrap();
        device.arena.begin_frame(4);
        library.remove(&mut device, handle).unwrap();

        assert!(matches!(library.primitives(handle), Err(RenderError::StaleHandle { .. })));
        assert_eq!(device.arena.pending_release_count(), 2);
        assert_eq!(device.arena.release_retired(&mut device.backend, Some(3)), 0);
        assert_eq!(device.arena.release_retired(&mut device.backend, Some(4)), 2);
    }

    #[test]
    fn test_cube_faces_point_outward() {
        let cube = MeshData::cube("cube", Some(0));
        let primitive = &cube.primitives[0];
        let indices = primitive.indices.as_ref().unwrap();
        assert_eq!(primitive.vertices.len(), 24);
        assert_eq!(indices.len(), 36);

        for triangle in indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| nalgebra::Vector3::from(primitive.vertices[triangle[i] as usize].position));
            let face_normal = (b - a).cross(&(c - a));
            let stored = nalgebra::Vector3::from(primitive.vertices[triangle[0] as usize].normal);
            assert!(face_normal.dot(&stored) > 0.0);
        }
    }
}
