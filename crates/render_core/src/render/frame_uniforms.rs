//! Per-slot scene uniform storage
//!
//! Each frame slot owns a persistently mapped uniform buffer and the set 0
//! binding set pointing into it:
//!
//! ```text
//! 0            camera_offset                  light_offset
//! | SceneInfo | camera 0 | camera 1 | ... | light 0 | light 1 | ...
//! ```
//!
//! Every element starts at a multiple of the device's uniform offset
//! alignment, since each array element is bound as its own range.

use crate::render::api::{BindingLayout, BufferUsage, DescriptorResource, DescriptorWrite, GpuBackend, MemoryLocality};
use crate::render::pipeline::SceneCounts;
use crate::render::resources::{BindingSetHandle, BufferHandle, CameraUniform, LightUniform, SceneInfo};
use crate::render::{RenderDevice, RenderError, RenderResult};

const SCENE_INFO_SIZE: u64 = std::mem::size_of::<SceneInfo>() as u64;
const CAMERA_SIZE: u64 = std::mem::size_of::<CameraUniform>() as u64;
const LIGHT_SIZE: u64 = std::mem::size_of::<LightUniform>() as u64;

/// Byte placement of the scene uniforms in a slot buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLayout {
    /// Array lengths
    pub counts: SceneCounts,
    /// Distance between camera elements
    pub camera_stride: u64,
    /// Offset of camera 0
    pub camera_offset: u64,
    /// Distance between light elements
    pub light_stride: u64,
    /// Offset of light 0
    pub light_offset: u64,
    /// Total buffer size
    pub size: u64,
}

impl UniformLayout {
    /// Place the blocks for `counts` with `alignment` between ranges
    pub fn new(counts: SceneCounts, alignment: u64) -> Self {
        let align = |value: u64| value.next_multiple_of(alignment.max(1));
        let camera_offset = align(SCENE_INFO_SIZE);
        let camera_stride = align(CAMERA_SIZE);
        let light_offset = camera_offset + camera_stride * u64::from(counts.cameras);
        let light_stride = align(LIGHT_SIZE);
        let size = light_offset + light_stride * u64::from(counts.lights);
        Self {
            counts,
            camera_stride,
            camera_offset,
            light_stride,
            light_offset,
            size,
        }
    }

    fn camera_at(&self, index: u32) -> u64 {
        self.camera_offset + self.camera_stride * u64::from(index)
    }

    fn light_at(&self, index: u32) -> u64 {
        self.light_offset + self.light_stride * u64::from(index)
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotUniforms {
    buffer: BufferHandle,
    set: BindingSetHandle,
}

/// Scene uniform buffers and set 0 binding sets, one per frame slot
#[derive(Debug)]
pub struct FrameUniforms {
    layout: UniformLayout,
    with_lights: bool,
    slots: Vec<SlotUniforms>,
}

impl FrameUniforms {
    /// Allocate storage for `frame_slots` slots against `scene_layout`
    pub fn new<B: GpuBackend>(
        device: &mut RenderDevice<B>,
        scene_layout: &BindingLayout,
        counts: SceneCounts,
        frame_slots: usize,
    ) -> RenderResult<Self> {
        let alignment = device.backend.limits().min_uniform_buffer_offset_alignment;
        let layout = UniformLayout::new(counts, alignment);
        let with_lights = scene_layout.slots().iter().any(|slot| slot.binding == 2);

        let mut uniforms = Self {
            layout,
            with_lights,
            slots: Vec::with_capacity(frame_slots),
        };
        for _ in 0..frame_slots {
            match uniforms.create_slot(device, scene_layout) {
                Ok(slot) => uniforms.slots.push(slot),
                Err(err) => {
                    uniforms.destroy(device);
                    return Err(err);
                }
            }
        }
        log::debug!("Allocated {} frame uniform buffers of {} bytes", frame_slots, layout.size);
        Ok(uniforms)
    }

    fn create_slot<B: GpuBackend>(
        &self,
        device: &mut RenderDevice<B>,
        scene_layout: &BindingLayout,
    ) -> RenderResult<SlotUniforms> {
        let buffer = device.create_buffer(self.layout.size, BufferUsage::UNIFORM, MemoryLocality::HostVisible, None)?;
        let raw = device.arena.buffer(buffer)?.raw();
        let set = match device.bindings.allocate(&mut device.backend, scene_layout) {
            Ok(set) => set,
            Err(err) => {
                device.arena.destroy_immediate(&mut device.backend, buffer)?;
                return Err(err);
            }
        };

        let range = |offset: u64, range: u64| DescriptorResource::Buffer {
            buffer: raw,
            offset,
            range,
        };
        let mut writes = vec![DescriptorWrite {
            binding: 0,
            array_element: 0,
            resource: range(0, SCENE_INFO_SIZE),
        }];
        writes.extend((0..self.layout.counts.cameras).map(|index| DescriptorWrite {
            binding: 1,
            array_element: index,
            resource: range(self.layout.camera_at(index), CAMERA_SIZE),
        }));
        if self.with_lights {
            writes.extend((0..self.layout.counts.lights).map(|index| DescriptorWrite {
                binding: 2,
                array_element: index,
                resource: range(self.layout.light_at(index), LIGHT_SIZE),
            }));
        }
        device.bindings.write(&mut device.backend, set, &writes)?;
        Ok(SlotUniforms { buffer, set })
    }

    /// Placement of the blocks
    pub const fn layout(&self) -> &UniformLayout {
        &self.layout
    }

    /// Array lengths the storage was sized for
    pub const fn counts(&self) -> SceneCounts {
        self.layout.counts
    }

    /// Set 0 binding set of a slot
    pub fn scene_set(&self, slot_index: usize) -> RenderResult<BindingSetHandle> {
        self.slots
            .get(slot_index)
            .map(|slot| slot.set)
            .ok_or_else(|| RenderError::InvalidArgument(format!("frame slot {slot_index} out of range")))
    }

    /// Uniform buffer of a slot
    pub fn buffer(&self, slot_index: usize) -> RenderResult<BufferHandle> {
        self.slots
            .get(slot_index)
            .map(|slot| slot.buffer)
            .ok_or_else(|| RenderError::InvalidArgument(format!("frame slot {slot_index} out of range")))
    }

    /// Write this frame's scene data into a slot's buffer
    ///
    /// The slot's previous frame must have completed. Array elements beyond
    /// the supplied data are left untouched.
    pub fn write<B: GpuBackend>(
        &self,
        device: &mut RenderDevice<B>,
        slot_index: usize,
        info: &SceneInfo,
        cameras: &[CameraUniform],
        lights: &[LightUniform],
    ) -> RenderResult<()> {
        if cameras.len() > self.layout.counts.cameras as usize
            || (self.with_lights && lights.len() > self.layout.counts.lights as usize)
        {
            return Err(RenderError::InvalidArgument(format!(
                "{} cameras and {} lights exceed storage for {:?}",
                cameras.len(),
                lights.len(),
                self.layout.counts
            )));
        }
        let buffer = self.buffer(slot_index)?;

        device.arena.write_buffer(&mut device.backend, buffer, 0, bytemuck::bytes_of(info))?;
        for (index, camera) in (0u32..).zip(cameras) {
            device.arena.write_buffer(
                &mut device.backend,
                buffer,
                self.layout.camera_at(index),
                bytemuck::bytes_of(camera),
            )?;
        }
        if self.with_lights {
            for (index, light) in (0u32..).zip(lights) {
                device.arena.write_buffer(
                    &mut device.backend,
                    buffer,
                    self.layout.light_at(index),
                    bytemuck::bytes_of(light),
                )?;
            }
        }
        Ok(())
    }

    /// Release buffers and sets; the device must be idle
    pub fn destroy<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) {
        for slot in self.slots.drain(..) {
            if let Err(err) = device.bindings.free(&mut device.backend, slot.set) {
                log::warn!("Freeing scene binding set failed: {err}");
            }
            if let Err(err) = device.arena.destroy_immediate(&mut device.backend, slot.buffer) {
                log::warn!("Destroying scene uniform buffer failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Mat4, Vec3, Vec4};
    use crate::render::pipeline::{scene_layout, ShadingModel};
    use crate::render::testing::headless_device;

    #[test]
    fn test_offsets_respect_alignment() {
        let layout = UniformLayout::new(SceneCounts::new(2, 3), 256);
        assert_eq!(layout.camera_offset, 256);
        assert_eq!(layout.camera_stride, 256);
        assert_eq!(layout.light_offset, 256 + 2 * 256);
        assert_eq!(layout.size, 768 + 3 * 256);

        let tight = UniformLayout::new(SceneCounts::new(1, 1), 16);
        assert_eq!(tight.camera_offset, 32);
        assert_eq!(tight.light_offset, 32 + 144);
    }

    #[test]
    fn test_written_blocks_land_at_their_offsets() {
        let mut device = headless_device();
        let counts = SceneCounts::new(1, 2);
        let layout = scene_layout(ShadingModel::DefaultLit, counts);
        let uniforms = FrameUniforms::new(&mut device, &layout, counts, 2).unwrap();

        let info = SceneInfo::new(Vec4::new(0.2, 0.2, 0.2, 1.0), 1, 2);
        let camera = CameraUniform::new(&Mat4::identity(), &Mat4::identity(), Vec3::new(1.0, 2.0, 3.0));
        let lights = [
            LightUniform::new(Vec3::new(1.0, 0.0, 0.0), Vec3::zeros(), Vec3::new(0.0, 0.0, -1.0)),
            LightUniform::new(Vec3::new(0.0, 1.0, 0.0), Vec3::zeros(), Vec3::new(0.0, 0.0, -1.0)),
        ];
        uniforms.write(&mut device, 1, &info, &[camera], &lights).unwrap();

        let bytes = device.read_buffer(uniforms.buffer(1).unwrap()).unwrap();
        let light_1 = uniforms.layout().light_offset as usize + uniforms.layout().light_stride as usize;
        assert_eq!(&bytes[..32], bytemuck::bytes_of(&info));
        assert_eq!(&bytes[light_1..light_1 + 48], bytemuck::bytes_of(&lights[1]));
        assert!(device.backend.validation_errors().is_empty());
    }

    #[test]
    fn test_too_many_cameras_is_rejected() {
        let mut device = headless_device();
        let counts = SceneCounts::new(1, 1);
        let layout = scene_layout(ShadingModel::Unlit, counts);
        let uniforms = FrameUniforms::new(&mut device, &layout, counts, 1).unwrap();
        let camera = CameraUniform::new(&Mat4::identity(), &Mat4::identity(), Vec3::zeros());
        let info = SceneInfo::new(Vec4::zeros(), 2, 0);
        assert!(uniforms.write(&mut device, 0, &info, &[camera, camera], &[]).is_err());
    }
}
