//! Materials and textures
//!
//! Every material owns one binding set per frame slot. Sets are written once
//! at creation; swapping a texture only marks them stale, and each slot's set
//! is rewritten the next time that slot is acquired, after its fence has
//! signaled. A set is therefore never updated while a command buffer in
//! flight still reads it.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::render::api::{
    BindingLayout, BufferUsage, DescriptorResource, DescriptorWrite, GpuBackend, ImageLayout, MemoryLocality,
};
use crate::render::pipeline::{ShadingModel, TextureSlot};
use crate::render::resources::{
    texture_sampler_desc, BindingSetHandle, BufferHandle, ImageData, ImageHandle, MaterialFactors, SamplerHandle,
};
use crate::render::{RenderDevice, RenderError, RenderResult};

new_key_type! {
    /// Material with per-slot binding sets
    pub struct MaterialHandle;

    /// Uploaded texture with its sampler
    pub struct TextureHandle;
}

/// Material as produced by a loader
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialData {
    /// Debug name
    pub name: String,
    /// Base color multiplier
    pub base_color_factor: [f32; 4],
    /// Metalness multiplier
    pub metallic_factor: f32,
    /// Roughness multiplier
    pub roughness_factor: f32,
    /// Index into the model's textures
    pub base_color_texture: Option<usize>,
    /// Index into the model's textures
    pub normal_texture: Option<usize>,
    /// Index into the model's textures
    pub metallic_roughness_texture: Option<usize>,
    /// Index into the model's textures
    pub occlusion_texture: Option<usize>,
    /// Index into the model's textures
    pub emissive_texture: Option<usize>,
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_color_factor: [1.0, 1.0, 1.0, 1.0],
            metallic_factor: 0.0,
            roughness_factor: 0.5,
            base_color_texture: None,
            normal_texture: None,
            metallic_roughness_texture: None,
            occlusion_texture: None,
            emissive_texture: None,
        }
    }
}

impl MaterialData {
    /// Texture index bound to `slot`
    pub const fn texture(&self, slot: TextureSlot) -> Option<usize> {
        match slot {
            TextureSlot::BaseColor => self.base_color_texture,
            TextureSlot::Normal => self.normal_texture,
            TextureSlot::MetallicRoughness => self.metallic_roughness_texture,
            TextureSlot::Occlusion => self.occlusion_texture,
            TextureSlot::Emissive => self.emissive_texture,
        }
    }

    fn factors(&self) -> MaterialFactors {
        MaterialFactors {
            base_color: self.base_color_factor,
            metallic_roughness: [self.metallic_factor, self.roughness_factor, 1.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Texture {
    image: ImageHandle,
    sampler: SamplerHandle,
}

#[derive(Debug)]
struct Material {
    textures: HashMap<TextureSlot, TextureHandle>,
    factors: Option<BufferHandle>,
    sets: Vec<BindingSetHandle>,
    stale: Vec<bool>,
}

/// Textures and materials of one shading model
#[derive(Debug)]
pub struct MaterialLibrary {
    model: ShadingModel,
    layout: BindingLayout,
    frame_slots: usize,
    textures: SlotMap<TextureHandle, Texture>,
    materials: SlotMap<MaterialHandle, Material>,
    fallbacks: HashMap<TextureSlot, TextureHandle>,
    default_material: Option<MaterialHandle>,
}

impl MaterialLibrary {
    /// Library for `model` with one set per material and frame slot
    pub fn new(model: ShadingModel, frame_slots: usize) -> Self {
        Self {
            model,
            layout: model.material_layout(),
            frame_slots: frame_slots.max(1),
            textures: SlotMap::with_key(),
            materials: SlotMap::with_key(),
            fallbacks: HashMap::new(),
            default_material: None,
        }
    }

    /// Shading model every material follows
    pub const fn model(&self) -> ShadingModel {
        self.model
    }

    /// Set 1 layout of the model
    pub const fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    // Textures

    /// Upload a texture with a full mip chain and a matching sampler
    pub fn create_texture<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        data: &ImageData,
    ) -> RenderResult<TextureHandle> {
        let image = device.upload_texture(data)?;
        let mips = device.arena.image(image)?.mip_levels();
        let desc = texture_sampler_desc(device.backend.limits(), mips);
        let sampler = match device.arena.create_sampler(&mut device.backend, &desc) {
            Ok(sampler) => sampler,
            Err(err) => {
                device.arena.destroy_immediate(&mut device.backend, image)?;
                return Err(err);
            }
        };
        Ok(self.textures.insert(Texture { image, sampler }))
    }

    /// Remove a texture no material uses anymore
    pub fn remove_texture<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        handle: TextureHandle,
    ) -> RenderResult<()> {
        let in_use = self
            .materials
            .values()
            .any(|material| material.textures.values().any(|texture| *texture == handle))
            || self.fallbacks.values().any(|texture| *texture == handle);
        if in_use {
            return Err(RenderError::invalid_operation("texture is still referenced by a material"));
        }
        let texture = self
            .textures
            .remove(handle)
            .ok_or(RenderError::StaleHandle { kind: "texture" })?;
        device.arena.destroy(texture.image)?;
        device.arena.destroy(texture.sampler)
    }

    fn fallback<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>, slot: TextureSlot) -> RenderResult<TextureHandle> {
        if let Some(texture) = self.fallbacks.get(&slot) {
            return Ok(*texture);
        }
        let texture = self.create_texture(device, &ImageData::solid(1, 1, slot.fallback_texel()))?;
        self.fallbacks.insert(slot, texture);
        Ok(texture)
    }

    // Materials

    /// Create a material; texture indices resolve through `textures`
    ///
    /// Slots without a texture sample a 1x1 fallback.
    pub fn create_material<B: GpuBackend>(
        &mut self,
        device: &mut RenderDevice<B>,
        data: &MaterialData,
        textures: &[TextureHandle],
    ) -> RenderResult<MaterialHandle> {
        let info = self.model.info();
        let mut bound = HashMap::new();
        for slot in info.textures {
            let texture = match data.texture(*slot).and_then(|index| textures.get(index).copied()) {
                Some(texture) if self.textures.contains_key(texture) => texture,
                Some(_) => return Err(RenderError::StaleHandle { kind: "texture" }),
                None => self.fallback(device, *slot)?,
            };
            bound.insert(*slot, texture);
        }

        let factors = if info.uses_factors {
            let factors = data.factors();
            let bytes = bytemuck::bytes_of(&factors);
            Some(device.create_buffer(
                bytes.len() as u64,
                BufferUsage::UNIFORM,
                MemoryLocality::HostVisible,
                Some(bytes),
            )?)
        } else {
            None
        };

        let mut material = Material {
            textures: bound,
            factors,
            sets: Vec::with_capacity(self.frame_slots),
            stale: vec![false; self.frame_slots],
        };
        let writes = self.writes(device, &material)?;
        for _ in 0..self.frame_slots {
            let set = device.bindings.allocate(&mut device.backend, &self.layout)?;
            material.sets.push(set);
            device.bindings.write(&mut device.backend, set, &writes)?;
        }

        log::debug!("Created {:?} material '{}'", self.model, data.name);
        Ok(self.materials.insert(material))
    }

    /// Material used by primitives that name none
    pub fn default_material<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>) -> RenderResult<MaterialHandle> {
        if let Some(material) = self.default_material.filter(|handle| self.materials.contains_key(*handle)) {
            return Ok(material);
        }
        let material = self.create_material(device, &MaterialData::default(), &[])?;
        self.default_material = Some(material);
        Ok(material)
    }

    /// Swap the texture a material samples for `slot`
    ///
    /// Takes effect per frame slot as each slot is next prepared.
    pub fn set_texture(&mut self, material: MaterialHandle, slot: TextureSlot, texture: TextureHandle) -> RenderResult<()> {
        if self.model.texture_binding(slot).is_none() {
            return Err(RenderError::InvalidArgument(format!("{:?} materials do not sample {slot:?}", self.model)));
        }
        if !self.textures.contains_key(texture) {
            return Err(RenderError::StaleHandle { kind: "texture" });
        }
        let entry = self
            .materials
            .get_mut(material)
            .ok_or(RenderError::StaleHandle { kind: "material" })?;
        entry.textures.insert(slot, texture);
        entry.stale.iter_mut().for_each(|stale| *stale = true);
        Ok(())
    }

    /// Rewrite the stale sets of `slot_index`; its previous frame must have completed
    pub fn prepare_slot<B: GpuBackend>(&mut self, device: &mut RenderDevice<B>, slot_index: usize) -> RenderResult<usize> {
        let stale: Vec<MaterialHandle> = self
            .materials
            .iter()
            .filter(|(_, material)| material.stale.get(slot_index).copied().unwrap_or(false))
            .map(|(handle, _)| handle)
            .collect();

        for handle in &stale {
            let Some(material) = self.materials.get(*handle) else {
                continue;
            };
            let writes = self.writes(device, material)?;
            let set = material.sets[slot_index];
            device.bindings.write(&mut device.backend, set, &writes)?;
            if let Some(material) = self.materials.get_mut(*handle) {
                material.stale[slot_index] = false;
            }
        }
        if !stale.is_empty() {
            log::debug!("Rewrote {} material sets for slot {slot_index}", stale.len());
        }
        Ok(stale.len())
    }

    /// Binding set of `material` for `slot_index`
    pub fn binding_set(&self, material: MaterialHandle, slot_index: usize) -> RenderResult<BindingSetHandle> {
        let entry = self
            .materials
            .get(material)
            .ok_or(RenderError::StaleHandle { kind: "material" })?;
        entry
            .sets
            .get(slot_index)
            .copied()
            .ok_or_else(|| RenderError::InvalidArgument(format!("frame slot {slot_index} out of range")))
    }

    /// Texture a material samples for `slot`
    pub fn texture_of(&self, material: MaterialHandle, slot: TextureSlot) -> Option<TextureHandle> {
        self.materials
            .get(material)
            .and_then(|entry| entry.textures.get(&slot).copied())
    }

    /// Image behind a texture
    pub fn texture_image(&self, texture: TextureHandle) -> RenderResult<ImageHandle> {
        self.textures
            .get(texture)
            .map(|texture| texture.image)
            .ok_or(RenderError::StaleHandle { kind: "texture" })
    }

    /// Number of materials
    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Number of textures, fallbacks included
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn writes<B: GpuBackend>(&self, device: &RenderDevice<B>, material: &Material) -> RenderResult<Vec<DescriptorWrite>> {
        let mut writes = Vec::with_capacity(self.layout.slots().len());
        if let Some(factors) = material.factors {
            let buffer = device.arena.buffer(factors)?;
            writes.push(DescriptorWrite {
                binding: 0,
                array_element: 0,
                resource: DescriptorResource::Buffer {
                    buffer: buffer.raw(),
                    offset: 0,
                    range: buffer.size(),
                },
            });
        }
        for slot in self.model.info().textures {
            let binding = self
                .model
                .texture_binding(*slot)
                .ok_or_else(|| RenderError::invalid_operation("texture slot missing from layout"))?;
            let texture = material
                .textures
                .get(slot)
                .and_then(|handle| self.textures.get(*handle))
                .ok_or(RenderError::StaleHandle { kind: "texture" })?;
            writes.push(DescriptorWrite {
                binding,
                array_element: 0,
                resource: DescriptorResource::ImageSampler {
                    view: device.arena.image(texture.image)?.view(),
                    sampler: device.arena.sampler(texture.sampler)?,
                    layout: ImageLayout::ShaderReadOnly,
                },
            });
        }
        Ok(writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::testing::headless_device;

    #[test]
    fn test_material_gets_one_set_per_slot() {
        let mut device = headless_device();
        let mut library = MaterialLibrary::new(ShadingModel::DefaultLit, 3);
        let material = library.default_material(&mut device).unwrap();

        let sets: Vec<_> = (0..3).map(|slot| library.binding_set(material, slot).unwrap()).collect();
        assert_eq!(sets.len(), 3);
        assert_ne!(sets[0], sets[1]);
        assert!(library.binding_set(material, 3).is_err());
        // White base color and flat normal fallbacks
        assert_eq!(library.texture_count(), 2);
    }

    #[test]
    fn test_texture_indices_resolve_through_model_textures() {
        let mut device = headless_device();
        let mut library = MaterialLibrary::new(ShadingModel::Unlit, 2);
        let texture = library.create_texture(&mut device, &ImageData::solid(8, 8, [255, 0, 0, 255])).unwrap();

        let data = MaterialData {
            base_color_texture: Some(0),
            ..MaterialData::default()
        };
        let material = library.create_material(&mut device, &data, &[texture]).unwrap();
        assert_eq!(library.texture_of(material, TextureSlot::BaseColor), Some(texture));
        assert_eq!(library.texture_count(), 1);
    }

    #[test]
    fn test_pbr_material_writes_factors() {
        let mut device = headless_device();
        let mut library = MaterialLibrary::new(ShadingModel::Pbr, 2);
        let material = library.default_material(&mut device).unwrap();
        assert!(library.binding_set(material, 1).is_ok());
        assert_eq!(library.texture_count(), 5);
        assert!(device.backend.validation_errors().is_empty());
    }

    #[test]
    fn test_hot_swap_rewrites_each_slot_once() {
        let mut device = headless_device();
        let mut library = MaterialLibrary::new(ShadingModel::DefaultLit, 2);
        let material = library.default_material(&mut device).unwrap();
        let texture = library.create_texture(&mut device, &ImageData::solid(4, 4, [0, 255, 0, 255])).unwrap();

        library.set_texture(material, TextureSlot::BaseColor, texture).unwrap();
        assert_eq!(library.prepare_slot(&mut device, 0).unwrap(), 1);
        assert_eq!(library.prepare_slot(&mut device, 0).unwrap(), 0);
        assert_eq!(library.prepare_slot(&mut device, 1).unwrap(), 1);
        assert_eq!(library.texture_of(material, TextureSlot::BaseColor), Some(texture));
    }

    #[test]
    fn test_swap_rejects_unsampled_slot_and_used_texture_removal() {
        let mut device = headless_device();
        let mut library = MaterialLibrary::new(ShadingModel::Unlit, 1);
        let texture = library.create_texture(&mut device, &ImageData::solid(2, 2, [9, 9, 9, 255])).unwrap();
        let data = MaterialData {
            base_color_texture: Some(0),
            ..MaterialData::default()
        };
        let material = library.create_material(&mut device, &data, &[texture]).unwrap();

        assert!(matches!(
            library.set_texture(material, TextureSlot::Normal, texture),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(library.remove_texture(&mut device, texture).is_err());
    }
}
