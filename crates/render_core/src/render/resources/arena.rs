//! Resource arena
//!
//! Owns every buffer, image and sampler the core creates. Resources live in
//! generational tables; a destroyed handle stays stale forever, and the raw
//! objects behind it are released only after the frames that may still
//! reference them have retired.
//!
//! Allocation follows the classic Vulkan sequence: create the object, query
//! its requirements, pick a memory type that satisfies both the type mask and
//! the requested locality, allocate, bind. Device-local contents are filled
//! through a transient staging buffer and a blocking transfer submission.

use slotmap::{new_key_type, SlotMap};

use crate::render::api::{
    BufferDesc, BufferUsage, Command, Extent2D, Format, GpuBackend, ImageAspect, ImageBarrier, ImageDesc,
    ImageLayout, ImageUsage, ImageViewDesc, MemoryLocality, MemoryProperties, MemoryRequirements, MemoryType,
    QueueKind, RawBuffer, RawImage, RawImageView, RawMemory, RawSampler, SamplerDesc,
};
use crate::render::commands::CommandRecorder;
use crate::render::{RenderError, RenderResult};

new_key_type! {
    /// Handle to an arena buffer
    pub struct BufferHandle;
    /// Handle to an arena image
    pub struct ImageHandle;
    /// Handle to an arena sampler
    pub struct SamplerHandle;
}

/// Any arena handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    /// Buffer
    Buffer(BufferHandle),
    /// Image (with its default view)
    Image(ImageHandle),
    /// Sampler
    Sampler(SamplerHandle),
}

impl From<BufferHandle> for ResourceHandle {
    fn from(handle: BufferHandle) -> Self {
        Self::Buffer(handle)
    }
}

impl From<ImageHandle> for ResourceHandle {
    fn from(handle: ImageHandle) -> Self {
        Self::Image(handle)
    }
}

impl From<SamplerHandle> for ResourceHandle {
    fn from(handle: SamplerHandle) -> Self {
        Self::Sampler(handle)
    }
}

/// Pick the first memory type allowed by `type_bits` that carries `required`
pub fn find_memory_type(types: &[MemoryType], type_bits: u32, required: MemoryProperties) -> Option<u32> {
    types
        .iter()
        .enumerate()
        .find(|(index, ty)| type_bits & (1 << index) != 0 && ty.properties.contains(required))
        .and_then(|(index, _)| u32::try_from(index).ok())
}

/// Buffer owned by the arena
#[derive(Debug, Clone)]
pub struct GpuBuffer {
    raw: RawBuffer,
    memory: RawMemory,
    size: u64,
    usage: BufferUsage,
    locality: MemoryLocality,
    mapped: bool,
}

impl GpuBuffer {
    /// Backend buffer
    pub const fn raw(&self) -> RawBuffer {
        self.raw
    }

    /// Requested size in bytes
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags, including the transfer bits the arena adds
    pub const fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory locality class
    pub const fn locality(&self) -> MemoryLocality {
        self.locality
    }

    /// Whether the buffer is persistently mapped
    pub const fn is_mapped(&self) -> bool {
        self.mapped
    }
}

/// Image owned by the arena, with its default view
#[derive(Debug, Clone)]
pub struct GpuImage {
    raw: RawImage,
    memory: RawMemory,
    view: RawImageView,
    desc: ImageDesc,
    layout: ImageLayout,
}

impl GpuImage {
    /// Backend image
    pub const fn raw(&self) -> RawImage {
        self.raw
    }

    /// View covering every mip
    pub const fn view(&self) -> RawImageView {
        self.view
    }

    /// Extent of mip 0
    pub const fn extent(&self) -> Extent2D {
        self.desc.extent
    }

    /// Pixel format
    pub const fn format(&self) -> Format {
        self.desc.format
    }

    /// Mip count
    pub const fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    /// Usage flags
    pub const fn usage(&self) -> ImageUsage {
        self.desc.usage
    }

    /// Aspect implied by the format
    pub const fn aspect(&self) -> ImageAspect {
        ImageAspect::for_format(self.desc.format)
    }

    /// Layout the image is expected to be in once submitted work completes
    pub const fn layout(&self) -> ImageLayout {
        self.layout
    }
}

#[derive(Debug)]
enum Retired {
    Buffer { raw: RawBuffer, memory: RawMemory },
    Image { raw: RawImage, view: RawImageView, memory: RawMemory },
    Sampler(RawSampler),
}

impl Retired {
    fn release<B: GpuBackend>(self, backend: &mut B) {
        match self {
            Self::Buffer { raw, memory } => {
                backend.destroy_buffer(raw);
                backend.free_memory(memory);
            }
            Self::Image { raw, view, memory } => {
                backend.destroy_image_view(view);
                backend.destroy_image(raw);
                backend.free_memory(memory);
            }
            Self::Sampler(raw) => backend.destroy_sampler(raw),
        }
    }
}

/// Buffers, images and samplers with deferred destruction
#[derive(Debug, Default)]
pub struct ResourceArena {
    buffers: SlotMap<BufferHandle, GpuBuffer>,
    images: SlotMap<ImageHandle, GpuImage>,
    samplers: SlotMap<SamplerHandle, RawSampler>,
    /// Objects waiting for a frame to retire; `None` means no frame was recording
    retired: Vec<(Option<u64>, Retired)>,
    current_frame: Option<u64>,
}

impl ResourceArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `frame` as the frame now being recorded
    ///
    /// Resources destroyed from here on may be referenced by it, so they are
    /// held until `frame` retires.
    pub fn begin_frame(&mut self, frame: u64) {
        self.current_frame = Some(frame);
    }

    // Buffers

    /// Create a buffer, optionally filled with `initial_data`
    ///
    /// Device-local contents go through a staging buffer and a blocking copy
    /// on the transfer queue.
    pub fn create_buffer<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        recorder: &mut CommandRecorder,
        size: u64,
        usage: BufferUsage,
        locality: MemoryLocality,
        initial_data: Option<&[u8]>,
    ) -> RenderResult<BufferHandle> {
        if size == 0 {
            return Err(RenderError::InvalidArgument("buffer size must be non-zero".to_string()));
        }
        if let Some(data) = initial_data {
            if data.len() as u64 > size {
                return Err(RenderError::InvalidArgument(format!(
                    "{} bytes of initial data do not fit a {size} byte buffer",
                    data.len()
                )));
            }
        }

        let usage = match locality {
            MemoryLocality::DeviceLocal => usage | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            MemoryLocality::HostVisible => usage,
        };
        let buffer = Self::allocate_buffer(backend, size, usage, locality)?;
        let raw = buffer.raw;
        let memory = buffer.memory;
        let handle = self.buffers.insert(buffer);

        if let Some(data) = initial_data.filter(|data| !data.is_empty()) {
            let filled = match locality {
                MemoryLocality::HostVisible => backend.write_mapped(memory, 0, data),
                MemoryLocality::DeviceLocal => {
                    self.with_staging(backend, data.len() as u64, Some(data), |backend, staging| {
                        let src = staging.raw;
                        recorder.single_shot(backend, QueueKind::Transfer, |session| {
                            session.copy_buffer(src, raw, data.len() as u64);
                            Ok(())
                        })
                    })
                }
            };
            if let Err(err) = filled {
                self.destroy_immediate(backend, handle)?;
                return Err(err);
            }
        }

        log::debug!("Created {size} byte {locality:?} buffer {raw:?} ({usage:?})");
        Ok(handle)
    }

    /// Write into a host-visible buffer through its mapping
    pub fn write_buffer<B: GpuBackend>(
        &self,
        backend: &mut B,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        let buffer = self.buffer(handle)?;
        if !buffer.mapped {
            return Err(RenderError::invalid_operation("write_buffer needs a host-visible buffer"));
        }
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > buffer.size) {
            return Err(RenderError::InvalidArgument(format!(
                "write of {} bytes at {offset} overruns {} byte buffer",
                data.len(),
                buffer.size
            )));
        }
        backend.write_mapped(buffer.memory, offset, data)
    }

    /// Read back the whole buffer
    ///
    /// Device-local buffers are copied into a staging buffer first, which
    /// blocks until the copy has executed.
    pub fn read_buffer<B: GpuBackend>(
        &self,
        backend: &mut B,
        recorder: &mut CommandRecorder,
        handle: BufferHandle,
    ) -> RenderResult<Vec<u8>> {
        let buffer = self.buffer(handle)?;
        let size = buffer.size;
        let mut out = vec![0; usize::try_from(size).map_err(|_| RenderError::InvalidArgument("buffer too large".into()))?];

        if buffer.mapped {
            backend.read_mapped(buffer.memory, 0, &mut out)?;
            return Ok(out);
        }

        let src = buffer.raw;
        self.with_staging(backend, size, None, |backend, staging| {
            let dst = staging.raw;
            recorder.single_shot(backend, QueueKind::Transfer, |session| {
                session.copy_buffer(src, dst, size);
                Ok(())
            })?;
            backend.read_mapped(staging.memory, 0, &mut out)
        })?;
        Ok(out)
    }

    /// Look up a buffer
    pub fn buffer(&self, handle: BufferHandle) -> RenderResult<&GpuBuffer> {
        self.buffers.get(handle).ok_or(RenderError::StaleHandle { kind: "buffer" })
    }

    fn allocate_buffer<B: GpuBackend>(
        backend: &mut B,
        size: u64,
        usage: BufferUsage,
        locality: MemoryLocality,
    ) -> RenderResult<GpuBuffer> {
        let (raw, requirements) = backend.create_buffer(&BufferDesc { size, usage })?;
        let memory = match Self::allocate_memory(backend, requirements, locality) {
            Ok(memory) => memory,
            Err(err) => {
                backend.destroy_buffer(raw);
                return Err(err);
            }
        };

        let bound = backend.bind_buffer_memory(raw, memory, 0).and_then(|()| match locality {
            MemoryLocality::HostVisible => backend.map_memory(memory),
            MemoryLocality::DeviceLocal => Ok(()),
        });
        if let Err(err) = bound {
            backend.destroy_buffer(raw);
            backend.free_memory(memory);
            return Err(err);
        }

        Ok(GpuBuffer {
            raw,
            memory,
            size,
            usage,
            locality,
            mapped: locality == MemoryLocality::HostVisible,
        })
    }

    fn allocate_memory<B: GpuBackend>(
        backend: &mut B,
        requirements: MemoryRequirements,
        locality: MemoryLocality,
    ) -> RenderResult<RawMemory> {
        let properties = locality.required_properties();
        let index = find_memory_type(backend.memory_types(), requirements.memory_type_bits, properties).ok_or(
            RenderError::OutOfMemory {
                requested: requirements.size,
                properties,
            },
        )?;
        backend.allocate_memory(requirements.size, index)
    }

    /// Run `work` with a transient host-visible buffer, releasing it afterwards
    pub(crate) fn with_staging<B: GpuBackend, T>(
        &self,
        backend: &mut B,
        size: u64,
        fill: Option<&[u8]>,
        work: impl FnOnce(&mut B, &GpuBuffer) -> RenderResult<T>,
    ) -> RenderResult<T> {
        let staging = Self::allocate_buffer(
            backend,
            size,
            BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            MemoryLocality::HostVisible,
        )?;

        let result = match fill {
            Some(data) => backend.write_mapped(staging.memory, 0, data),
            None => Ok(()),
        }
        .and_then(|()| work(backend, &staging));

        Retired::Buffer {
            raw: staging.raw,
            memory: staging.memory,
        }
        .release(backend);
        result
    }

    // Images

    /// Create a single-mip 2D image with a default view
    pub fn create_image<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        extent: Extent2D,
        format: Format,
        usage: ImageUsage,
        locality: MemoryLocality,
    ) -> RenderResult<ImageHandle> {
        self.create_image_with(
            backend,
            ImageDesc {
                extent,
                format,
                mip_levels: 1,
                array_layers: 1,
                usage,
            },
            locality,
        )
    }

    /// Create an image from a full description
    pub fn create_image_with<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        desc: ImageDesc,
        locality: MemoryLocality,
    ) -> RenderResult<ImageHandle> {
        let (raw, requirements) = backend.create_image(&desc)?;
        let memory = match Self::allocate_memory(backend, requirements, locality) {
            Ok(memory) => memory,
            Err(err) => {
                backend.destroy_image(raw);
                return Err(err);
            }
        };

        let view_desc = ImageViewDesc {
            format: desc.format,
            aspect: ImageAspect::for_format(desc.format),
            base_mip: 0,
            mip_count: desc.mip_levels,
        };
        let view = backend
            .bind_image_memory(raw, memory, 0)
            .and_then(|()| backend.create_image_view(raw, &view_desc));
        let view = match view {
            Ok(view) => view,
            Err(err) => {
                backend.destroy_image(raw);
                backend.free_memory(memory);
                return Err(err);
            }
        };

        log::debug!(
            "Created {}x{} {:?} image {raw:?} with {} mips",
            desc.extent.width,
            desc.extent.height,
            desc.format,
            desc.mip_levels
        );
        Ok(self.images.insert(GpuImage {
            raw,
            memory,
            view,
            desc,
            layout: ImageLayout::Undefined,
        }))
    }

    /// Look up an image
    pub fn image(&self, handle: ImageHandle) -> RenderResult<&GpuImage> {
        self.images.get(handle).ok_or(RenderError::StaleHandle { kind: "image" })
    }

    /// Barrier moving every mip of the image to `new_layout`
    ///
    /// The tracked layout is updated immediately; the caller must record the
    /// returned command before any work that relies on the new layout.
    pub fn transition(&mut self, handle: ImageHandle, new_layout: ImageLayout) -> RenderResult<Command> {
        let image = self.images.get_mut(handle).ok_or(RenderError::StaleHandle { kind: "image" })?;
        let barrier = ImageBarrier {
            image: image.raw,
            aspect: ImageAspect::for_format(image.desc.format),
            old_layout: image.layout,
            new_layout,
            base_mip: 0,
            mip_count: image.desc.mip_levels,
        };
        image.layout = new_layout;
        Ok(Command::ImageBarrier(barrier))
    }

    /// Record a layout change made implicitly (render pass final layouts)
    pub fn set_layout(&mut self, handle: ImageHandle, layout: ImageLayout) -> RenderResult<()> {
        let image = self.images.get_mut(handle).ok_or(RenderError::StaleHandle { kind: "image" })?;
        image.layout = layout;
        Ok(())
    }

    // Samplers

    /// Create a sampler
    pub fn create_sampler<B: GpuBackend>(&mut self, backend: &mut B, desc: &SamplerDesc) -> RenderResult<SamplerHandle> {
        let raw = backend.create_sampler(desc)?;
        Ok(self.samplers.insert(raw))
    }

    /// Look up a sampler
    pub fn sampler(&self, handle: SamplerHandle) -> RenderResult<RawSampler> {
        self.samplers
            .get(handle)
            .copied()
            .ok_or(RenderError::StaleHandle { kind: "sampler" })
    }

    // Destruction

    fn take(&mut self, handle: ResourceHandle) -> RenderResult<Retired> {
        match handle {
            ResourceHandle::Buffer(handle) => self
                .buffers
                .remove(handle)
                .map(|buffer| Retired::Buffer {
                    raw: buffer.raw,
                    memory: buffer.memory,
                })
                .ok_or(RenderError::StaleHandle { kind: "buffer" }),
            ResourceHandle::Image(handle) => self
                .images
                .remove(handle)
                .map(|image| Retired::Image {
                    raw: image.raw,
                    view: image.view,
                    memory: image.memory,
                })
                .ok_or(RenderError::StaleHandle { kind: "image" }),
            ResourceHandle::Sampler(handle) => self
                .samplers
                .remove(handle)
                .map(Retired::Sampler)
                .ok_or(RenderError::StaleHandle { kind: "sampler" }),
        }
    }

    /// Destroy a resource once the frames that may reference it have retired
    ///
    /// The handle is stale as soon as this returns.
    pub fn destroy(&mut self, handle: impl Into<ResourceHandle>) -> RenderResult<()> {
        let retired = self.take(handle.into())?;
        self.retired.push((self.current_frame, retired));
        Ok(())
    }

    /// Destroy a resource now; the caller guarantees no pending work uses it
    pub fn destroy_immediate<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        handle: impl Into<ResourceHandle>,
    ) -> RenderResult<()> {
        self.take(handle.into())?.release(backend);
        Ok(())
    }

    /// Release every deferred resource whose frame is at or before `completed_frame`
    pub fn release_retired<B: GpuBackend>(&mut self, backend: &mut B, completed_frame: Option<u64>) -> usize {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|(frame, _)| match (frame, completed_frame) {
                (None, _) => true,
                (Some(frame), Some(done)) => *frame <= done,
                (Some(_), None) => false,
            });
        self.retired = waiting;

        let count = ready.len();
        for (_, retired) in ready {
            retired.release(backend);
        }
        if count > 0 {
            log::debug!("Released {count} retired resources");
        }
        count
    }

    /// Resources destroyed but not yet released
    pub fn pending_release_count(&self) -> usize {
        self.retired.len()
    }

    /// Live buffers, images and samplers
    pub fn live_counts(&self) -> (usize, usize, usize) {
        (self.buffers.len(), self.images.len(), self.samplers.len())
    }

    /// Release everything; the device must be idle
    pub fn destroy_all<B: GpuBackend>(&mut self, backend: &mut B) {
        for (_, retired) in self.retired.drain(..) {
            retired.release(backend);
        }
        for (_, buffer) in self.buffers.drain() {
            Retired::Buffer {
                raw: buffer.raw,
                memory: buffer.memory,
            }
            .release(backend);
        }
        for (_, image) in self.images.drain() {
            Retired::Image {
                raw: image.raw,
                view: image.view,
                memory: image.memory,
            }
            .release(backend);
        }
        for (_, sampler) in self.samplers.drain() {
            backend.destroy_sampler(sampler);
        }
        self.current_frame = None;
    }
}

/// First depth format from the candidate list the device supports
pub fn select_depth_format<B: GpuBackend>(backend: &B) -> RenderResult<Format> {
    Format::DEPTH_CANDIDATES
        .into_iter()
        .find(|format| backend.supports_depth_format(*format))
        .ok_or_else(|| RenderError::InitializationFailed("no supported depth format".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::{HeadlessBackend, HeadlessConfig};

    fn setup() -> (HeadlessBackend, ResourceArena, CommandRecorder) {
        (HeadlessBackend::default(), ResourceArena::new(), CommandRecorder::new())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_find_memory_type_respects_mask_and_properties() {
        let types = [
            MemoryType {
                properties: MemoryProperties::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryType {
                properties: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
                heap_index: 1,
            },
        ];
        let host = MemoryLocality::HostVisible.required_properties();
        assert_eq!(find_memory_type(&types, 0b11, host), Some(1));
        assert_eq!(find_memory_type(&types, 0b01, host), None);
        assert_eq!(
            find_memory_type(&types, 0b11, MemoryLocality::DeviceLocal.required_properties()),
            Some(0)
        );
    }

    #[test]
    fn test_zero_size_buffer_is_rejected() {
        let (mut backend, mut arena, mut recorder) = setup();
        let result = arena.create_buffer(
            &mut backend,
            &mut recorder,
            0,
            BufferUsage::VERTEX,
            MemoryLocality::DeviceLocal,
            None,
        );
        assert!(matches!(result, Err(RenderError::InvalidArgument(_))));
    }

    #[test]
    fn test_staging_round_trip_is_byte_identical() {
        let (mut backend, mut arena, mut recorder) = setup();
        for size in [1usize, 4096, 16 * 1024 * 1024] {
            let data = pattern(size);
            let handle = arena
                .create_buffer(
                    &mut backend,
                    &mut recorder,
                    size as u64,
                    BufferUsage::VERTEX,
                    MemoryLocality::DeviceLocal,
                    Some(&data),
                )
                .unwrap();
            assert!(!arena.buffer(handle).unwrap().is_mapped());

            let read = arena.read_buffer(&mut backend, &mut recorder, handle).unwrap();
            assert_eq!(read.len(), size);
            assert!(read == data, "readback differs for {size} bytes");
            arena.destroy_immediate(&mut backend, handle).unwrap();
        }
        assert!(backend.validation_errors().is_empty(), "{:?}", backend.validation_errors());
        // Only the arena's buffers count; staging buffers are gone
        assert_eq!(backend.live_objects().0, 0);
    }

    #[test]
    fn test_host_visible_buffer_writes_through_mapping() {
        let (mut backend, mut arena, mut recorder) = setup();
        let handle = arena
            .create_buffer(
                &mut backend,
                &mut recorder,
                16,
                BufferUsage::UNIFORM,
                MemoryLocality::HostVisible,
                Some(&[1, 2, 3, 4]),
            )
            .unwrap();
        arena.write_buffer(&mut backend, handle, 8, &[9, 9]).unwrap();

        let read = arena.read_buffer(&mut backend, &mut recorder, handle).unwrap();
        assert_eq!(&read[..4], &[1, 2, 3, 4]);
        assert_eq!(&read[8..10], &[9, 9]);
        assert_eq!(backend.stats().submissions, 0);

        assert!(arena.write_buffer(&mut backend, handle, 12, &[0; 8]).is_err());
    }

    #[test]
    fn test_write_at_huge_offset_is_rejected() {
        let (mut backend, mut arena, mut recorder) = setup();
        let handle = arena
            .create_buffer(&mut backend, &mut recorder, 16, BufferUsage::UNIFORM, MemoryLocality::HostVisible, None)
            .unwrap();

        assert!(matches!(
            arena.write_buffer(&mut backend, handle, u64::MAX, &[1, 2]),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(matches!(
            arena.write_buffer(&mut backend, handle, u64::MAX - 1, &[]),
            Err(RenderError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_exhausted_heap_reports_out_of_memory() {
        let mut config = HeadlessConfig::default();
        config.heap_sizes = vec![1024, 1024];
        let mut backend = HeadlessBackend::new(config);
        let mut arena = ResourceArena::new();
        let mut recorder = CommandRecorder::new();

        let result = arena.create_buffer(
            &mut backend,
            &mut recorder,
            4096,
            BufferUsage::VERTEX,
            MemoryLocality::DeviceLocal,
            None,
        );
        assert!(matches!(result, Err(RenderError::OutOfMemory { .. })));
        assert_eq!(arena.live_counts(), (0, 0, 0));
        assert_eq!(backend.live_objects().0, 0);
    }

    #[test]
    fn test_destroy_is_deferred_until_frame_retires() {
        let (mut backend, mut arena, mut recorder) = setup();
        let handle = arena
            .create_buffer(
                &mut backend,
                &mut recorder,
                64,
                BufferUsage::VERTEX,
                MemoryLocality::HostVisible,
                None,
            )
            .unwrap();

        arena.begin_frame(5);
        arena.destroy(handle).unwrap();
        assert!(matches!(arena.buffer(handle), Err(RenderError::StaleHandle { .. })));
        assert!(matches!(arena.destroy(handle), Err(RenderError::StaleHandle { .. })));

        assert_eq!(arena.release_retired(&mut backend, Some(4)), 0);
        assert_eq!(backend.live_objects().0, 1);
        assert_eq!(arena.release_retired(&mut backend, Some(5)), 1);
        assert_eq!(backend.live_objects().0, 0);
        assert_eq!(arena.pending_release_count(), 0);
    }

    #[test]
    fn test_transition_tracks_layout() {
        let (mut backend, mut arena, _) = setup();
        let handle = arena
            .create_image(
                &mut backend,
                Extent2D::new(8, 8),
                Format::B8G8R8A8Unorm,
                ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
                MemoryLocality::DeviceLocal,
            )
            .unwrap();

        let command = arena.transition(handle, ImageLayout::ShaderReadOnly).unwrap();
        match command {
            Command::ImageBarrier(barrier) => {
                assert_eq!(barrier.old_layout, ImageLayout::Undefined);
                assert_eq!(barrier.new_layout, ImageLayout::ShaderReadOnly);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(arena.image(handle).unwrap().layout(), ImageLayout::ShaderReadOnly);
        assert_eq!(backend.view_image(arena.image(handle).unwrap().view()), Some(arena.image(handle).unwrap().raw()));
    }

    #[test]
    fn test_depth_format_follows_candidate_order() {
        let mut config = HeadlessConfig::default();
        config.depth_formats = vec![Format::D24UnormS8Uint];
        let backend = HeadlessBackend::new(config);
        assert_eq!(select_depth_format(&backend).unwrap(), Format::D24UnormS8Uint);
        assert_eq!(select_depth_format(&HeadlessBackend::default()).unwrap(), Format::D32Sfloat);
    }
}
