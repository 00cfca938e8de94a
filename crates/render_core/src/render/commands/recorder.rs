//! Command buffer lifecycle
//!
//! Every command buffer moves through
//! `Initial → Recording → Executable → Pending → Initial`. Recording collects
//! backend-neutral [`Command`]s; `end` hands them to the backend, `submit`
//! marks the buffer pending, and `retire` returns it to `Initial` once the
//! fence guarding its submission has signaled.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use super::shared_pool::SharedCommandPool;
use crate::render::api::{
    ClearValue, Command, Extent2D, GpuBackend, ImageBarrier, QueueKind, RawBuffer, RawCommandBuffer,
    RawDescriptorSet, RawFramebuffer, RawPipeline, RawRenderPass, SubmitInfo,
};
use crate::render::{RenderError, RenderResult};

new_key_type! {
    /// Handle to a command buffer owned by the recorder
    pub struct CommandBufferHandle;
}

/// Lifecycle state of a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Ready to begin recording
    Initial,
    /// Accepting commands
    Recording,
    /// Recorded, not yet submitted
    Executable,
    /// Submitted; the GPU may still be executing it
    Pending,
}

#[derive(Debug)]
struct CommandBufferEntry {
    raw: RawCommandBuffer,
    queue: QueueKind,
    state: CommandBufferState,
    commands: Vec<Command>,
}

/// Owns command buffers for every queue kind
#[derive(Debug)]
pub struct CommandRecorder {
    buffers: SlotMap<CommandBufferHandle, CommandBufferEntry>,
    pools: HashMap<QueueKind, SharedCommandPool>,
}

impl Default for CommandRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRecorder {
    /// Create a recorder with one pool per queue kind
    pub fn new() -> Self {
        let pools = [QueueKind::Graphics, QueueKind::Transfer]
            .into_iter()
            .map(|queue| (queue, SharedCommandPool::new(queue)))
            .collect();
        Self {
            buffers: SlotMap::with_key(),
            pools,
        }
    }

    fn entry(&self, handle: CommandBufferHandle) -> RenderResult<&CommandBufferEntry> {
        self.buffers
            .get(handle)
            .ok_or(RenderError::StaleHandle { kind: "command buffer" })
    }

    fn entry_mut(&mut self, handle: CommandBufferHandle) -> RenderResult<&mut CommandBufferEntry> {
        self.buffers
            .get_mut(handle)
            .ok_or(RenderError::StaleHandle { kind: "command buffer" })
    }

    fn pool(&self, queue: QueueKind) -> RenderResult<&SharedCommandPool> {
        self.pools
            .get(&queue)
            .ok_or_else(|| RenderError::invalid_operation(format!("no command pool for {queue:?}")))
    }

    /// Allocate a command buffer for `queue`, reusing a freed one when possible
    pub fn allocate<B: GpuBackend>(&mut self, backend: &mut B, queue: QueueKind) -> RenderResult<CommandBufferHandle> {
        let raw = self.pool(queue)?.acquire(|queue| backend.allocate_command_buffer(queue))?;
        Ok(self.buffers.insert(CommandBufferEntry {
            raw,
            queue,
            state: CommandBufferState::Initial,
            commands: Vec::new(),
        }))
    }

    /// Start recording; fails unless the buffer is `Initial`
    pub fn begin(&mut self, handle: CommandBufferHandle) -> RenderResult<()> {
        let entry = self.entry_mut(handle)?;
        if entry.state != CommandBufferState::Initial {
            return Err(RenderError::invalid_operation(format!(
                "cannot begin a command buffer in state {:?}",
                entry.state
            )));
        }
        entry.commands.clear();
        entry.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Recording session for a buffer in `Recording`
    pub fn session(&mut self, handle: CommandBufferHandle) -> RenderResult<RecordingSession<'_>> {
        let entry = self.entry_mut(handle)?;
        if entry.state != CommandBufferState::Recording {
            return Err(RenderError::invalid_operation(format!(
                "command buffer is {:?}, not recording",
                entry.state
            )));
        }
        Ok(RecordingSession {
            commands: &mut entry.commands,
        })
    }

    /// Finish recording and hand the commands to the backend
    pub fn end<B: GpuBackend>(&mut self, backend: &mut B, handle: CommandBufferHandle) -> RenderResult<()> {
        let entry = self.entry_mut(handle)?;
        if entry.state != CommandBufferState::Recording {
            return Err(RenderError::invalid_operation(format!(
                "cannot end a command buffer in state {:?}",
                entry.state
            )));
        }
        backend.record(entry.raw, &entry.commands)?;
        entry.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Submit executable buffers of one queue kind
    ///
    /// `sync` carries the semaphores and fence; its command buffer list is
    /// replaced by `handles`.
    pub fn submit<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        handles: &[CommandBufferHandle],
        sync: SubmitInfo,
    ) -> RenderResult<()> {
        let mut queue = None;
        let mut command_buffers = Vec::with_capacity(handles.len());
        for &handle in handles {
            let entry = self.entry(handle)?;
            if entry.state != CommandBufferState::Executable {
                return Err(RenderError::invalid_operation(format!(
                    "cannot submit a command buffer in state {:?}",
                    entry.state
                )));
            }
            if queue.is_some_and(|queue| queue != entry.queue) {
                return Err(RenderError::invalid_operation("one submission cannot span queue kinds"));
            }
            queue = Some(entry.queue);
            command_buffers.push(entry.raw);
        }

        let queue = queue.ok_or_else(|| RenderError::invalid_operation("submission without command buffers"))?;
        backend.submit(
            queue,
            &SubmitInfo {
                command_buffers,
                ..sync
            },
        )?;

        for &handle in handles {
            self.entry_mut(handle)?.state = CommandBufferState::Pending;
        }
        Ok(())
    }

    /// Return a buffer to `Initial` once its work is known complete
    ///
    /// Retiring an `Executable` buffer discards its recording.
    pub fn retire(&mut self, handle: CommandBufferHandle) -> RenderResult<()> {
        let entry = self.entry_mut(handle)?;
        match entry.state {
            CommandBufferState::Pending | CommandBufferState::Executable | CommandBufferState::Initial => {
                entry.state = CommandBufferState::Initial;
                entry.commands.clear();
                Ok(())
            }
            CommandBufferState::Recording => Err(RenderError::invalid_operation(
                "cannot retire a command buffer that is still recording",
            )),
        }
    }

    /// Drop a recording that will never be submitted; refuses `Pending` buffers
    pub fn discard(&mut self, handle: CommandBufferHandle) -> RenderResult<()> {
        let entry = self.entry_mut(handle)?;
        if entry.state == CommandBufferState::Pending {
            return Err(RenderError::invalid_operation("cannot discard a pending command buffer"));
        }
        entry.state = CommandBufferState::Initial;
        entry.commands.clear();
        Ok(())
    }

    /// Release a buffer to its pool; refuses `Pending` buffers
    pub fn free(&mut self, handle: CommandBufferHandle) -> RenderResult<()> {
        let entry = self.entry(handle)?;
        if entry.state == CommandBufferState::Pending {
            return Err(RenderError::invalid_operation("cannot free a pending command buffer"));
        }
        let (raw, queue) = (entry.raw, entry.queue);
        self.pool(queue)?.release(raw);
        self.buffers.remove(handle);
        Ok(())
    }

    /// Current state of a buffer
    pub fn state(&self, handle: CommandBufferHandle) -> RenderResult<CommandBufferState> {
        self.entry(handle).map(|entry| entry.state)
    }

    /// Backend buffer behind a handle
    pub fn raw(&self, handle: CommandBufferHandle) -> RenderResult<RawCommandBuffer> {
        self.entry(handle).map(|entry| entry.raw)
    }

    /// Commands of the last recording
    pub fn commands(&self, handle: CommandBufferHandle) -> RenderResult<&[Command]> {
        self.entry(handle).map(|entry| entry.commands.as_slice())
    }

    /// Allocate and begin a buffer for blocking one-off work
    pub fn begin_single_time_commands<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        queue: QueueKind,
    ) -> RenderResult<CommandBufferHandle> {
        let handle = self.allocate(backend, queue)?;
        self.begin(handle)?;
        Ok(handle)
    }

    /// End, submit and wait for a single-shot buffer, then release it
    ///
    /// Always waits for the queue to go idle before returning.
    pub fn end_single_time_commands<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        handle: CommandBufferHandle,
    ) -> RenderResult<()> {
        let queue = self.entry(handle)?.queue;
        let result = self
            .end(backend, handle)
            .and_then(|()| self.submit(backend, &[handle], SubmitInfo::default()))
            .and_then(|()| backend.queue_wait_idle(queue));

        match result {
            Ok(()) => {
                self.retire(handle)?;
                self.free(handle)
            }
            Err(err) => {
                // Leave a buffer the GPU may still hold; anything else goes back to the pool
                if self.state(handle)? != CommandBufferState::Pending {
                    self.entry_mut(handle)?.state = CommandBufferState::Initial;
                    self.free(handle)?;
                }
                Err(err)
            }
        }
    }

    /// Record `record` into a single-shot buffer and execute it to completion
    pub fn single_shot<B, F>(&mut self, backend: &mut B, queue: QueueKind, record: F) -> RenderResult<()>
    where
        B: GpuBackend,
        F: FnOnce(&mut RecordingSession<'_>) -> RenderResult<()>,
    {
        let handle = self.begin_single_time_commands(backend, queue)?;
        let recorded = {
            let mut session = self.session(handle)?;
            record(&mut session)
        };
        if let Err(err) = recorded {
            self.entry_mut(handle)?.state = CommandBufferState::Initial;
            self.free(handle)?;
            return Err(err);
        }
        self.end_single_time_commands(backend, handle)
    }

    /// Raw buffers held by the recorder, live and pooled
    pub fn allocated(&self) -> usize {
        self.pools.values().map(SharedCommandPool::allocated).sum()
    }

    /// Free every command buffer; the device must be idle
    pub fn destroy_all<B: GpuBackend>(&mut self, backend: &mut B) {
        for (_, entry) in self.buffers.drain() {
            backend.free_command_buffer(entry.queue, entry.raw);
        }
        for (queue, pool) in &self.pools {
            for raw in pool.drain() {
                backend.free_command_buffer(*queue, raw);
            }
        }
    }
}

/// Appends commands to a recording buffer
#[derive(Debug)]
pub struct RecordingSession<'a> {
    commands: &'a mut Vec<Command>,
}

impl<'a> RecordingSession<'a> {
    /// Session over a bare command list, for recording checks without a backend
    #[cfg(test)]
    pub(crate) fn for_commands(commands: &'a mut Vec<Command>) -> Self {
        Self { commands }
    }

    /// Append any command
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Copy `size` bytes from the start of `src` to the start of `dst`
    pub fn copy_buffer(&mut self, src: RawBuffer, dst: RawBuffer, size: u64) {
        self.push(Command::CopyBuffer {
            src,
            dst,
            src_offset: 0,
            dst_offset: 0,
            size,
        });
    }

    /// Layout transition
    pub fn image_barrier(&mut self, barrier: ImageBarrier) {
        self.push(Command::ImageBarrier(barrier));
    }

    /// Begin a render pass; it ends when the returned guard drops
    pub fn begin_render_pass(
        &mut self,
        render_pass: RawRenderPass,
        framebuffer: RawFramebuffer,
        extent: Extent2D,
        clear_values: Vec<ClearValue>,
    ) -> ActiveRenderPass<'_> {
        self.push(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
            clear_values,
        });
        ActiveRenderPass {
            commands: &mut *self.commands,
        }
    }

    /// Commands recorded so far
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Render pass in progress
pub struct ActiveRenderPass<'a> {
    commands: &'a mut Vec<Command>,
}

impl<'a> ActiveRenderPass<'a> {
    /// Viewport and scissor covering `extent`
    pub fn set_viewport_scissor(&mut self, extent: Extent2D) {
        self.commands.push(Command::SetViewportScissor(extent));
    }

    /// Bind a graphics pipeline
    pub fn bind_pipeline(&mut self, pipeline: RawPipeline) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    /// Bind a binding set at `index`
    pub fn bind_binding_set(&mut self, pipeline: RawPipeline, index: u32, set: RawDescriptorSet) {
        self.commands.push(Command::BindBindingSet { pipeline, index, set });
    }

    /// Push constants at offset 0
    pub fn push_constants(&mut self, pipeline: RawPipeline, data: &[u8]) {
        self.commands.push(Command::PushConstants {
            pipeline,
            offset: 0,
            data: data.to_vec(),
        });
    }

    /// Bind the vertex buffer
    pub fn bind_vertex_buffer(&mut self, buffer: RawBuffer) {
        self.commands.push(Command::BindVertexBuffer { buffer, offset: 0 });
    }

    /// Bind a `u32` index buffer
    pub fn bind_index_buffer(&mut self, buffer: RawBuffer) {
        self.commands.push(Command::BindIndexBuffer { buffer, offset: 0 });
    }

    /// Non-indexed draw
    pub fn draw(&mut self, vertex_count: u32) {
        self.commands.push(Command::Draw {
            vertex_count,
            first_vertex: 0,
        });
    }

    /// Indexed draw
    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32) {
        self.commands.push(Command::DrawIndexed {
            index_count,
            first_index,
            vertex_offset: 0,
        });
    }
}

impl Drop for ActiveRenderPass<'_> {
    fn drop(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::HeadlessBackend;

    #[test]
    fn test_state_machine_transitions() {
        let mut backend = HeadlessBackend::default();
        let mut recorder = CommandRecorder::new();
        let handle = recorder.allocate(&mut backend, QueueKind::Graphics).unwrap();
        assert_eq!(recorder.state(handle).unwrap(), CommandBufferState::Initial);

        assert!(recorder.end(&mut backend, handle).is_err());
        recorder.begin(handle).unwrap();
        assert!(recorder.begin(handle).is_err());
        assert_eq!(recorder.state(handle).unwrap(), CommandBufferState::Recording);

        recorder.end(&mut backend, handle).unwrap();
        assert_eq!(recorder.state(handle).unwrap(), CommandBufferState::Executable);
        assert!(recorder.begin(handle).is_err());

        let fence = backend.create_fence(false).unwrap();
        recorder
            .submit(
                &mut backend,
                &[handle],
                SubmitInfo {
                    fence: Some(fence),
                    ..SubmitInfo::default()
                },
            )
            .unwrap();
        assert_eq!(recorder.state(handle).unwrap(), CommandBufferState::Pending);
        assert!(recorder.begin(handle).is_err());
        assert!(recorder.free(handle).is_err());

        backend.wait_for_fence(fence, u64::MAX).unwrap();
        recorder.retire(handle).unwrap();
        assert_eq!(recorder.state(handle).unwrap(), CommandBufferState::Initial);
        recorder.free(handle).unwrap();
        assert!(matches!(recorder.state(handle), Err(RenderError::StaleHandle { .. })));
    }

    #[test]
    fn test_discard_abandons_a_recording() {
        let mut backend = HeadlessBackend::default();
        let mut recorder = CommandRecorder::new();
        let handle = recorder.allocate(&mut backend, QueueKind::Graphics).unwrap();

        recorder.begin(handle).unwrap();
        recorder.session(handle).unwrap().push(Command::Draw { vertex_count: 3, first_vertex: 0 });
        assert!(recorder.retire(handle).is_err());
        recorder.discard(handle).unwrap();
        assert_eq!(recorder.state(handle).unwrap(), CommandBufferState::Initial);
        assert!(recorder.commands(handle).unwrap().is_empty());

        recorder.begin(handle).unwrap();
        recorder.end(&mut backend, handle).unwrap();
        let fence = backend.create_fence(false).unwrap();
        recorder
            .submit(
                &mut backend,
                &[handle],
                SubmitInfo {
                    fence: Some(fence),
                    ..SubmitInfo::default()
                },
            )
            .unwrap();
        assert!(recorder.discard(handle).is_err());
        backend.wait_for_fence(fence, u64::MAX).unwrap();
    }

    #[test]
    fn test_render_pass_guard_ends_pass() {
        let mut backend = HeadlessBackend::default();
        let mut recorder = CommandRecorder::new();
        let handle = recorder.allocate(&mut backend, QueueKind::Graphics).unwrap();
        recorder.begin(handle).unwrap();
        {
            let mut session = recorder.session(handle).unwrap();
            let mut pass = session.begin_render_pass(
                RawRenderPass(1),
                RawFramebuffer(2),
                Extent2D::new(4, 4),
                vec![ClearValue::Color([0.0; 4])],
            );
            pass.draw(3);
        }
        let commands = recorder.commands(handle).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[2], Command::EndRenderPass);
    }

    #[test]
    fn test_single_shot_waits_and_recycles() {
        let mut backend = HeadlessBackend::default();
        let mut recorder = CommandRecorder::new();
        for _ in 0..3 {
            recorder
                .single_shot(&mut backend, QueueKind::Transfer, |session| {
                    session.push(Command::SetViewportScissor(Extent2D::new(1, 1)));
                    assert_eq!(session.len(), 1);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(backend.pending_operations(), 0);
        assert_eq!(backend.stats().submissions, 3);
        assert_eq!(backend.stats().queue_idle_waits, 3);
        assert_eq!(recorder.allocated(), 1);
    }

    #[test]
    fn test_failed_recording_releases_buffer() {
        let mut backend = HeadlessBackend::default();
        let mut recorder = CommandRecorder::new();
        let result = recorder.single_shot(&mut backend, QueueKind::Graphics, |_| {
            Err(RenderError::invalid_operation("nothing to record"))
        });
        assert!(result.is_err());
        assert_eq!(backend.stats().submissions, 0);
        assert_eq!(recorder.allocated(), 1);
    }

    #[test]
    fn test_submission_rejects_mixed_queues() {
        let mut backend = HeadlessBackend::default();
        let mut recorder = CommandRecorder::new();
        let graphics = recorder.begin_single_time_commands(&mut backend, QueueKind::Graphics).unwrap();
        let transfer = recorder.begin_single_time_commands(&mut backend, QueueKind::Transfer).unwrap();
        recorder.end(&mut backend, graphics).unwrap();
        recorder.end(&mut backend, transfer).unwrap();

        let err = recorder
            .submit(&mut backend, &[graphics, transfer], SubmitInfo::default())
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidOperation { .. }));
        assert_eq!(recorder.state(graphics).unwrap(), CommandBufferState::Executable);
    }
}
