//! Command buffer recording and submission

pub mod recorder;
pub mod shared_pool;

pub use recorder::{ActiveRenderPass, CommandBufferHandle, CommandBufferState, CommandRecorder, RecordingSession};
pub use shared_pool::SharedCommandPool;
