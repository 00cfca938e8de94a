//! Foundation module - math types and logging utilities shared by every layer

pub mod logging;
pub mod math;
