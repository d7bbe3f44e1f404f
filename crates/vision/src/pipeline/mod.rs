//! Capture lifecycle and the sink interfaces it forwards frames to.

mod lifecycle;
mod sink;

pub use lifecycle::{CaptureLifecycle, LifecycleSettings, ScanState, ShutdownOutcome};
pub use sink::{FrameDisplay, FrameSink, NullDisplay};
