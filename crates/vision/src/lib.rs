//! Vein-scanner core: persisted capture parameters, the CLAHE frame
//! processor, and the capture lifecycle that drives a camera through them.

pub mod params;
pub mod pipeline;
pub mod processing;

pub use params::{CaptureParameters, ParamError, ParamStore};
pub use pipeline::{
    CaptureLifecycle, FrameDisplay, FrameSink, LifecycleSettings, NullDisplay, ScanState,
    ShutdownOutcome,
};
pub use processing::{process_frame, ProcessingError};
