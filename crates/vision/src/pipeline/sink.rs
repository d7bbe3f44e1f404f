use video_ingest::Frame;

/// Local preview owned by the capture thread. Fire-and-forget.
pub trait FrameDisplay: Send {
    fn show_frame(&mut self, frame: &Frame);
}

/// Consumer that can be linked to and unlinked from a running capture loop,
/// e.g. the web stream. Implementations must tolerate concurrent calls.
pub trait FrameSink: Send + Sync {
    /// Whether the sink currently accepts frames. Dead sinks are skipped.
    fn is_alive(&self) -> bool;

    /// Replace whatever the sink holds with `frame`. Must not block for long.
    fn update(&self, frame: &Frame);
}

/// Display that drops every frame.
#[derive(Debug, Default)]
pub struct NullDisplay;

impl FrameDisplay for NullDisplay {
    fn show_frame(&mut self, _frame: &Frame) {}
}
