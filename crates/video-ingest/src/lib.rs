//! Camera capture backends producing raw [`Frame`]s.
//!
//! Every backend implements [`CameraDevice`], a small blocking interface
//! (set a property, read one frame, release) that the capture lifecycle drives
//! from its own thread. The device is never shared between threads.

mod ffmpeg;
mod synthetic;
mod types;

#[cfg(feature = "opencv")]
mod camera;

pub use ffmpeg::FfmpegCamera;
pub use synthetic::SyntheticCamera;
pub use types::{CameraProperty, CaptureError, Frame, FrameFormat};

#[cfg(feature = "opencv")]
pub use camera::OpenCvCamera;

/// Blocking camera handle owned by a single capture thread.
pub trait CameraDevice: Send {
    /// Apply a device control. Failures are advisory: callers log them and
    /// keep capturing with whatever settings took effect.
    fn set_property(&mut self, property: CameraProperty, value: f64) -> Result<(), CaptureError>;

    /// Pull the next frame, blocking for at most the backend's read timeout.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Release the underlying device. Calling it more than once is harmless.
    fn release(&mut self);
}

impl<T: CameraDevice + ?Sized> CameraDevice for Box<T> {
    fn set_property(&mut self, property: CameraProperty, value: f64) -> Result<(), CaptureError> {
        (**self).set_property(property, value)
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).read_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Pixel format requested from the sensor at open time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit mono (V4L2 `GREY`).
    Grey,
    /// Motion JPEG, decoded to BGR.
    Mjpeg,
}

impl PixelFormat {
    pub fn fourcc(self) -> [char; 4] {
        match self {
            PixelFormat::Grey => ['G', 'R', 'E', 'Y'],
            PixelFormat::Mjpeg => ['M', 'J', 'P', 'G'],
        }
    }
}

/// Stream geometry requested when the device is opened.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pixel_format: PixelFormat,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 960,
            fps: 30.0,
            pixel_format: PixelFormat::Grey,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraBackend {
    /// `ffmpeg` reading a V4L2 device, controls via `v4l2-ctl`.
    Ffmpeg,
    /// OpenCV `VideoCapture` (requires the `opencv` feature).
    OpenCv,
    /// Generated test pattern.
    Synthetic,
}

impl CameraBackend {
    /// Pick a backend from the source string when none was requested.
    pub fn from_uri(uri: &str) -> Self {
        if uri == "synthetic" || uri.starts_with("synthetic:") {
            CameraBackend::Synthetic
        } else {
            CameraBackend::Ffmpeg
        }
    }
}

/// Everything needed to open a camera.
#[derive(Clone, Debug)]
pub struct CameraSpec {
    pub uri: String,
    pub backend: CameraBackend,
    pub settings: CaptureSettings,
}

/// Open the camera described by `spec`.
pub fn open_camera(spec: &CameraSpec) -> Result<Box<dyn CameraDevice>, CaptureError> {
    match spec.backend {
        CameraBackend::Ffmpeg => Ok(Box::new(FfmpegCamera::open(&spec.uri, spec.settings)?)),
        CameraBackend::Synthetic => Ok(Box::new(SyntheticCamera::new(spec.settings))),
        #[cfg(feature = "opencv")]
        CameraBackend::OpenCv => Ok(Box::new(OpenCvCamera::open(&spec.uri, spec.settings)?)),
        #[cfg(not(feature = "opencv"))]
        CameraBackend::OpenCv => Err(CaptureError::Other(anyhow::anyhow!(
            "built without the `opencv` feature; cannot open {:?}",
            spec.uri
        ))),
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}
