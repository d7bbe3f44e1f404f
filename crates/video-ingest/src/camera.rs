//! OpenCV-backed camera capture.

use anyhow::anyhow;
use opencv::{
    core::{Mat, MatTraitConst, MatTraitConstManual},
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    parse_device_index,
    types::{CameraProperty, CaptureError, Frame, FrameFormat},
    CameraDevice, CaptureSettings,
};

pub struct OpenCvCamera {
    cap: VideoCapture,
    frame: Mat,
    released: bool,
}

impl OpenCvCamera {
    /// Open by index or URI, preferring the V4L2 backend, and request the
    /// configured pixel format, geometry, and frame rate.
    pub fn open(uri: &str, settings: CaptureSettings) -> Result<Self, CaptureError> {
        let mut cap = open_video_capture(uri)?;
        configure_camera(&mut cap, settings);
        Ok(Self {
            cap,
            frame: Mat::default(),
            released: false,
        })
    }
}

impl CameraDevice for OpenCvCamera {
    fn set_property(&mut self, property: CameraProperty, value: f64) -> Result<(), CaptureError> {
        let id = match property {
            CameraProperty::FrameWidth => videoio::CAP_PROP_FRAME_WIDTH,
            CameraProperty::FrameHeight => videoio::CAP_PROP_FRAME_HEIGHT,
            CameraProperty::Fps => videoio::CAP_PROP_FPS,
            CameraProperty::AutoExposure => videoio::CAP_PROP_AUTO_EXPOSURE,
            CameraProperty::Gain => videoio::CAP_PROP_GAIN,
            CameraProperty::Exposure => videoio::CAP_PROP_EXPOSURE,
        };
        match self.cap.set(id, value) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CaptureError::Property {
                property,
                reason: "backend reported the property as unsupported".into(),
            }),
            Err(err) => Err(CaptureError::Property {
                property,
                reason: err.to_string(),
            }),
        }
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        if !grabbed || self.frame.empty() {
            return Err(CaptureError::Read("empty frame".into()));
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        let format = match self.frame.channels() {
            1 => FrameFormat::Gray8,
            3 => FrameFormat::Bgr8,
            other => {
                return Err(CaptureError::Other(anyhow!(
                    "unsupported channel count {other}"
                )))
            }
        };
        let owned;
        let mat = if self.frame.is_continuous() {
            &self.frame
        } else {
            owned = self
                .frame
                .try_clone()
                .map_err(|e| CaptureError::Read(e.to_string()))?;
            &owned
        };
        let data = mat
            .data_bytes()
            .map_err(|e| CaptureError::Read(e.to_string()))?
            .to_vec();

        Frame::from_raw(size.width as u32, size.height as u32, format, data)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.cap.release() {
            warn!("video-ingest: failed to release capture: {err}");
        }
    }
}

impl Drop for OpenCvCamera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L2, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    debug!("video-ingest: failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L2, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                debug!("video-ingest: failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply open-time capture settings. Rejections are logged; the camera keeps
/// whatever mode it negotiated.
fn configure_camera(cap: &mut VideoCapture, settings: CaptureSettings) {
    let [a, b, c, d] = settings.pixel_format.fourcc();
    match videoio::VideoWriter::fourcc(a, b, c, d) {
        Ok(fourcc) => {
            if !matches!(cap.set(videoio::CAP_PROP_FOURCC, fourcc as f64), Ok(true)) {
                warn!("video-ingest: camera refused pixel format {a}{b}{c}{d}");
            }
        }
        Err(err) => warn!("video-ingest: invalid fourcc {a}{b}{c}{d}: {err}"),
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, settings.width as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, settings.height as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, settings.fps);
}
