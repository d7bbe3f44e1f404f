use std::{fmt, time::Duration};

use anyhow::Error;
use chrono::Utc;
use thiserror::Error;

/// Raw 8-bit frame captured from a camera or produced by the processing stage.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

/// Sample layout of a [`Frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// Single-channel luminance, as delivered by mono NIR sensors.
    Gray8,
    /// Interleaved blue/green/red.
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Gray8 => 1,
            FrameFormat::Bgr8 => 3,
        }
    }
}

impl Frame {
    /// Wrap a raw buffer, checking that its length matches the geometry.
    pub fn from_raw(
        width: u32,
        height: u32,
        format: FrameFormat,
        data: Vec<u8>,
    ) -> Result<Self, CaptureError> {
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            return Err(CaptureError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format,
        })
    }

    /// All-black BGR frame used to clear sinks when a scan stops.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; width as usize * height as usize * 3],
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&sample| sample == 0)
    }

    /// Upconvert a single-channel frame to BGR by replicating the luminance.
    /// BGR frames are returned unchanged.
    pub fn into_bgr(self) -> Self {
        match self.format {
            FrameFormat::Bgr8 => self,
            FrameFormat::Gray8 => {
                let mut data = Vec::with_capacity(self.data.len() * 3);
                for &luma in &self.data {
                    data.extend_from_slice(&[luma, luma, luma]);
                }
                Self {
                    data,
                    format: FrameFormat::Bgr8,
                    ..self
                }
            }
        }
    }

    /// Bitwise complement of every sample.
    pub fn invert(&mut self) {
        for sample in &mut self.data {
            *sample = !*sample;
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Camera controls understood by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraProperty {
    FrameWidth,
    FrameHeight,
    Fps,
    AutoExposure,
    Gain,
    Exposure,
}

impl CameraProperty {
    pub fn label(self) -> &'static str {
        match self {
            CameraProperty::FrameWidth => "frame_width",
            CameraProperty::FrameHeight => "frame_height",
            CameraProperty::Fps => "fps",
            CameraProperty::AutoExposure => "auto_exposure",
            CameraProperty::Gain => "gain",
            CameraProperty::Exposure => "exposure",
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("camera rejected {}: {reason}", property.label())]
    Property {
        property: CameraProperty,
        reason: String,
    },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Errors that only affect the current read; the caller should retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::Timeout(_) | CaptureError::Read(_) | CaptureError::BufferSize { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_rejects_mismatched_buffers() {
        let err = Frame::from_raw(4, 2, FrameFormat::Bgr8, vec![0; 8]).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::BufferSize {
                expected: 24,
                actual: 8
            }
        ));
    }

    #[test]
    fn gray_frames_upconvert_by_replicating_luma() {
        let frame = Frame::from_raw(2, 1, FrameFormat::Gray8, vec![10, 200]).unwrap();
        let bgr = frame.into_bgr();
        assert_eq!(bgr.format, FrameFormat::Bgr8);
        assert_eq!(bgr.data, vec![10, 10, 10, 200, 200, 200]);
    }

    #[test]
    fn invert_complements_every_sample() {
        let mut frame = Frame::from_raw(1, 1, FrameFormat::Bgr8, vec![0, 127, 255]).unwrap();
        frame.invert();
        assert_eq!(frame.data, vec![255, 128, 0]);
    }

    #[test]
    fn blank_frames_are_black_bgr() {
        let frame = Frame::blank(3, 2);
        assert_eq!(frame.data.len(), 18);
        assert!(frame.is_blank());
        assert_eq!(frame.format, FrameFormat::Bgr8);
    }

    #[test]
    fn read_failures_are_transient_but_open_is_not() {
        assert!(CaptureError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(CaptureError::Read("eof".into()).is_transient());
        assert!(!CaptureError::Open { uri: "0".into() }.is_transient());
    }
}
