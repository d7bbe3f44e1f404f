//! Frame processing: the CLAHE contrast pipeline applied to every captured
//! frame, plus the small per-frame helpers the capture loop needs.

mod clahe;
mod color;

use image::{imageops, GrayImage, RgbImage};
use imageproc::filter::median_filter;
use thiserror::Error;
use video_ingest::{Frame, FrameFormat};

use crate::params::CaptureParameters;

pub use clahe::Clahe;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("expected a BGR frame, got {0:?}")]
    Format(FrameFormat),
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height}")]
    Geometry {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("invalid processing parameters: {0}")]
    Parameters(String),
}

/// Run the CLAHE pipeline on a BGR frame.
///
/// The frame is converted to L*a*b*, the L channel is equalized
/// `params.iterations` times (each pass works on the previous pass' output),
/// the three channels are recombined and median-blurred together with a 3x3
/// kernel, and the result is converted back to BGR.
pub fn apply(frame: &Frame, params: &CaptureParameters) -> Result<Frame, ProcessingError> {
    if frame.format != FrameFormat::Bgr8 {
        return Err(ProcessingError::Format(frame.format));
    }
    check_geometry(frame)?;
    params.validate().map_err(ProcessingError::Parameters)?;

    let (width, height) = (frame.width, frame.height);
    let lab = color::bgr_to_lab(&frame.data);

    let luminance: Vec<u8> = lab.chunks_exact(3).map(|px| px[0]).collect();
    let mut luminance = gray_image(width, height, luminance)?;
    let clahe = Clahe::new(params.clip_limit, params.tile_grid_size);
    for _ in 0..params.iterations {
        luminance = clahe.apply(&luminance);
    }

    let mut merged = lab;
    for (px, &l) in merged.chunks_exact_mut(3).zip(luminance.as_raw()) {
        px[0] = l;
    }
    let merged = rgb_image(width, height, merged)?;
    let blurred = median_filter(&merged, 1, 1);

    Ok(Frame {
        data: color::lab_to_bgr(blurred.as_raw()),
        width,
        height,
        timestamp_ms: frame.timestamp_ms,
        format: FrameFormat::Bgr8,
    })
}

/// Per-frame work done by the capture loop: upconvert mono frames, apply the
/// CLAHE pipeline, and invert when requested.
pub fn process_frame(frame: Frame, params: &CaptureParameters) -> Result<Frame, ProcessingError> {
    check_geometry(&frame)?;
    let frame = frame.into_bgr();
    let mut processed = apply(&frame, params)?;
    if params.invert_colors {
        processed.invert();
    }
    Ok(processed)
}

/// Scale a BGR frame to `width`x`height`.
pub fn resize_frame(frame: &Frame, width: u32, height: u32) -> Result<Frame, ProcessingError> {
    if frame.format != FrameFormat::Bgr8 {
        return Err(ProcessingError::Format(frame.format));
    }
    if (frame.width, frame.height) == (width, height) {
        return Ok(frame.clone());
    }
    // Channel order is irrelevant to the resampler.
    let image = rgb_image(frame.width, frame.height, frame.data.clone())?;
    let resized = imageops::resize(&image, width, height, imageops::FilterType::Triangle);
    Ok(Frame {
        data: resized.into_raw(),
        width,
        height,
        timestamp_ms: frame.timestamp_ms,
        format: FrameFormat::Bgr8,
    })
}

fn check_geometry(frame: &Frame) -> Result<(), ProcessingError> {
    let expected = frame.width as usize * frame.height as usize * frame.channels();
    if frame.data.len() != expected {
        return Err(ProcessingError::Geometry {
            width: frame.width,
            height: frame.height,
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

fn gray_image(width: u32, height: u32, data: Vec<u8>) -> Result<GrayImage, ProcessingError> {
    let actual = data.len();
    GrayImage::from_raw(width, height, data).ok_or(ProcessingError::Geometry {
        width,
        height,
        expected: width as usize * height as usize,
        actual,
    })
}

fn rgb_image(width: u32, height: u32, data: Vec<u8>) -> Result<RgbImage, ProcessingError> {
    let actual = data.len();
    RgbImage::from_raw(width, height, data).ok_or(ProcessingError::Geometry {
        width,
        height,
        expected: width as usize * height as usize * 3,
        actual,
    })
}
