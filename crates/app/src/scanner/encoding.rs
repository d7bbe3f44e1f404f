//! JPEG encoding for the web stream, the snapshot display and offline processing.

use anyhow::{anyhow, Result};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use video_ingest::{Frame, FrameFormat};

/// Reorder a frame's samples into an RGB image.
pub(crate) fn frame_to_rgb(frame: &Frame) -> Result<RgbImage> {
    let data = match frame.format {
        FrameFormat::Bgr8 => frame
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
        FrameFormat::Gray8 => frame.data.iter().flat_map(|&v| [v, v, v]).collect(),
    };
    RgbImage::from_raw(frame.width, frame.height, data).ok_or_else(|| {
        anyhow!(
            "frame buffer does not match {}x{} {:?}",
            frame.width,
            frame.height,
            frame.format
        )
    })
}

/// Inverse of [`frame_to_rgb`]: wrap an RGB image as a BGR frame.
pub(crate) fn rgb_to_frame(image: &RgbImage) -> Result<Frame> {
    let data = image
        .as_raw()
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    Frame::from_raw(image.width(), image.height(), FrameFormat::Bgr8, data)
        .map_err(|err| anyhow!("invalid image buffer: {err}"))
}

pub(crate) fn encode_jpeg(frame: &Frame, jpeg_quality: u8) -> Result<Vec<u8>> {
    let rgb = frame_to_rgb(frame)?;
    let mut buffer = Vec::new();
    let quality = jpeg_quality.clamp(1, 100);
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&rgb)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}
