//! Single-image enhancement with the same pipeline the live scan uses.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use vision::{process_frame, CaptureParameters};

use super::encoding::{frame_to_rgb, rgb_to_frame};

pub(crate) fn process_file(input: &Path, output: &Path, params: &CaptureParameters) -> Result<()> {
    let image = image::open(input)
        .with_context(|| format!("Failed to read {}", input.display()))?
        .to_rgb8();
    let frame = rgb_to_frame(&image)?;
    let processed = process_frame(frame, params)
        .with_context(|| format!("Failed to process {}", input.display()))?;
    frame_to_rgb(&processed)?
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        width = processed.width,
        height = processed.height,
        "Wrote {}",
        output.display()
    );
    Ok(())
}
