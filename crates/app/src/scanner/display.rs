//! Headless stand-in for the local preview window.
//!
//! Frames are counted and, when a snapshot path is configured, the latest one
//! is written there as a JPEG (rate-limited, blank frames always written).

use std::{
    fs,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use video_ingest::Frame;
use vision::FrameDisplay;

use super::encoding::encode_jpeg;

const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(500);
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct HeadlessDisplay {
    snapshot: Option<PathBuf>,
    jpeg_quality: u8,
    last_snapshot: Option<Instant>,
    shown: u64,
    window_started: Instant,
    window_frames: u64,
}

impl HeadlessDisplay {
    pub(crate) fn new(snapshot: Option<PathBuf>, jpeg_quality: u8) -> Self {
        Self {
            snapshot,
            jpeg_quality,
            last_snapshot: None,
            shown: 0,
            window_started: Instant::now(),
            window_frames: 0,
        }
    }

    fn write_snapshot(&self, frame: &Frame) -> Result<()> {
        let Some(path) = self.snapshot.as_ref() else {
            return Ok(());
        };
        let jpeg = encode_jpeg(frame, self.jpeg_quality)?;
        let tmp = path.with_extension("jpg.tmp");
        fs::write(&tmp, jpeg).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn snapshot_due(&self, frame: &Frame) -> bool {
        self.snapshot.is_some()
            && (frame.is_blank()
                || self
                    .last_snapshot
                    .map_or(true, |at| at.elapsed() >= SNAPSHOT_INTERVAL))
    }
}

impl FrameDisplay for HeadlessDisplay {
    fn show_frame(&mut self, frame: &Frame) {
        self.shown += 1;
        self.window_frames += 1;
        let elapsed = self.window_started.elapsed();
        if elapsed >= REPORT_INTERVAL {
            let fps = self.window_frames as f64 / elapsed.as_secs_f64();
            debug!(frames = self.shown, fps, "Display refreshed");
            self.window_started = Instant::now();
            self.window_frames = 0;
        }

        if self.snapshot_due(frame) {
            if let Err(err) = self.write_snapshot(frame) {
                warn!("Snapshot failed: {err:#}");
            }
            self.last_snapshot = Some(Instant::now());
        }
    }
}
