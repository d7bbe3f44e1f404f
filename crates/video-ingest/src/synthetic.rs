//! Generated NIR-like test pattern for running the scanner without a sensor.

use std::{
    thread,
    time::{Duration, Instant},
};

use crate::{
    types::{CameraProperty, CaptureError, Frame, FrameFormat},
    CameraDevice, CaptureSettings,
};

/// Mono camera producing a bright background crossed by darker, slowly
/// drifting vein-like bands. Frames are paced at the requested frame rate.
pub struct SyntheticCamera {
    settings: CaptureSettings,
    gain: f64,
    exposure: f64,
    frame_index: u64,
    next_deadline: Option<Instant>,
    released: bool,
}

impl SyntheticCamera {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            gain: 10.0,
            exposure: 100.0,
            frame_index: 0,
            next_deadline: None,
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn brightness(&self) -> f64 {
        (90.0 + self.gain * 2.0 + self.exposure * 0.2).clamp(0.0, 235.0)
    }

    fn render(&self) -> Vec<u8> {
        let width = self.settings.width as usize;
        let height = self.settings.height as usize;
        let base = self.brightness();
        let phase = self.frame_index as f64 * 0.05;
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let fy = y as f64 / height.max(1) as f64;
            for x in 0..width {
                let fx = x as f64 / width.max(1) as f64;
                let centre_a = 0.35 + 0.08 * (fy * 6.0 + phase).sin();
                let centre_b = 0.65 + 0.05 * (fy * 9.0 - phase).cos();
                let vein = band(fx, centre_a, 0.025) + 0.7 * band(fx, centre_b, 0.018);
                let value = base * (1.0 - 0.45 * vein.min(1.0));
                data.push(value.round().clamp(0.0, 255.0) as u8);
            }
        }
        data
    }

    fn pace(&mut self) {
        let interval = Duration::from_secs_f64(1.0 / self.settings.fps.max(1.0));
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + interval);
    }
}

fn band(x: f64, centre: f64, half_width: f64) -> f64 {
    let d = (x - centre) / half_width;
    (-d * d).exp()
}

impl CameraDevice for SyntheticCamera {
    fn set_property(&mut self, property: CameraProperty, value: f64) -> Result<(), CaptureError> {
        match property {
            CameraProperty::Gain => self.gain = value,
            CameraProperty::Exposure => self.exposure = value,
            CameraProperty::Fps if value > 0.0 => self.settings.fps = value,
            CameraProperty::AutoExposure => {}
            CameraProperty::FrameWidth | CameraProperty::FrameHeight | CameraProperty::Fps => {
                return Err(CaptureError::Property {
                    property,
                    reason: "synthetic geometry is fixed at open".into(),
                });
            }
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.released {
            return Err(CaptureError::Read("camera released".into()));
        }
        self.pace();
        let data = self.render();
        self.frame_index = self.frame_index.wrapping_add(1);
        Frame::from_raw(
            self.settings.width,
            self.settings.height,
            FrameFormat::Gray8,
            data,
        )
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelFormat;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 40,
            height: 30,
            fps: 500.0,
            pixel_format: PixelFormat::Grey,
        }
    }

    #[test]
    fn frames_are_mono_with_visible_bands() {
        let mut camera = SyntheticCamera::new(settings());
        let frame = camera.read_frame().unwrap();
        assert_eq!(frame.format, FrameFormat::Gray8);
        let min = *frame.data.iter().min().unwrap();
        let max = *frame.data.iter().max().unwrap();
        assert!(max > min + 30, "expected contrast, got {min}..{max}");
    }

    #[test]
    fn gain_brightens_the_scene() {
        let mut camera = SyntheticCamera::new(settings());
        let dark = camera.read_frame().unwrap();
        camera.set_property(CameraProperty::Gain, 40.0).unwrap();
        let bright = camera.read_frame().unwrap();
        let mean = |f: &Frame| f.data.iter().map(|&v| v as u64).sum::<u64>() / f.data.len() as u64;
        assert!(mean(&bright) > mean(&dark));
    }

    #[test]
    fn released_camera_stops_producing() {
        let mut camera = SyntheticCamera::new(settings());
        camera.release();
        assert!(camera.is_released());
        assert!(camera.read_frame().unwrap_err().is_transient());
    }
}
