//! V4L2 capture through an `ffmpeg` child process.
//!
//! ffmpeg writes raw frames to stdout; a reader thread slices them into
//! [`Frame`]s and keeps only the newest few in a small bounded queue. The
//! reader never blocks on the consumer, so an idle camera keeps draining the
//! pipe and exits as soon as the child is killed. Controls that V4L2 allows to
//! change mid-stream (gain, exposure) are applied with `v4l2-ctl`.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};

use crate::{
    parse_device_index,
    types::{CameraProperty, CaptureError, Frame, FrameFormat},
    CameraDevice, CaptureSettings, PixelFormat,
};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(3);
const QUEUE_SIZE: usize = 2;

type FrameResult = Result<Frame, CaptureError>;

pub struct FfmpegCamera {
    device: String,
    child: Option<Child>,
    frames: Receiver<FrameResult>,
    reader: Option<thread::JoinHandle<()>>,
    pending: Option<Frame>,
    frame_interval: Duration,
}

impl FfmpegCamera {
    /// Start ffmpeg on the device and wait for the first frame, so that a
    /// missing or busy device is reported as an open failure.
    pub fn open(uri: &str, settings: CaptureSettings) -> Result<Self, CaptureError> {
        let device = device_path(uri);
        let mut cmd = build_command(&device, settings);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|err| {
            warn!("video-ingest: failed to spawn ffmpeg for {device}: {err}");
            CaptureError::Open {
                uri: uri.to_string(),
            }
        })?;
        let mut camera = Self::from_child(
            device,
            child,
            (settings.width, settings.height),
            output_format(settings.pixel_format),
            settings.fps,
        )?;

        match camera.frames.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(frame)) => camera.pending = Some(frame),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "video-ingest: no frame from {} within {:?}; continuing",
                    camera.device, STARTUP_TIMEOUT
                );
            }
            Ok(Err(err)) => {
                debug!("video-ingest: ffmpeg failed on {}: {err}", camera.device);
                camera.release();
                return Err(CaptureError::Open {
                    uri: uri.to_string(),
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                camera.release();
                return Err(CaptureError::Open {
                    uri: uri.to_string(),
                });
            }
        }

        Ok(camera)
    }

    /// Attach a reader thread to an already spawned child writing raw frames
    /// of `geometry` and `format` to its stdout.
    fn from_child(
        device: String,
        mut child: Child,
        geometry: (u32, u32),
        format: FrameFormat,
        fps: f64,
    ) -> Result<Self, CaptureError> {
        let stdout: ChildStdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };

        let (tx, rx) = bounded(QUEUE_SIZE);
        let queue = LatestFrames {
            tx,
            rx: rx.clone(),
        };
        let reader = thread::Builder::new()
            .name("ffmpeg-reader".into())
            .spawn(move || {
                if let Err(err) = ffmpeg_loop(stdout, geometry, format, &queue) {
                    queue.push(Err(err));
                }
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        Ok(Self {
            device,
            child: Some(child),
            frames: rx,
            reader: Some(reader),
            pending: None,
            frame_interval: Duration::from_secs_f64(1.0 / fps.max(1.0)),
        })
    }

    /// Drop queued frames; they were captured under the previous controls.
    fn discard_queued(&mut self) {
        self.pending = None;
        while self.frames.try_recv().is_ok() {}
    }
}

/// Bounded queue where a full push evicts the oldest entry.
struct LatestFrames {
    tx: Sender<FrameResult>,
    rx: Receiver<FrameResult>,
}

impl LatestFrames {
    fn push(&self, mut item: FrameResult) {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    let _ = self.rx.try_recv();
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl CameraDevice for FfmpegCamera {
    fn set_property(&mut self, property: CameraProperty, value: f64) -> Result<(), CaptureError> {
        let control = v4l2_control(property).ok_or_else(|| CaptureError::Property {
            property,
            reason: "fixed when the ffmpeg stream is opened".into(),
        })?;
        let output = Command::new("v4l2-ctl")
            .arg("-d")
            .arg(&self.device)
            .arg(format!("--set-ctrl={control}={}", value.round() as i64))
            .output()
            .map_err(|err| CaptureError::Property {
                property,
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(CaptureError::Property {
                property,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.discard_queued();
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        match self.frames.recv_timeout(READ_TIMEOUT) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout(READ_TIMEOUT)),
            Err(RecvTimeoutError::Disconnected) => {
                // The reader is gone; pace retries at the frame rate.
                thread::sleep(self.frame_interval);
                Err(CaptureError::Read("ffmpeg stream closed".into()))
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.discard_queued();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.release();
    }
}

fn device_path(uri: &str) -> String {
    match parse_device_index(uri) {
        Some(index) => format!("/dev/video{index}"),
        None => uri.to_string(),
    }
}

fn output_format(pixel_format: PixelFormat) -> FrameFormat {
    match pixel_format {
        PixelFormat::Grey => FrameFormat::Gray8,
        PixelFormat::Mjpeg => FrameFormat::Bgr8,
    }
}

fn v4l2_control(property: CameraProperty) -> Option<&'static str> {
    match property {
        CameraProperty::AutoExposure => Some("auto_exposure"),
        CameraProperty::Gain => Some("gain"),
        CameraProperty::Exposure => Some("exposure"),
        CameraProperty::FrameWidth | CameraProperty::FrameHeight | CameraProperty::Fps => None,
    }
}

pub(crate) fn build_command(device: &str, settings: CaptureSettings) -> Command {
    let (input_format, pix_fmt) = match settings.pixel_format {
        PixelFormat::Grey => ("gray", "gray"),
        PixelFormat::Mjpeg => ("mjpeg", "bgr24"),
    };
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-f")
        .arg("video4linux2")
        .arg("-input_format")
        .arg(input_format)
        .arg("-video_size")
        .arg(format!("{}x{}", settings.width, settings.height))
        .arg("-framerate")
        .arg(format!("{}", settings.fps))
        .arg("-i")
        .arg(device)
        .arg("-pix_fmt")
        .arg(pix_fmt)
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    (width, height): (u32, u32),
    format: FrameFormat,
    queue: &LatestFrames,
) -> Result<(), CaptureError> {
    let frame_bytes = width as usize * height as usize * format.channels();
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        stdout
            .read_exact(&mut buffer)
            .map_err(|err| CaptureError::Read(err.to_string()))?;
        let frame = Frame::from_raw(width, height, format, buffer.clone())?;
        queue.push(Ok(frame));
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn command_requests_geometry_and_raw_output() {
        let cmd = build_command("/dev/video0", CaptureSettings::default());
        let args: Vec<String> = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-f video4linux2"));
        assert!(joined.contains("-input_format gray"));
        assert!(joined.contains("-video_size 1280x960"));
        assert!(joined.contains("-framerate 30"));
        assert!(joined.ends_with("-pix_fmt gray -f rawvideo -"));
    }

    #[test]
    fn mjpeg_streams_decode_to_bgr() {
        let settings = CaptureSettings {
            pixel_format: PixelFormat::Mjpeg,
            ..CaptureSettings::default()
        };
        let cmd = build_command("/dev/video1", settings);
        let args: Vec<String> = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "bgr24"));
        assert_eq!(output_format(PixelFormat::Mjpeg), FrameFormat::Bgr8);
    }

    #[test]
    fn device_indices_map_to_dev_nodes() {
        assert_eq!(device_path("2"), "/dev/video2");
        assert_eq!(device_path("/dev/video0"), "/dev/video0");
    }

    #[test]
    fn reader_slices_stdout_into_frames() {
        let bytes: Vec<u8> = (0..12).collect();
        let (tx, rx) = bounded(4);
        let queue = LatestFrames { tx, rx: rx.clone() };
        let result = ffmpeg_loop(Cursor::new(bytes), (3, 2), FrameFormat::Gray8, &queue);
        assert!(matches!(result, Err(CaptureError::Read(_))));
        let first = rx.try_recv().unwrap().unwrap();
        let second = rx.try_recv().unwrap().unwrap();
        assert_eq!(first.data, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(second.data, vec![6, 7, 8, 9, 10, 11]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_keeps_the_newest_frames() {
        let (tx, rx) = bounded(2);
        let queue = LatestFrames { tx, rx: rx.clone() };
        for value in 0..5u8 {
            queue.push(Ok(Frame::from_raw(1, 1, FrameFormat::Gray8, vec![value]).unwrap()));
        }
        let kept: Vec<u8> = rx.try_iter().map(|f| f.unwrap().data[0]).collect();
        assert_eq!(kept, vec![3, 4]);
    }

    #[cfg(unix)]
    fn raw_child(program: &str, args: &[&str]) -> FfmpegCamera {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        FfmpegCamera::from_child("test".into(), child, (4, 4), FrameFormat::Gray8, 100.0).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn release_returns_while_frames_go_unread() {
        let mut camera = raw_child("cat", &["/dev/zero"]);
        thread::sleep(Duration::from_millis(200));

        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            camera.release();
            let _ = done_tx.send(camera.reader.is_none() && camera.child.is_none());
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(3)), Ok(true));
    }

    #[cfg(unix)]
    #[test]
    fn stream_end_reports_read_errors_until_released() {
        // Two 16-byte frames, then EOF.
        let mut camera = raw_child("head", &["-c", "32", "/dev/zero"]);
        thread::sleep(Duration::from_millis(200));

        let frame = camera.read_frame().unwrap();
        assert_eq!((frame.width, frame.height), (4, 4));
        for _ in 0..3 {
            assert!(matches!(camera.read_frame(), Err(CaptureError::Read(_))));
        }
        camera.release();
    }

    #[test]
    fn stream_geometry_controls_are_rejected_after_open() {
        assert_eq!(v4l2_control(CameraProperty::FrameWidth), None);
        assert_eq!(v4l2_control(CameraProperty::Gain), Some("gain"));
    }
}
