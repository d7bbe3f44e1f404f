use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use clap::{Args, ValueEnum};
use video_ingest::{CameraBackend, CameraSpec, CaptureSettings, PixelFormat};
use vision::LifecycleSettings;

/// Camera backend selectable from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Ffmpeg,
    Opencv,
    Synthetic,
}

impl From<BackendArg> for CameraBackend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Ffmpeg => CameraBackend::Ffmpeg,
            BackendArg::Opencv => CameraBackend::OpenCv,
            BackendArg::Synthetic => CameraBackend::Synthetic,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PixelFormatArg {
    Grey,
    Mjpeg,
}

impl From<PixelFormatArg> for PixelFormat {
    fn from(value: PixelFormatArg) -> Self {
        match value {
            PixelFormatArg::Grey => PixelFormat::Grey,
            PixelFormatArg::Mjpeg => PixelFormat::Mjpeg,
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Camera index, `/dev/videoN` path, or `synthetic`.
    #[arg(long = "source", value_name = "URI", default_value = "0")]
    pub source: String,
    /// Capture backend; inferred from the source when omitted.
    #[arg(long = "backend", value_enum)]
    pub backend: Option<BackendArg>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 1280)]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 960)]
    pub height: u32,
    /// Target capture frame rate.
    #[arg(long = "fps", default_value_t = 30.0)]
    pub fps: f64,
    /// Pixel format requested from the sensor.
    #[arg(long = "pixel-format", value_enum, default_value_t = PixelFormatArg::Grey)]
    pub pixel_format: PixelFormatArg,
    /// Directory holding `default_config.json` and `config.json`.
    #[arg(long = "config-dir", value_name = "DIR", default_value = ".")]
    pub config_dir: PathBuf,
    /// Address the web stream binds to.
    #[arg(long = "host", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long = "port", default_value_t = 5000)]
    pub port: u16,
    /// JPEG quality used for the web stream (1-100).
    #[arg(
        long = "jpeg-quality",
        value_name = "QUALITY",
        default_value_t = 85,
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    pub jpeg_quality: u8,
    /// Width of frames served on the web stream.
    #[arg(long = "stream-width", value_name = "PX", default_value_t = 1280)]
    pub stream_width: u32,
    /// Height of frames served on the web stream.
    #[arg(long = "stream-height", value_name = "PX", default_value_t = 960)]
    pub stream_height: u32,
    /// Start scanning as soon as the camera is ready.
    #[arg(long = "scan", action = clap::ArgAction::SetTrue)]
    pub scan: bool,
    /// Start the web stream at boot.
    #[arg(long = "web", action = clap::ArgAction::SetTrue)]
    pub web: bool,
    /// Do not read control commands from stdin.
    #[arg(long = "no-console", action = clap::ArgAction::SetTrue)]
    pub no_console: bool,
    /// Write the latest displayed frame to this JPEG file.
    #[arg(long = "snapshot", value_name = "PATH")]
    pub snapshot: Option<PathBuf>,
    /// How long to wait for the capture thread at shutdown.
    #[arg(long = "shutdown-timeout-ms", value_name = "MS", default_value_t = 2000)]
    pub shutdown_timeout_ms: u64,
}

/// Validated configuration shared by every scanner component.
#[derive(Clone, Debug)]
pub struct ScannerConfig {
    pub camera: CameraSpec,
    pub config_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub jpeg_quality: u8,
    pub stream_size: (u32, u32),
    pub stream_poll: Duration,
    pub autostart_scan: bool,
    pub autostart_web: bool,
    pub console: bool,
    pub snapshot: Option<PathBuf>,
    pub shutdown_timeout: Duration,
}

impl ScannerConfig {
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("--width and --height must be positive");
        }
        if !(args.fps.is_finite() && args.fps > 0.0) {
            bail!("--fps must be a positive number");
        }
        if args.stream_width == 0 || args.stream_height == 0 {
            bail!("--stream-width and --stream-height must be positive");
        }
        if args.host.trim().is_empty() {
            bail!("--host must not be empty");
        }
        if args.source.trim().is_empty() {
            bail!("--source must not be empty");
        }

        let backend = args
            .backend
            .map(CameraBackend::from)
            .unwrap_or_else(|| CameraBackend::from_uri(&args.source));

        Ok(Self {
            camera: CameraSpec {
                uri: args.source.clone(),
                backend,
                settings: CaptureSettings {
                    width: args.width,
                    height: args.height,
                    fps: args.fps,
                    pixel_format: args.pixel_format.into(),
                },
            },
            config_dir: args.config_dir.clone(),
            host: args.host.clone(),
            port: args.port,
            jpeg_quality: args.jpeg_quality,
            stream_size: (args.stream_width, args.stream_height),
            stream_poll: Duration::from_millis(33),
            autostart_scan: args.scan,
            autostart_web: args.web,
            console: !args.no_console,
            snapshot: args.snapshot.clone(),
            shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
        })
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            stream_size: Some(self.stream_size),
            ..LifecycleSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> Result<ScannerConfig> {
        let harness = Harness::try_parse_from(std::iter::once("run").chain(args.iter().copied()))?;
        ScannerConfig::from_args(&harness.run)
    }

    #[test]
    fn defaults_match_the_scanner_hardware() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.camera.uri, "0");
        assert_eq!(config.camera.backend, CameraBackend::Ffmpeg);
        assert_eq!(config.camera.settings, CaptureSettings::default());
        assert_eq!((config.host.as_str(), config.port), ("0.0.0.0", 5000));
        assert_eq!(config.stream_size, (1280, 960));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        assert!(config.console);
        assert!(!config.autostart_scan && !config.autostart_web);
    }

    #[test]
    fn synthetic_source_selects_the_synthetic_backend() {
        let config = parse(&["--source", "synthetic", "--scan", "--web"]).unwrap();
        assert_eq!(config.camera.backend, CameraBackend::Synthetic);
        assert!(config.autostart_scan && config.autostart_web);

        let forced = parse(&["--source", "/dev/video2", "--backend", "opencv"]).unwrap();
        assert_eq!(forced.camera.backend, CameraBackend::OpenCv);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse(&["--width", "0"]).is_err());
        assert!(parse(&["--fps", "0"]).is_err());
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--jpeg-quality", "101"]).is_err());
        assert!(parse(&["--pixel-format", "yuyv"]).is_err());
    }

    #[test]
    fn stream_size_reaches_the_lifecycle() {
        let config = parse(&["--stream-width", "640", "--stream-height", "480"]).unwrap();
        let settings = config.lifecycle_settings();
        assert_eq!(settings.stream_size, Some((640, 480)));
        assert_eq!(settings.stream_blank_size, (1920, 1080));
        assert_eq!(settings.display_blank_size, (960, 720));
    }
}
