//! Live vein-scanner application: capture, enhance, display and stream.
//!
//! The module is split into focused submodules:
//! - `config`: CLI arguments and the validated `ScannerConfig`.
//! - `pipeline`: Owns the capture lifecycle and web server; runs the control loop.
//! - `stream`: Most-recent-frame sink feeding the MJPEG stream.
//! - `server`: Actix Web endpoints.
//! - `encoding`: JPEG and colour-order helpers.
//! - `display`: Headless local display with optional snapshot file.
//! - `control`: Command interface shared by the menu and console.
//! - `menu`: Button-driven menu state machine.
//! - `console`: stdin control surface.
//! - `offline`: Single-image processing.
//! - `telemetry`: Tracing and Prometheus setup.

pub use config::{RunArgs, ScannerConfig};
pub use pipeline::run;

pub(crate) use console::render_params;
pub(crate) use offline::process_file;
pub(crate) use telemetry::init_tracing;

mod config;
mod console;
mod control;
mod display;
mod encoding;
mod menu;
mod offline;
mod pipeline;
mod server;
mod stream;
mod telemetry;
