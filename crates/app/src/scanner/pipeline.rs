//! Scanner orchestration: owns the capture lifecycle and the optional web
//! server, and runs the control loop on the main thread until shutdown.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, never, select, unbounded, Receiver};
use tracing::{info, warn};
use video_ingest::open_camera;
use vision::{CaptureLifecycle, ParamStore, ShutdownOutcome};

use super::{
    config::ScannerConfig,
    console::{self, ConsoleCommand},
    control::ScannerCommands,
    display::HeadlessDisplay,
    menu::{Menu, MenuOutcome},
    server::WebServer,
    stream::StreamSink,
    telemetry,
};

struct WebStream {
    server: WebServer,
    sink: Arc<StreamSink>,
}

/// Running scanner. Every method is callable from the control thread while
/// the capture and web threads run.
pub(crate) struct Scanner {
    config: ScannerConfig,
    lifecycle: CaptureLifecycle,
    web: Mutex<Option<WebStream>>,
    scan_requested: AtomicBool,
    shutdown_requested: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scanner {
    /// Spawn the capture thread. The camera is opened on that thread; an open
    /// failure is logged there and leaves the scanner without video.
    pub(crate) fn launch(config: ScannerConfig, params: Arc<ParamStore>) -> Result<Self> {
        let camera = config.camera.clone();
        let display = HeadlessDisplay::new(config.snapshot.clone(), config.jpeg_quality);
        info!(
            source = %camera.uri,
            backend = ?camera.backend,
            width = camera.settings.width,
            height = camera.settings.height,
            "Initializing camera"
        );
        let lifecycle = CaptureLifecycle::spawn(
            move || open_camera(&camera),
            params,
            Box::new(display),
            config.lifecycle_settings(),
        )
        .context("Failed to spawn capture thread")?;

        Ok(Self {
            config,
            lifecycle,
            web: Mutex::new(None),
            scan_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub(crate) fn lifecycle(&self) -> &CaptureLifecycle {
        &self.lifecycle
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Stop the web stream, then the capture thread, waiting a bounded time
    /// for each. Timeouts are reported and shutdown proceeds.
    pub(crate) fn cleanup(&self) {
        info!("Starting application cleanup...");
        self.stop_stream();
        match self.lifecycle.stop(self.config.shutdown_timeout) {
            ShutdownOutcome::Stopped => info!("Camera thread stopped"),
            ShutdownOutcome::TimedOut => warn!("Camera thread did not stop in time"),
            ShutdownOutcome::AlreadyStopped => {}
        }
        info!("Application cleanup complete");
    }
}

impl ScannerCommands for Scanner {
    fn start_scan(&self) {
        self.scan_requested.store(true, Ordering::SeqCst);
        self.lifecycle.start_processing();
    }

    fn stop_scan(&self) {
        self.scan_requested.store(false, Ordering::SeqCst);
        self.lifecycle.stop_processing();
    }

    fn start_stream(&self) -> Result<()> {
        let mut web = lock(&self.web);
        if web.as_ref().is_some_and(|w| w.server.is_running()) {
            return Ok(());
        }
        // A server stopped through `POST /shutdown` leaves a finished handle.
        if let Some(stale) = web.take() {
            self.lifecycle.clear_sink();
            stale.server.stop(self.config.shutdown_timeout);
        }

        let sink = Arc::new(StreamSink::new(self.config.jpeg_quality));
        let server = WebServer::start(
            sink.clone(),
            &self.config.host,
            self.config.port,
            self.config.stream_poll,
        )?;
        self.lifecycle.set_sink(sink.clone());
        *web = Some(WebStream { server, sink });
        Ok(())
    }

    fn stop_stream(&self) {
        let Some(stream) = lock(&self.web).take() else {
            return;
        };
        self.lifecycle.clear_sink();
        stream.sink.set_alive(false);
        match stream.server.stop(self.config.shutdown_timeout) {
            ShutdownOutcome::TimedOut => warn!("Web server did not stop in time"),
            _ => info!("Web server stopped"),
        }
    }

    fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    fn is_scanning(&self) -> bool {
        self.scan_requested.load(Ordering::SeqCst) && self.lifecycle.is_alive()
    }

    fn is_streaming_web(&self) -> bool {
        lock(&self.web)
            .as_ref()
            .is_some_and(|w| w.server.is_running())
    }
}

/// Run the scanner until Ctrl+C, `quit`, or the menu's shutdown entry.
pub fn run(config: ScannerConfig) -> Result<()> {
    telemetry::init_metrics_recorder()?;

    let params = Arc::new(ParamStore::open(&config.config_dir).with_context(|| {
        format!("Failed to load parameters from {}", config.config_dir.display())
    })?);
    match params.load() {
        Ok(current) => info!(?current, "Parameters loaded"),
        Err(err) => warn!("Runtime parameters unreadable ({err}); scans will use defaults"),
    }

    let (signal_tx, signal_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .context("Failed to install Ctrl+C handler")?;

    let console_rx: Receiver<ConsoleCommand> = if config.console {
        let (tx, rx) = unbounded();
        console::spawn(tx).context("Failed to spawn console thread")?;
        rx
    } else {
        never()
    };

    let autostart_scan = config.autostart_scan;
    let autostart_web = config.autostart_web;
    let scanner = Scanner::launch(config, params.clone())?;
    info!("Vein scanner initialized");

    if autostart_web {
        if let Err(err) = scanner.start_stream() {
            warn!("Could not start web server: {err:#}");
        }
    }
    if autostart_scan {
        scanner.start_scan();
    }

    let mut menu = Menu::new(params.clone());
    let result = control_loop(&scanner, &mut menu, &params, signal_rx, console_rx);
    scanner.cleanup();
    result
}

enum Step {
    Interrupted,
    Command(ConsoleCommand),
    ConsoleClosed,
    Idle,
}

fn control_loop(
    scanner: &Scanner,
    menu: &mut Menu,
    params: &ParamStore,
    signal_rx: Receiver<()>,
    mut console_rx: Receiver<ConsoleCommand>,
) -> Result<()> {
    let mut camera_down_reported = false;
    while !scanner.shutdown_requested() {
        let step = select! {
            recv(signal_rx) -> _ => Step::Interrupted,
            recv(console_rx) -> command => match command {
                Ok(command) => Step::Command(command),
                Err(_) => Step::ConsoleClosed,
            },
            default(Duration::from_millis(250)) => Step::Idle,
        };

        match step {
            Step::Interrupted => {
                info!("Program interrupted by user (Ctrl+C)");
                break;
            }
            Step::Command(command) => {
                let stdout = io::stdout();
                let outcome = console::execute(command, scanner, menu, params, &mut stdout.lock())?;
                if outcome == MenuOutcome::Shutdown {
                    break;
                }
            }
            Step::ConsoleClosed => console_rx = never(),
            Step::Idle => {}
        }

        if !camera_down_reported && !scanner.lifecycle().is_alive() {
            warn!("Capture thread is not running; no video will be produced");
            camera_down_reported = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{SocketAddr, TcpStream},
        path::PathBuf,
    };

    use video_ingest::{CameraBackend, CameraSpec, CaptureSettings, PixelFormat};
    use vision::ScanState;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(dir: PathBuf) -> ScannerConfig {
        ScannerConfig {
            camera: CameraSpec {
                uri: "synthetic".into(),
                backend: CameraBackend::Synthetic,
                settings: CaptureSettings {
                    width: 64,
                    height: 48,
                    fps: 200.0,
                    pixel_format: PixelFormat::Grey,
                },
            },
            config_dir: dir,
            host: "127.0.0.1".into(),
            port: 0,
            jpeg_quality: 80,
            stream_size: (32, 24),
            stream_poll: Duration::from_millis(5),
            autostart_scan: false,
            autostart_web: false,
            console: false,
            snapshot: None,
            shutdown_timeout: WAIT,
        }
    }

    fn launch() -> (tempfile::TempDir, Scanner) {
        let dir = tempfile::tempdir().unwrap();
        let params = Arc::new(ParamStore::open(dir.path()).unwrap());
        let scanner = Scanner::launch(config(dir.path().to_path_buf()), params).unwrap();
        (dir, scanner)
    }

    fn web_addr(scanner: &Scanner) -> SocketAddr {
        lock(&scanner.web).as_ref().unwrap().server.local_addrs()[0]
    }

    fn http(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response);
        String::from_utf8_lossy(&response).into_owned()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn scan_and_stream_serve_frames() {
        let (_dir, scanner) = launch();
        scanner.start_stream().unwrap();
        assert!(scanner.is_streaming_web());
        scanner.start_scan();
        assert!(scanner.is_scanning());
        assert!(scanner
            .lifecycle()
            .wait_for_state(ScanState::Streaming, WAIT));

        let addr = web_addr(&scanner);
        assert!(wait_until(|| http(
            addr,
            "GET /frame.jpg HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .starts_with("HTTP/1.1 200")));

        scanner.stop_scan();
        assert!(!scanner.is_scanning());
        assert!(scanner.lifecycle().wait_for_state(ScanState::Idle, WAIT));
        scanner.cleanup();
        assert!(!scanner.is_streaming_web());
        assert_eq!(scanner.lifecycle().state(), ScanState::Terminated);
    }

    #[test]
    fn loopback_shutdown_stops_only_the_web_server() {
        let (_dir, scanner) = launch();
        scanner.start_stream().unwrap();
        let addr = web_addr(&scanner);

        let response = http(
            addr,
            "POST /shutdown HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(wait_until(|| !scanner.is_streaming_web()));
        assert!(scanner.lifecycle().is_alive());

        scanner.start_stream().unwrap();
        assert!(scanner.is_streaming_web());
        scanner.cleanup();
    }

    #[test]
    fn shutdown_command_ends_the_control_loop() {
        let (dir, scanner) = launch();
        let params = Arc::new(ParamStore::open(dir.path()).unwrap());
        let mut menu = Menu::new(params.clone());
        let (console_tx, console_rx) = unbounded();
        console_tx.send(ConsoleCommand::Quit).unwrap();

        control_loop(&scanner, &mut menu, &params, never(), console_rx).unwrap();
        assert!(scanner.shutdown_requested());
        scanner.cleanup();
        assert!(!scanner.lifecycle().is_alive());
    }
}
