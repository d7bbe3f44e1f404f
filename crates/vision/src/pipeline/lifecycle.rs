//! Capture lifecycle.
//!
//! A single thread owns the camera for the lifetime of the application. It
//! idles until a scan is requested, then pulls, processes and forwards frames
//! until the scan is stopped, at which point every sink receives one blank
//! frame. Shutdown is a monotonic flag; once set the loop never streams again.

use std::{
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, trace, warn};
use video_ingest::{CameraDevice, CameraProperty, CaptureError, Frame};

use super::sink::{FrameDisplay, FrameSink};
use crate::{
    params::{CaptureParameters, ParamStore},
    processing::{process_frame, resize_frame},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    /// Camera open, no frames pulled.
    Idle,
    /// Pulling, processing and forwarding frames.
    Streaming,
    /// Loop exited and the camera was released (or never opened).
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Stopped,
    /// The thread did not exit within the wait window; it was left detached.
    TimedOut,
    AlreadyStopped,
}

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    /// Blank frame shown on the local display when idle.
    pub display_blank_size: (u32, u32),
    /// Blank frame pushed to the linked sink when a scan stops.
    pub stream_blank_size: (u32, u32),
    /// Frames are resized to this before reaching the linked sink.
    pub stream_size: Option<(u32, u32)>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            display_blank_size: (960, 720),
            stream_blank_size: (1920, 1080),
            stream_size: Some((1280, 960)),
        }
    }
}

#[derive(Default)]
struct Signals {
    streaming_requested: bool,
    stop_requested: bool,
}

struct Shared {
    signals: Mutex<Signals>,
    wake: Condvar,
    state: Mutex<ScanState>,
    state_changed: Condvar,
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn should_stream(&self) -> bool {
        let signals = lock(&self.signals);
        signals.streaming_requested && !signals.stop_requested
    }

    fn stop_requested(&self) -> bool {
        lock(&self.signals).stop_requested
    }

    /// Block until a scan is requested. Returns false when woken for shutdown.
    fn wait_for_start(&self) -> bool {
        let mut signals = lock(&self.signals);
        while !signals.streaming_requested && !signals.stop_requested {
            signals = self
                .wake
                .wait(signals)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !signals.stop_requested
    }

    fn set_state(&self, state: ScanState) {
        *lock(&self.state) = state;
        self.state_changed.notify_all();
    }

    fn linked_sink(&self) -> Option<Arc<dyn FrameSink>> {
        lock(&self.sink).clone().filter(|sink| sink.is_alive())
    }
}

struct Worker {
    handle: thread::JoinHandle<()>,
    exited: Receiver<()>,
}

/// Marks the lifecycle terminated however the thread exits.
struct ExitGuard {
    shared: Arc<Shared>,
    exited: Sender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.shared.set_state(ScanState::Terminated);
        let _ = self.exited.try_send(());
    }
}

/// Handle to the capture thread. All methods are safe to call from any thread.
pub struct CaptureLifecycle {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl CaptureLifecycle {
    /// Spawn the capture thread. `open` runs on that thread; if it fails the
    /// error is logged and the thread exits without streaming.
    pub fn spawn<F, D>(
        open: F,
        params: Arc<ParamStore>,
        display: Box<dyn FrameDisplay>,
        settings: LifecycleSettings,
    ) -> io::Result<Self>
    where
        F: FnOnce() -> Result<D, CaptureError> + Send + 'static,
        D: CameraDevice + 'static,
    {
        let shared = Arc::new(Shared {
            signals: Mutex::new(Signals::default()),
            wake: Condvar::new(),
            state: Mutex::new(ScanState::Idle),
            state_changed: Condvar::new(),
            sink: Mutex::new(None),
        });
        let (exit_tx, exit_rx) = bounded(1);
        let thread_shared = shared.clone();
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());

        let handle = thread::Builder::new()
            .name("capture-lifecycle".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _exit = ExitGuard {
                        shared: thread_shared.clone(),
                        exited: exit_tx,
                    };
                    let device = match open() {
                        Ok(device) => device,
                        Err(err) => {
                            error!("Failed to initialize camera: {err}");
                            return;
                        }
                    };
                    info!("Camera initialized");
                    let current = params.defaults();
                    CaptureLoop {
                        device,
                        display,
                        params,
                        settings,
                        shared: thread_shared,
                        current,
                    }
                    .run();
                })
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(Worker {
                handle,
                exited: exit_rx,
            })),
        })
    }

    /// Request a scan. Ignored once the thread has exited or shutdown began.
    pub fn start_processing(&self) {
        if !self.is_alive() {
            debug!("Ignoring scan request; capture thread is not running");
            return;
        }
        let mut signals = lock(&self.shared.signals);
        if signals.stop_requested {
            return;
        }
        signals.streaming_requested = true;
        drop(signals);
        self.shared.wake.notify_all();
    }

    pub fn stop_processing(&self) {
        lock(&self.shared.signals).streaming_requested = false;
    }

    /// Link a sink; it receives every processed frame while alive.
    pub fn set_sink(&self, sink: Arc<dyn FrameSink>) {
        *lock(&self.shared.sink) = Some(sink);
    }

    pub fn clear_sink(&self) -> Option<Arc<dyn FrameSink>> {
        lock(&self.shared.sink).take()
    }

    pub fn state(&self) -> ScanState {
        *lock(&self.shared.state)
    }

    /// Wait up to `timeout` for the loop to reach `expected`.
    pub fn wait_for_state(&self, expected: ScanState, timeout: Duration) -> bool {
        let guard = lock(&self.shared.state);
        let (guard, _) = self
            .shared
            .state_changed
            .wait_timeout_while(guard, timeout, |state| *state != expected)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == expected
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Shut the loop down and wait at most `timeout` for the camera to be
    /// released. A second call is a no-op.
    pub fn stop(&self, timeout: Duration) -> ShutdownOutcome {
        let Some(worker) = lock(&self.worker).take() else {
            return ShutdownOutcome::AlreadyStopped;
        };
        self.request_stop();

        match worker.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("Capture thread panicked during shutdown");
                }
                info!("Capture thread stopped");
                ShutdownOutcome::Stopped
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Capture thread did not stop within {timeout:?}; continuing shutdown");
                ShutdownOutcome::TimedOut
            }
        }
    }

    fn request_stop(&self) {
        let mut signals = lock(&self.shared.signals);
        signals.stop_requested = true;
        // Wake a loop parked in `wait_for_start` so it can observe the stop.
        signals.streaming_requested = true;
        drop(signals);
        self.shared.wake.notify_all();
    }
}

impl Drop for CaptureLifecycle {
    fn drop(&mut self) {
        if lock(&self.worker).is_some() {
            self.request_stop();
        }
    }
}

struct CaptureLoop<D> {
    device: D,
    display: Box<dyn FrameDisplay>,
    params: Arc<ParamStore>,
    settings: LifecycleSettings,
    shared: Arc<Shared>,
    current: CaptureParameters,
}

impl<D: CameraDevice> CaptureLoop<D> {
    fn run(mut self) {
        let (width, height) = self.settings.display_blank_size;
        self.display.show_frame(&Frame::blank(width, height));

        loop {
            info!("Camera idle; waiting for scan command");
            if !self.shared.wait_for_start() {
                break;
            }
            self.scan();
            if self.shared.stop_requested() {
                break;
            }
        }

        self.device.release();
        info!("Camera thread shut down and resources released");
    }

    fn scan(&mut self) {
        let params = self.reload_params();
        let span = tracing::info_span!(
            "scan",
            iterations = params.iterations,
            clip_limit = params.clip_limit,
            tile_grid_size = params.tile_grid_size,
            invert = params.invert_colors
        );
        let _span_guard = span.enter();

        self.apply_device_settings(&params);
        self.shared.set_state(ScanState::Streaming);
        metrics::gauge!("scanner_streaming").set(1.0);
        info!("Scan started");

        let mut frames: u64 = 0;
        while self.shared.should_stream() {
            let frame = match self.device.read_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    metrics::counter!("scanner_frame_read_failures_total").increment(1);
                    if err.is_transient() {
                        trace!("Frame read skipped: {err}");
                    } else {
                        debug!("Frame read failed: {err}");
                    }
                    continue;
                }
            };

            let started = Instant::now();
            let processed = tracing::trace_span!("frame.process", frame = frames)
                .in_scope(|| process_frame(frame, &params));
            match processed {
                Ok(processed) => {
                    metrics::histogram!("scanner_processing_seconds")
                        .record(started.elapsed().as_secs_f64());
                    self.forward(&processed);
                    frames = frames.wrapping_add(1);
                    metrics::counter!("scanner_frames_processed_total").increment(1);
                }
                Err(err) => {
                    metrics::counter!("scanner_processing_errors_total").increment(1);
                    warn!("Dropping frame: {err}");
                }
            }
        }

        self.blank_sinks();
        self.shared.set_state(ScanState::Idle);
        metrics::gauge!("scanner_streaming").set(0.0);
        info!(frames, "Scan stopped; sinks blanked");
    }

    fn reload_params(&mut self) -> CaptureParameters {
        match self.params.load() {
            Ok(params) => {
                self.current = params;
                params
            }
            Err(err) => {
                warn!("Could not reload parameters ({err}); keeping previous values");
                self.current
            }
        }
    }

    fn apply_device_settings(&mut self, params: &CaptureParameters) {
        let settings = [
            (CameraProperty::AutoExposure, 1.0),
            (CameraProperty::Gain, params.gain),
            (CameraProperty::Exposure, params.exposure as f64),
        ];
        for (property, value) in settings {
            if let Err(err) = self.device.set_property(property, value) {
                warn!("Could not apply camera setting: {err}");
            }
        }
        info!(
            gain = params.gain,
            exposure = params.exposure,
            "Applied camera settings"
        );
    }

    fn forward(&mut self, frame: &Frame) {
        self.display.show_frame(frame);
        let Some(sink) = self.shared.linked_sink() else {
            return;
        };
        match self.settings.stream_size {
            Some((width, height)) if (width, height) != (frame.width, frame.height) => {
                match resize_frame(frame, width, height) {
                    Ok(resized) => sink.update(&resized),
                    Err(err) => warn!("Could not resize frame for the stream: {err}"),
                }
            }
            _ => sink.update(frame),
        }
    }

    fn blank_sinks(&mut self) {
        let (width, height) = self.settings.display_blank_size;
        self.display.show_frame(&Frame::blank(width, height));
        if let Some(sink) = self.shared.linked_sink() {
            let (width, height) = self.settings.stream_blank_size;
            sink.update(&Frame::blank(width, height));
        }
    }
}
