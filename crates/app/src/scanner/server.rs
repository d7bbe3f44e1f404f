//! Actix Web server exposing the viewer page, MJPEG stream, and metrics.
//!
//! The server runs on a dedicated thread with its own actix system so the
//! capture thread never touches the async runtime. Bind failures are reported
//! to the caller of [`WebServer::start`] before it returns.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use actix_web::{http::header, web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use vision::ShutdownOutcome;

use super::{stream::StreamSink, telemetry};

type ShutdownTrigger = Arc<Mutex<Option<oneshot::Sender<()>>>>;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) sink: Arc<StreamSink>,
    pub(crate) poll: Duration,
    pub(crate) metrics: Option<&'static PrometheusHandle>,
    pub(crate) shutdown: ShutdownTrigger,
}

impl ServerState {
    /// Stop accepting frames and ask the server loop to unwind.
    fn trigger_shutdown(&self) -> bool {
        self.sink.set_alive(false);
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Handle for the web server thread.
pub(crate) struct WebServer {
    state: web::Data<ServerState>,
    addrs: Vec<SocketAddr>,
    handle: Option<thread::JoinHandle<()>>,
    exited: Receiver<()>,
}

impl WebServer {
    /// Bind `host:port` and serve `sink` until stopped. The sink is marked
    /// alive once the listener is up.
    pub(crate) fn start(
        sink: Arc<StreamSink>,
        host: &str,
        port: u16,
        poll: Duration,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = web::Data::new(ServerState {
            sink: sink.clone(),
            poll,
            metrics: telemetry::prometheus_handle(),
            shutdown: Arc::new(Mutex::new(Some(shutdown_tx))),
        });
        let (ready_tx, ready_rx) = bounded::<Result<Vec<SocketAddr>, String>>(1);
        let (exit_tx, exit_rx) = bounded::<()>(1);

        let server_state = state.clone();
        let bind_host = host.to_string();
        let handle = telemetry::spawn_thread("web-stream-server", move || {
            let _exit = exit_tx;
            let result = actix_web::rt::System::new().block_on(async move {
                let bound = HttpServer::new(move || {
                    App::new()
                        .app_data(server_state.clone())
                        .configure(routes)
                })
                .workers(2)
                .disable_signals()
                .shutdown_timeout(1)
                .bind((bind_host.as_str(), port));
                let server = match bound {
                    Ok(server) => server,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return Ok(());
                    }
                };
                let addrs = server.addrs();
                let server = server.run();
                let _ = ready_tx.send(Ok(addrs));

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            });
            if let Err(err) = result {
                error!("HTTP server error: {err}");
            }
            info!("Web server has stopped");
        })
        .context("Failed to spawn web server thread")?;

        let addrs = match ready_rx.recv() {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(reason)) => {
                let _ = handle.join();
                bail!("failed to bind web server to {host}:{port}: {reason}");
            }
            Err(_) => {
                let _ = handle.join();
                return Err(anyhow!("web server thread exited before binding"));
            }
        };

        sink.set_alive(true);
        for addr in &addrs {
            info!("Web stream available at http://{addr}/");
        }
        Ok(Self {
            state,
            addrs,
            handle: Some(handle),
            exited: exit_rx,
        })
    }

    pub(crate) fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Whether the server loop is still serving. False after `POST /shutdown`.
    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the server to stop and wait at most `timeout` for its thread.
    pub(crate) fn stop(mut self, timeout: Duration) -> ShutdownOutcome {
        let Some(handle) = self.handle.take() else {
            return ShutdownOutcome::AlreadyStopped;
        };
        self.state.trigger_shutdown();
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("Web server thread panicked");
                }
                ShutdownOutcome::Stopped
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Web server did not stop within {timeout:?}; continuing");
                ShutdownOutcome::TimedOut
            }
        }
    }
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/video_feed", web::get().to(video_feed_handler))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/shutdown", web::post().to(shutdown_handler));
}

/// Serve the viewer page.
async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(crate::html::viewer::VIEWER_HTML)
}

/// Stream the MJPEG feed over a multipart response.
async fn video_feed_handler(state: web::Data<ServerState>) -> HttpResponse {
    let stream = state.sink.clone().read(state.poll);
    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Return the latest frame as a single JPEG.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.sink.latest_jpeg() {
        Some(encoded) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .append_header(("X-Frame-Generation", encoded.generation.to_string()))
            .body(encoded.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

/// Loopback-only trigger that stops this server.
async fn shutdown_handler(req: HttpRequest, state: web::Data<ServerState>) -> HttpResponse {
    let loopback = req
        .peer_addr()
        .is_some_and(|addr| addr.ip().is_loopback());
    if !loopback {
        warn!("Rejected shutdown request from {:?}", req.peer_addr());
        return HttpResponse::Forbidden().body("shutdown is only accepted from loopback");
    }
    info!("Shutdown endpoint called; stopping web server");
    state.trigger_shutdown();
    HttpResponse::Ok().body("Server is shutting down...")
}

#[cfg(test)]
mod tests {
    use actix_web::{body::MessageBody, http::StatusCode, test};
    use video_ingest::Frame;
    use vision::FrameSink;

    use super::*;

    fn state(sink: Arc<StreamSink>) -> (web::Data<ServerState>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let state = web::Data::new(ServerState {
            sink,
            poll: Duration::from_millis(5),
            metrics: None,
            shutdown: Arc::new(Mutex::new(Some(tx))),
        });
        (state, rx)
    }

    fn live_sink() -> Arc<StreamSink> {
        let sink = Arc::new(StreamSink::new(85));
        sink.set_alive(true);
        sink
    }

    #[actix_web::test]
    async fn index_embeds_the_stream() {
        let (state, _rx) = state(live_sink());
        let app = test::init_service(App::new().app_data(state).configure(routes)).await;
        let body = test::call_and_read_body(&app, test::TestRequest::get().uri("/").to_request()).await;
        let html = std::str::from_utf8(&body).unwrap();
        assert!(html.contains(r#"src="/video_feed""#));
    }

    #[actix_web::test]
    async fn frame_endpoint_is_empty_until_a_frame_arrives() {
        let sink = live_sink();
        let (state, _rx) = state(sink.clone());
        let app = test::init_service(App::new().app_data(state).configure(routes)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        sink.update(&Frame::blank(8, 8));
        let resp = test::call_service(&app, test::TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "image/jpeg");
        let body = test::read_body(resp).await;
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
    }

    #[actix_web::test]
    async fn video_feed_is_multipart() {
        let sink = live_sink();
        sink.update(&Frame::blank(8, 8));
        let (state, _rx) = state(sink);
        let app = test::init_service(App::new().app_data(state).configure(routes)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/video_feed").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "multipart/x-mixed-replace; boundary=frame"
        );
        let mut body = Box::pin(resp.into_body());
        let chunk = std::future::poll_fn(|cx| body.as_mut().poll_next(cx))
            .await
            .unwrap()
            .unwrap();
        assert!(chunk.starts_with(b"--frame\r\n"));
    }

    #[actix_web::test]
    async fn shutdown_requires_a_loopback_peer() {
        let sink = live_sink();
        let (state, mut rx) = state(sink.clone());
        let app = test::init_service(App::new().app_data(state).configure(routes)).await;

        let remote = test::TestRequest::post()
            .uri("/shutdown")
            .peer_addr("10.0.0.7:41000".parse().unwrap())
            .to_request();
        assert_eq!(test::call_service(&app, remote).await.status(), StatusCode::FORBIDDEN);
        assert!(sink.is_alive());
        assert!(rx.try_recv().is_err());

        let local = test::TestRequest::post()
            .uri("/shutdown")
            .peer_addr("127.0.0.1:41000".parse().unwrap())
            .to_request();
        assert_eq!(test::call_service(&app, local).await.status(), StatusCode::OK);
        assert!(!sink.is_alive());
        assert!(rx.try_recv().is_ok());
    }

    #[actix_web::test]
    async fn metrics_without_a_recorder_is_unavailable() {
        let (state, _rx) = state(live_sink());
        let app = test::init_service(App::new().app_data(state).configure(routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[::core::prelude::v1::test]
    fn start_serves_and_stop_joins() {
        let sink = Arc::new(StreamSink::new(85));
        let server = WebServer::start(sink.clone(), "127.0.0.1", 0, Duration::from_millis(5)).unwrap();
        assert!(sink.is_alive());
        assert!(server.is_running());
        assert_ne!(server.local_addrs()[0].port(), 0);
        assert_eq!(server.stop(Duration::from_secs(5)), ShutdownOutcome::Stopped);
        assert!(!sink.is_alive());
    }

    #[::core::prelude::v1::test]
    fn bind_failures_are_reported_to_the_caller() {
        let first = WebServer::start(
            Arc::new(StreamSink::new(85)),
            "127.0.0.1",
            0,
            Duration::from_millis(5),
        )
        .unwrap();
        let taken = first.local_addrs()[0].port();
        let sink = Arc::new(StreamSink::new(85));
        let second = WebServer::start(sink.clone(), "127.0.0.1", taken, Duration::from_millis(5));
        assert!(second.is_err());
        assert!(!sink.is_alive());
        first.stop(Duration::from_secs(5));
    }
}
