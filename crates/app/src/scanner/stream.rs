//! Most-recent-frame holder behind the web stream.
//!
//! The capture thread replaces the held frame; HTTP consumers poll it at their
//! own cadence and receive multipart JPEG chunks. The lock only covers swapping
//! the frame in or out, never encoding or network writes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use actix_web::web::Bytes;
use async_stream::stream;
use futures_util::Stream;
use tracing::{trace, warn};
use video_ingest::Frame;
use vision::FrameSink;

use super::encoding::encode_jpeg;

#[derive(Default)]
struct Slot {
    generation: u64,
    frame: Option<Arc<Frame>>,
    jpeg: Option<EncodedFrame>,
}

/// JPEG bytes tagged with the generation of the frame they came from.
#[derive(Clone, Debug)]
pub(crate) struct EncodedFrame {
    pub(crate) generation: u64,
    pub(crate) jpeg: Bytes,
}

pub(crate) struct StreamSink {
    slot: Mutex<Slot>,
    alive: AtomicBool,
    jpeg_quality: u8,
}

impl StreamSink {
    pub(crate) fn new(jpeg_quality: u8) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            alive: AtomicBool::new(false),
            jpeg_quality,
        }
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// JPEG of the held frame, encoded at most once per generation.
    pub(crate) fn latest_jpeg(&self) -> Option<EncodedFrame> {
        let (generation, frame) = {
            let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = slot.jpeg.as_ref().filter(|c| c.generation == slot.generation) {
                return Some(cached.clone());
            }
            (slot.generation, slot.frame.clone()?)
        };

        let started = Instant::now();
        let jpeg = match encode_jpeg(&frame, self.jpeg_quality) {
            Ok(jpeg) => Bytes::from(jpeg),
            Err(err) => {
                warn!("Skipping stream frame {generation}: {err}");
                return None;
            }
        };
        metrics::histogram!("scanner_stream_encode_seconds")
            .record(started.elapsed().as_secs_f64());

        let encoded = EncodedFrame { generation, jpeg };
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation == generation {
            slot.jpeg = Some(encoded.clone());
        }
        Some(encoded)
    }

    /// Fresh, endless multipart sequence. Each new frame generation is emitted
    /// once; nothing is emitted until a frame has been held.
    pub(crate) fn read(
        self: Arc<Self>,
        poll: Duration,
    ) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
        stream! {
            let _client = ClientGauge::connect();
            let mut interval = actix_web::rt::time::interval(poll);
            let mut last_sent = 0u64;
            loop {
                interval.tick().await;
                if let Some(encoded) = self.latest_jpeg() {
                    if encoded.generation != last_sent {
                        last_sent = encoded.generation;
                        yield Ok::<Bytes, actix_web::Error>(multipart_chunk(&encoded));
                    }
                }
            }
        }
    }
}

impl FrameSink for StreamSink {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn update(&self, frame: &Frame) {
        if !self.is_alive() {
            trace!("Stream sink stopped; dropping frame");
            return;
        }
        let frame = Arc::new(frame.clone());
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.generation = slot.generation.wrapping_add(1);
        slot.frame = Some(frame);
        slot.jpeg = None;
    }
}

pub(crate) fn multipart_chunk(encoded: &EncodedFrame) -> Bytes {
    let mut payload = Vec::with_capacity(encoded.jpeg.len() + 64);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(&encoded.jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

/// Tracks connected stream consumers for the lifetime of one `read` sequence.
struct ClientGauge;

impl ClientGauge {
    fn connect() -> Self {
        metrics::gauge!("scanner_stream_clients").increment(1.0);
        ClientGauge
    }
}

impl Drop for ClientGauge {
    fn drop(&mut self) {
        metrics::gauge!("scanner_stream_clients").decrement(1.0);
    }
}
