//! Single-client MJPEG fallback stream.
//!
//! Every HTTP client gets its own worker thread with its own connection to
//! the source. Nothing here touches channel state, so a busy channel can
//! never starve the fallback path. Chunks go through a small bounded queue;
//! when the client goes away the queue closes and the worker releases its
//! connection.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use video_ingest::{Connection, StreamAcquirer};

use crate::{
    capture::{ReadFailureAction, classify_read_failure},
    channel::LIVENESS_SLICE,
    config::FallbackTuning,
    encoding::{FrameEncoder, JpegFrameEncoder},
    telemetry,
};

/// Chunks buffered per client before new ones are dropped.
pub const CHUNK_QUEUE: usize = 2;

/// Multipart boundary used by the fallback stream.
pub const BOUNDARY: &str = "frame";

static CLIENT_IDS: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; the chunk was discarded.
    Dropped,
    /// The client is gone.
    Closed,
}

/// Destination for multipart chunks.
pub trait ChunkSink: Send {
    fn offer(&mut self, chunk: Bytes) -> Delivery;

    fn is_closed(&self) -> bool;
}

impl ChunkSink for mpsc::Sender<Bytes> {
    fn offer(&mut self, chunk: Bytes) -> Delivery {
        match self.try_send(chunk) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

/// Wrap one JPEG in a multipart part.
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(jpeg.len() + 64);
    chunk.put_slice(b"--");
    chunk.put_slice(BOUNDARY.as_bytes());
    chunk.put_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Per-client acquisition, pacing and encoding.
pub struct FallbackWorker<S: ChunkSink> {
    acquirer: Arc<StreamAcquirer>,
    source_uri: String,
    tuning: FallbackTuning,
    encoder: Box<dyn FrameEncoder>,
    sink: S,
    shutdown: Arc<AtomicBool>,
    connection: Option<Connection>,
    last_attempt: Option<Instant>,
    last_frame_at: Option<Instant>,
    failures: u32,
    cached: Option<Bytes>,
}

impl<S: ChunkSink> FallbackWorker<S> {
    pub fn new(
        acquirer: Arc<StreamAcquirer>,
        source_uri: impl Into<String>,
        tuning: FallbackTuning,
        sink: S,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            acquirer,
            source_uri: source_uri.into(),
            tuning,
            encoder: Box::new(JpegFrameEncoder),
            sink,
            shutdown,
            connection: None,
            last_attempt: None,
            last_frame_at: None,
            failures: 0,
            cached: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Serve the client until it disconnects or the relay shuts down.
    pub fn run(mut self) {
        info!("Fallback client connected");
        metrics::counter!("relay_fallback_clients_total").increment(1);

        while !self.finished() {
            let Some(pause) = self.supervised_step(Instant::now()) else {
                break;
            };
            if !pause.is_zero() && !self.sleep(pause) {
                break;
            }
        }

        self.connection = None;
        info!("Fallback client disconnected");
    }

    /// Run one iteration. Returns `None` once the client is gone.
    pub fn supervised_step(&mut self, now: Instant) -> Option<Duration> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.step(now))) {
            Ok(Ok(pause)) => pause,
            Ok(Err(err)) => {
                error!("Fallback iteration failed: {err:#}");
                self.release();
                Some(self.tuning.error_cooldown)
            }
            Err(_) => {
                error!("Fallback iteration panicked");
                self.release();
                Some(self.tuning.error_cooldown)
            }
        }
    }

    pub fn step(&mut self, now: Instant) -> Result<Option<Duration>> {
        if self.sink.is_closed() {
            return Ok(None);
        }

        if self.connection.is_none() {
            return Ok(Some(self.try_open(now)));
        }

        let interval = self.tuning.interval();
        if let Some(last) = self.last_frame_at {
            let since = now.saturating_duration_since(last);
            if since < interval {
                return Ok(Some(interval - since));
            }
        }

        let Some(connection) = self.connection.as_mut() else {
            return Ok(Some(Duration::ZERO));
        };
        match connection.read() {
            Ok(frame) => {
                self.failures = 0;
                self.last_frame_at = Some(now);
                let jpeg = match self.encoder.encode(&frame, self.tuning.quality) {
                    Ok(jpeg) => jpeg,
                    Err(err) => {
                        warn!("Fallback encode failed: {err:#}");
                        return Ok(Some(Duration::ZERO));
                    }
                };
                let chunk = multipart_chunk(&jpeg);
                self.cached = Some(chunk.clone());
                Ok(self.deliver(chunk).then_some(Duration::ZERO))
            }
            Err(err) if err.is_read_failure() => {
                self.failures += 1;
                debug!("Fallback read failed ({}): {err}", self.failures);
                match classify_read_failure(self.failures, self.tuning.max_failures, self.cached.is_some()) {
                    ReadFailureAction::ServeCached => {
                        let chunk = self.cached.clone().unwrap_or_default();
                        Ok(self.deliver(chunk).then_some(interval))
                    }
                    ReadFailureAction::Retry => Ok(Some(self.tuning.read_failure_pause)),
                    ReadFailureAction::Reconnect => {
                        warn!("{} consecutive read failures, reconnecting", self.failures);
                        self.release();
                        Ok(Some(Duration::ZERO))
                    }
                }
            }
            Err(err) => Err(err).context("unexpected fallback read error"),
        }
    }

    fn try_open(&mut self, now: Instant) -> Duration {
        if let Some(at) = self.last_attempt {
            let waited = now.saturating_duration_since(at);
            if waited < self.tuning.reopen_delay {
                return self.tuning.reopen_delay - waited;
            }
        }
        self.last_attempt = Some(now);
        match self.acquirer.open(&self.source_uri) {
            Ok(connection) => {
                info!("Fallback stream opened using {}", connection.strategy());
                self.connection = Some(connection);
                self.failures = 0;
                Duration::ZERO
            }
            Err(err) => {
                warn!("Fallback stream failed to open: {err}");
                self.tuning.reopen_delay / 2
            }
        }
    }

    /// Returns false once the client has gone away.
    fn deliver(&mut self, chunk: Bytes) -> bool {
        match self.sink.offer(chunk) {
            Delivery::Sent => true,
            Delivery::Dropped => {
                debug!("Fallback client is slow, dropping chunk");
                true
            }
            Delivery::Closed => false,
        }
    }

    /// Drop the connection and allow an immediate reopen.
    fn release(&mut self) {
        self.connection = None;
        self.last_attempt = None;
        self.cached = None;
        self.failures = 0;
    }

    fn finished(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.sink.is_closed()
    }

    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.finished() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(LIVENESS_SLICE));
        }
    }
}

/// Start a worker for one client and return the receiving end of its chunk
/// queue.
pub fn spawn_fallback_stream(
    acquirer: Arc<StreamAcquirer>,
    source_uri: &str,
    tuning: FallbackTuning,
    shutdown: Arc<AtomicBool>,
) -> Result<mpsc::Receiver<Bytes>> {
    let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
    let client = CLIENT_IDS.fetch_add(1, Ordering::Relaxed);
    let worker = FallbackWorker::new(acquirer, source_uri, tuning, tx, shutdown);
    telemetry::spawn_thread(format!("fallback-client-{client}"), move || {
        let span = tracing::info_span!("fallback.client", client = client);
        let _guard = span.enter();
        worker.run();
    })
    .context("Failed to spawn fallback stream worker")?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Script, Step};

    #[derive(Default)]
    struct VecSink {
        chunks: Vec<Bytes>,
        capacity: Option<usize>,
        closed: bool,
    }

    impl ChunkSink for VecSink {
        fn offer(&mut self, chunk: Bytes) -> Delivery {
            if self.closed {
                return Delivery::Closed;
            }
            if self.capacity.is_some_and(|cap| self.chunks.len() >= cap) {
                return Delivery::Dropped;
            }
            self.chunks.push(chunk);
            Delivery::Sent
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn worker(script: &Script) -> FallbackWorker<VecSink> {
        FallbackWorker::new(
            Arc::new(script.acquirer()),
            "rtsp://cam/stream",
            FallbackTuning::default(),
            VecSink::default(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn chunks_are_multipart_jpeg_parts() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert!(chunk.ends_with(b"\xFF\xD9\r\n"));
    }

    #[test]
    fn streams_paced_jpeg_chunks() {
        let script = Script::new([Step::Frame(1), Step::Frame(2)]);
        let mut worker = worker(&script);
        let start = Instant::now();

        assert_eq!(worker.step(start).expect("open"), Some(Duration::ZERO));
        assert_eq!(worker.step(start).expect("read"), Some(Duration::ZERO));
        let pause = worker.step(start + Duration::from_millis(40)).expect("paced");
        assert_eq!(
            pause,
            Some(FallbackTuning::default().interval() - Duration::from_millis(40))
        );
        worker.step(start + Duration::from_millis(100)).expect("read");

        assert_eq!(worker.sink.chunks.len(), 2);
        let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        assert!(worker.sink.chunks[0].starts_with(header));
        assert_eq!(&worker.sink.chunks[0][header.len()..header.len() + 2], &[0xFF, 0xD8]);
    }

    #[test]
    fn full_queue_drops_chunks_without_stopping() {
        let script = Script::new([Step::Frame(1), Step::Frame(2)]);
        let mut worker = worker(&script);
        worker.sink.capacity = Some(1);
        let start = Instant::now();
        worker.step(start).expect("open");
        worker.step(start).expect("read");

        let pause = worker.step(start + Duration::from_secs(1)).expect("read");
        assert_eq!(pause, Some(Duration::ZERO));
        assert_eq!(worker.sink.chunks.len(), 1);
    }

    #[test]
    fn closed_client_releases_the_connection() {
        let script = Script::new([Step::Frame(1)]);
        let mut worker = worker(&script);
        let start = Instant::now();
        worker.step(start).expect("open");
        worker.sink.closed = true;

        assert_eq!(worker.supervised_step(start), None);
        worker.run();
        assert_eq!(script.releases(), 1);
    }

    #[test]
    fn failure_streak_reconnects() {
        let script = Script::new([Step::Frame(1)]);
        let mut worker = worker(&script);
        let start = Instant::now();
        worker.step(start).expect("open");
        worker.step(start).expect("read");

        let mut now = start;
        let mut pauses = Vec::new();
        for _ in 0..5 {
            now += Duration::from_secs(1);
            pauses.push(worker.step(now).expect("fail"));
        }
        assert_eq!(pauses[0], Some(Duration::from_millis(100)));
        assert_eq!(pauses[1], Some(Duration::from_secs(1)));
        assert_eq!(pauses[4], Some(Duration::ZERO));
        assert!(!worker.is_connected());
        assert_eq!(script.releases(), 1);
        // The cached chunk was re-sent once.
        assert_eq!(worker.sink.chunks.len(), 2);
    }

    #[test]
    fn unexpected_errors_release_and_cool_down() {
        let script = Script::new([Step::Frame(1), Step::Unexpected]);
        let mut worker = worker(&script);
        let start = Instant::now();
        worker.step(start).expect("open");
        worker.step(start).expect("read");

        let pause = worker.supervised_step(start + Duration::from_secs(1));
        assert_eq!(pause, Some(Duration::from_secs(2)));
        assert!(!worker.is_connected());
    }
}
