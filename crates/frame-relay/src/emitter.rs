//! Paced emitter loop.
//!
//! Each cycle takes only the newest buffered frame, encodes it at the
//! channel's current quality and publishes a `frame` event followed by a
//! `detections` event. Once per closed fps window the controller lowers
//! quality when the measured rate falls short of the target. It never
//! raises quality; only explicit requests do.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, error, info, warn};
use video_ingest::Frame;

use crate::{
    annotate::disconnected_detections,
    channel::Channel,
    config::EmitTuning,
    encoding::{FrameEncoder, resize_frame},
    transport::{BroadcastTransport, RelayEvent},
};

/// Consumer side of a channel.
pub struct EmitterLoop {
    channel: Arc<Channel>,
    transport: Arc<dyn BroadcastTransport>,
    encoder: Box<dyn FrameEncoder>,
    tuning: EmitTuning,
    last_emit: Option<Instant>,
}

impl EmitterLoop {
    pub fn new(
        channel: Arc<Channel>,
        transport: Arc<dyn BroadcastTransport>,
        encoder: Box<dyn FrameEncoder>,
        tuning: EmitTuning,
    ) -> Self {
        Self {
            channel,
            transport,
            encoder,
            tuning,
            last_emit: None,
        }
    }

    pub fn run(mut self) {
        let span = tracing::info_span!(
            "emit.loop",
            channel = %self.channel.id(),
            target_fps = self.tuning.target_fps
        );
        let _guard = span.enter();
        info!("Emitter loop started");

        while self.channel.is_active() {
            let pause = match panic::catch_unwind(AssertUnwindSafe(|| self.step(Instant::now()))) {
                Ok(pause) => pause,
                Err(_) => {
                    error!("Emit iteration panicked");
                    self.tuning.interval()
                }
            };
            if !pause.is_zero() && !self.channel.sleep_while_active(pause) {
                break;
            }
        }
        info!("Emitter loop stopped");
    }

    /// Run one cycle and return how long to pause before the next.
    pub fn step(&mut self, now: Instant) -> Duration {
        let interval = self.tuning.interval();
        if let Some(last) = self.last_emit {
            let since = now.saturating_duration_since(last);
            if since < interval {
                return interval - since;
            }
        }

        let (frame, annotation, quality, scale) = {
            let mut state = self.channel.lock();
            match state.buffer.take_latest() {
                Some(frame) => (
                    frame,
                    state.last_annotation.clone(),
                    state.quality,
                    state.target_scale,
                ),
                None => {
                    let notice = std::mem::take(&mut state.disconnect_notice);
                    drop(state);
                    if notice {
                        debug!("Announcing disconnect to subscribers");
                        self.transport
                            .publish(self.channel.id(), RelayEvent::Detections(disconnected_detections()));
                    }
                    return interval / 3;
                }
            }
        };

        let span = tracing::info_span!("emit.cycle", quality = quality);
        let _guard = span.enter();

        let jpeg = match self.encode(&frame, quality, scale) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                warn!("Skipping emit cycle: {err:#}");
                metrics::counter!("relay_encode_failures_total").increment(1);
                return Duration::ZERO;
            }
        };

        let channel_id = self.channel.id();
        self.transport
            .publish(channel_id, RelayEvent::Frame(Bytes::from(jpeg)));
        self.transport
            .publish(channel_id, RelayEvent::Detections(annotation));
        self.last_emit = Some(now);
        metrics::counter!("relay_frames_emitted_total").increment(1);

        self.update_rate(now);
        Duration::ZERO
    }

    fn encode(&mut self, frame: &Frame, quality: u8, scale: Option<f32>) -> anyhow::Result<Vec<u8>> {
        match scale {
            Some(scale) => {
                let resized = resize_frame(frame, scale)?;
                self.encoder.encode(&resized, quality)
            }
            None => self.encoder.encode(frame, quality),
        }
    }

    fn update_rate(&self, now: Instant) {
        let threshold = self.tuning.target_fps * self.tuning.degrade_ratio;
        let mut state = self.channel.lock();
        state.frames_emitted += 1;
        let Some(fps) = state.fps.record(now, self.tuning.fps_window) else {
            return;
        };
        let lowered = if fps < threshold {
            state.degrade_quality(self.tuning.quality_step)
        } else {
            None
        };
        let quality = state.quality;
        drop(state);

        metrics::gauge!("relay_emit_fps").set(fps as f64);
        metrics::gauge!("relay_quality").set(quality as f64);
        if let Some(quality) = lowered {
            info!("Emit rate {fps:.1} fps below target, lowering quality to {quality}");
        }
    }
}
