//! Capture loop.
//!
//! Owns the connection lifecycle for one channel: waits out the reopen
//! delay while disconnected, opens the source through the acquirer, reads
//! one frame per iteration and classifies read failures. Every iteration is
//! supervised so that no error or panic ends the loop; only deactivating
//! the channel does.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use video_ingest::{Connection, Frame, StreamAcquirer};

use crate::{
    annotate::{Annotator, annotate_frame, empty_detections},
    channel::Channel,
    config::CaptureTuning,
};

/// Recovery action for a failed read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadFailureAction {
    /// Re-publish the last known good frame.
    ServeCached,
    /// Release the connection and reopen right away.
    Reconnect,
    /// Skip this iteration.
    Retry,
}

/// Map the current failure streak to a recovery action.
pub(crate) fn classify_read_failure(failures: u32, max_failures: u32, has_cached: bool) -> ReadFailureAction {
    if failures >= max_failures {
        ReadFailureAction::Reconnect
    } else if has_cached && failures < max_failures / 2 {
        ReadFailureAction::ServeCached
    } else {
        ReadFailureAction::Retry
    }
}

enum Link {
    Disconnected { last_attempt: Option<Instant> },
    Connected(Connection),
}

/// Producer side of a channel.
pub struct CaptureLoop {
    channel: Arc<Channel>,
    acquirer: Arc<StreamAcquirer>,
    source_uri: String,
    tuning: CaptureTuning,
    annotator: Option<Box<dyn Annotator>>,
    link: Link,
    cached: Option<Arc<Frame>>,
    last_success: Option<Instant>,
}

impl CaptureLoop {
    pub fn new(
        channel: Arc<Channel>,
        acquirer: Arc<StreamAcquirer>,
        source_uri: impl Into<String>,
        tuning: CaptureTuning,
    ) -> Self {
        Self {
            channel,
            acquirer,
            source_uri: source_uri.into(),
            tuning,
            annotator: None,
            link: Link::Disconnected { last_attempt: None },
            cached: None,
            last_success: None,
        }
    }

    pub fn with_annotator(mut self, annotator: Box<dyn Annotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected(_))
    }

    /// Run until the channel is deactivated, then release the connection.
    pub fn run(mut self) {
        let span = tracing::info_span!("capture.loop", channel = %self.channel.id());
        let _guard = span.enter();
        info!("Capture loop started for {}", self.source_uri);

        while self.channel.is_active() {
            let pause = self.supervised_step(Instant::now());
            if !pause.is_zero() && !self.channel.sleep_while_active(pause) {
                break;
            }
        }

        self.link = Link::Disconnected { last_attempt: None };
        self.cached = None;
        let mut state = self.channel.lock();
        state.health.connected = false;
        state.health.strategy = None;
        drop(state);
        info!("Capture loop stopped");
    }

    /// Run one iteration, converting any error or panic into a forced
    /// disconnect followed by the error cooldown.
    pub fn supervised_step(&mut self, now: Instant) -> Duration {
        match panic::catch_unwind(AssertUnwindSafe(|| self.step(now))) {
            Ok(Ok(pause)) => pause,
            Ok(Err(err)) => {
                error!("Capture iteration failed: {err:#}");
                self.force_disconnect(now);
                self.tuning.error_cooldown
            }
            Err(_) => {
                error!("Capture iteration panicked");
                self.force_disconnect(now);
                self.tuning.error_cooldown
            }
        }
    }

    /// Advance the state machine once and return how long to pause.
    pub fn step(&mut self, now: Instant) -> Result<Duration> {
        match self.link {
            Link::Disconnected { last_attempt } => Ok(self.try_open(last_attempt, now)),
            Link::Connected(_) => self.read_once(now),
        }
    }

    fn try_open(&mut self, last_attempt: Option<Instant>, now: Instant) -> Duration {
        if let Some(at) = last_attempt {
            let waited = now.saturating_duration_since(at);
            if waited < self.tuning.reopen_delay {
                return self.tuning.reopen_poll.min(self.tuning.reopen_delay - waited);
            }
        }

        self.link = Link::Disconnected {
            last_attempt: Some(now),
        };
        let span = tracing::info_span!("capture.open", channel = %self.channel.id());
        let _guard = span.enter();
        match self.acquirer.open(&self.source_uri) {
            Ok(connection) => {
                info!("Connected using {}", connection.strategy());
                self.channel.lock().mark_connected(connection.strategy(), now);
                self.link = Link::Connected(connection);
                Duration::ZERO
            }
            Err(err) => {
                warn!("Failed to open stream: {err}");
                metrics::counter!("relay_acquisition_failures_total").increment(1);
                self.channel.lock().record_failure(now);
                self.tuning.reopen_delay / 2
            }
        }
    }

    fn read_once(&mut self, now: Instant) -> Result<Duration> {
        let Link::Connected(connection) = &mut self.link else {
            return Ok(Duration::ZERO);
        };
        let span = tracing::info_span!("capture.read", strategy = connection.strategy());
        let _guard = span.enter();

        match connection.read() {
            Ok(frame) => {
                self.on_frame(frame, now);
                Ok(self.tuning.success_pause)
            }
            Err(err) if err.is_read_failure() => {
                debug!("Read failed: {err}");
                Ok(self.on_read_failure(now))
            }
            Err(err) => Err(err).context("unexpected capture error"),
        }
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) {
        if let Some(previous) = self.last_success {
            let gap = now.saturating_duration_since(previous);
            if gap > self.tuning.capture_gap_warning {
                warn!("Capture gap of {:.2}s between frames", gap.as_secs_f32());
            }
        }
        self.last_success = Some(now);

        let frame = Arc::new(frame);
        self.cached = Some(frame.clone());
        let (published, annotation) = match self.annotator.as_mut() {
            Some(hook) => annotate_frame(hook.as_mut(), &frame),
            None => (frame, empty_detections()),
        };

        self.channel.lock().publish_frame(published, annotation);
        metrics::counter!("relay_frames_captured_total").increment(1);
    }

    fn on_read_failure(&mut self, now: Instant) -> Duration {
        metrics::counter!("relay_read_failures_total").increment(1);

        let mut state = self.channel.lock();
        let failures = state.record_failure(now);
        match classify_read_failure(failures, self.tuning.max_failures, self.cached.is_some()) {
            ReadFailureAction::ServeCached => {
                if let Some(cached) = &self.cached {
                    state.publish_cached(cached.clone());
                }
                self.tuning.failure_pause
            }
            ReadFailureAction::Retry => self.tuning.retry_pause,
            ReadFailureAction::Reconnect => {
                drop(state);
                warn!("{failures} consecutive read failures, reconnecting");
                metrics::counter!("relay_reconnects_total").increment(1);
                self.force_disconnect(now);
                Duration::ZERO
            }
        }
    }

    /// Release the connection and clear the cache. The reopen timer is reset
    /// so the next iteration attempts to reconnect immediately.
    fn force_disconnect(&mut self, now: Instant) {
        let was_connected = self.is_connected();
        self.link = Link::Disconnected { last_attempt: None };
        self.cached = None;
        if was_connected {
            self.channel.lock().mark_disconnected(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        annotate::disconnected_detections,
        channel::{ChannelSettings, QualityBounds},
        test_support::{Script, Step},
    };

    fn channel() -> Arc<Channel> {
        Channel::new(
            "cam",
            &ChannelSettings {
                default_quality: 65,
                quality_bounds: QualityBounds::new(30, 95),
                target_scale: None,
                buffer_capacity: 1,
            },
        )
    }

    fn capture(script: &Script, channel: &Arc<Channel>) -> CaptureLoop {
        CaptureLoop::new(
            channel.clone(),
            Arc::new(script.acquirer()),
            "rtsp://cam/stream",
            CaptureTuning::default(),
        )
    }

    fn latest_value(channel: &Channel) -> Option<u8> {
        channel.lock().buffer.take_latest().map(|frame| frame.data[0])
    }

    #[test]
    fn classification_follows_the_failure_streak() {
        use ReadFailureAction::*;
        assert_eq!(classify_read_failure(1, 5, true), ServeCached);
        assert_eq!(classify_read_failure(2, 5, true), Retry);
        assert_eq!(classify_read_failure(1, 5, false), Retry);
        assert_eq!(classify_read_failure(5, 5, true), Reconnect);
        assert_eq!(classify_read_failure(7, 5, false), Reconnect);
    }

    #[test]
    fn waits_out_the_reopen_delay_between_attempts() {
        let script = Script::default();
        script.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
        let channel = channel();
        let mut capture = capture(&script, &channel);
        let start = Instant::now();

        assert_eq!(capture.step(start).expect("step"), Duration::from_millis(2500));
        assert_eq!(script.opens(), 1);

        let pause = capture.step(start + Duration::from_secs(3)).expect("step");
        assert_eq!(pause, Duration::from_millis(500));
        assert_eq!(script.opens(), 1);

        capture.step(start + Duration::from_secs(5)).expect("step");
        assert_eq!(script.opens(), 2);
        assert!(!capture.is_connected());
    }

    #[test]
    fn connects_and_publishes_the_test_frame_first() {
        let script = Script::new([Step::Frame(1), Step::Frame(2)]);
        let channel = channel();
        let mut capture = capture(&script, &channel);
        let now = Instant::now();

        assert_eq!(capture.step(now).expect("open"), Duration::ZERO);
        assert!(capture.is_connected());
        assert!(channel.lock().health.connected);

        assert_eq!(capture.step(now).expect("read"), Duration::from_millis(5));
        assert_eq!(latest_value(&channel), Some(1));
        assert_eq!(capture.step(now).expect("read"), Duration::from_millis(5));
        assert_eq!(latest_value(&channel), Some(2));
    }

    #[test]
    fn early_failures_substitute_the_cached_frame() {
        let script = Script::new([Step::Frame(7), Step::Fail]);
        let channel = channel();
        let mut capture = capture(&script, &channel).with_annotator(Box::new(
            |frame: Frame| -> anyhow::Result<(Frame, serde_json::Value)> {
                Ok((frame, json!({"people": 3})))
            },
        ));
        let now = Instant::now();
        capture.step(now).expect("open");
        capture.step(now).expect("read");
        assert_eq!(channel.lock().last_annotation, json!({"people": 3}));
        channel.lock().buffer.clear();

        assert_eq!(capture.step(now).expect("fail"), Duration::from_millis(50));
        {
            let state = channel.lock();
            assert_eq!(state.health.consecutive_failures, 1);
            assert_eq!(state.last_annotation, empty_detections());
            assert_eq!(state.buffer.len(), 1);
        }
        assert_eq!(latest_value(&channel), Some(7));
    }

    #[test]
    fn reaching_the_threshold_reconnects_immediately() {
        let script = Script::new([Step::Frame(1)]);
        let channel = channel();
        let mut capture = capture(&script, &channel);
        let start = Instant::now();
        capture.step(start).expect("open");
        capture.step(start).expect("primed read");

        let pauses: Vec<_> = (0..5).map(|_| capture.step(start).expect("fail")).collect();
        assert_eq!(
            pauses,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::ZERO,
            ]
        );
        assert!(!capture.is_connected());
        assert_eq!(script.releases(), 1);
        {
            let state = channel.lock();
            assert!(state.disconnect_notice);
            assert_eq!(state.last_annotation, disconnected_detections());
        }

        // The reopen timer was reset, so the very next step reconnects.
        script.push([Step::Frame(2)]);
        capture.step(start).expect("reopen");
        assert_eq!(script.opens(), 2);
        assert!(capture.is_connected());
    }

    #[test]
    fn unexpected_errors_force_a_disconnect_and_cooldown() {
        let script = Script::new([Step::Frame(1), Step::Unexpected]);
        let channel = channel();
        let mut capture = capture(&script, &channel);
        let now = Instant::now();
        capture.supervised_step(now);
        capture.supervised_step(now);

        assert_eq!(capture.supervised_step(now), Duration::from_secs(5));
        assert!(!capture.is_connected());
        assert!(channel.lock().disconnect_notice);
        assert_eq!(script.releases(), 1);
    }

    #[test]
    fn panics_inside_an_iteration_are_contained() {
        let script = Script::new([Step::Frame(1), Step::Panic]);
        let channel = channel();
        let mut capture = capture(&script, &channel);
        let now = Instant::now();
        capture.supervised_step(now);
        capture.supervised_step(now);

        assert_eq!(capture.supervised_step(now), Duration::from_secs(5));
        assert!(!capture.is_connected());
        // Reopen is attempted at once; the exhausted script rejects it.
        assert_eq!(capture.supervised_step(now), Duration::from_millis(2500));
        assert_eq!(script.opens(), 2);
    }

    #[test]
    fn buffer_never_exceeds_one_frame() {
        let script = Script::new([
            Step::Frame(1),
            Step::Frame(2),
            Step::Fail,
            Step::Frame(3),
            Step::Fail,
            Step::Fail,
        ]);
        let channel = channel();
        let mut capture = capture(&script, &channel);
        let now = Instant::now();
        for _ in 0..8 {
            capture.supervised_step(now);
            assert!(channel.lock().buffer.len() <= 1);
        }
    }
}
