//! Per-camera shared state.
//!
//! A [`Channel`] pairs an atomic liveness flag with a single mutex guarding
//! everything the capture and emitter loops exchange. Critical sections only
//! swap pointers and bump counters; decoding, encoding and network I/O stay
//! outside the lock.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;
use video_ingest::Frame;

use crate::{
    annotate::{disconnected_detections, empty_detections},
    buffer::LatestBuffer,
};

/// Longest single sleep taken by a loop before it re-checks liveness.
pub const LIVENESS_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Inclusive range every quality value is clamped into.
pub struct QualityBounds {
    pub min: u8,
    pub max: u8,
}

impl QualityBounds {
    pub fn new(min: u8, max: u8) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self { min, max }
    }

    pub fn clamp(&self, quality: u8) -> u8 {
        quality.clamp(self.min, self.max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Named quality presets clients can request.
pub enum QualityLevel {
    Low,
    Medium,
    High,
}

impl QualityLevel {
    pub fn parse(level: &str) -> Option<Self> {
        match level.trim().to_ascii_lowercase().as_str() {
            "low" => Some(QualityLevel::Low),
            "medium" => Some(QualityLevel::Medium),
            "high" => Some(QualityLevel::High),
            _ => None,
        }
    }

    pub fn quality(self) -> u8 {
        match self {
            QualityLevel::Low => 30,
            QualityLevel::Medium => 55,
            QualityLevel::High => 75,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Health {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub connected: bool,
    /// Strategy behind the live connection, if any.
    pub strategy: Option<String>,
}

#[derive(Clone, Debug)]
/// Rolling emit-rate window.
pub struct FpsWindow {
    pub frame_count: u32,
    pub window_start: Instant,
    pub current_fps: f32,
}

impl FpsWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            window_start: now,
            current_fps: 0.0,
        }
    }

    /// Count one emitted frame. Returns the measured rate when this emit
    /// closes the window.
    pub fn record(&mut self, now: Instant, period: Duration) -> Option<f32> {
        self.frame_count = self.frame_count.saturating_add(1);
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < period {
            return None;
        }
        self.current_fps = self.frame_count as f32 / elapsed.as_secs_f32();
        self.frame_count = 0;
        self.window_start = now;
        Some(self.current_fps)
    }

    pub fn restart(&mut self, now: Instant) {
        self.frame_count = 0;
        self.window_start = now;
        self.current_fps = 0.0;
    }
}

/// Initial tunables for a new channel.
#[derive(Clone, Debug)]
pub struct ChannelSettings {
    pub default_quality: u8,
    pub quality_bounds: QualityBounds,
    pub target_scale: Option<f32>,
    pub buffer_capacity: usize,
}

/// Everything guarded by the channel mutex.
#[derive(Debug)]
pub struct ChannelState {
    pub buffer: LatestBuffer<Arc<Frame>>,
    pub last_annotation: Value,
    pub quality: u8,
    pub default_quality: u8,
    pub quality_bounds: QualityBounds,
    pub target_scale: Option<f32>,
    pub health: Health,
    pub fps: FpsWindow,
    /// Set on a forced disconnect until the emitter has announced it.
    pub disconnect_notice: bool,
    pub frames_captured: u64,
    pub frames_emitted: u64,
}

impl ChannelState {
    fn new(settings: &ChannelSettings, now: Instant) -> Self {
        Self {
            buffer: LatestBuffer::new(settings.buffer_capacity),
            last_annotation: empty_detections(),
            quality: settings.quality_bounds.clamp(settings.default_quality),
            default_quality: settings.quality_bounds.clamp(settings.default_quality),
            quality_bounds: settings.quality_bounds,
            target_scale: settings.target_scale,
            health: Health::default(),
            fps: FpsWindow::new(now),
            disconnect_notice: false,
            frames_captured: 0,
            frames_emitted: 0,
        }
    }

    /// Publish a freshly captured frame with its annotation.
    pub fn publish_frame(&mut self, frame: Arc<Frame>, annotation: Value) {
        self.health.consecutive_failures = 0;
        self.last_annotation = annotation;
        self.buffer.push(frame);
        self.frames_captured += 1;
    }

    /// Re-publish the last known good frame without its stale annotation.
    pub fn publish_cached(&mut self, frame: Arc<Frame>) {
        self.last_annotation = empty_detections();
        self.buffer.push(frame);
    }

    /// Count one failed read and return the new streak length.
    pub fn record_failure(&mut self, now: Instant) -> u32 {
        self.health.consecutive_failures = self.health.consecutive_failures.saturating_add(1);
        self.health.last_failure_at = Some(now);
        self.health.consecutive_failures
    }

    pub fn mark_connected(&mut self, strategy: &str, now: Instant) {
        self.health.connected = true;
        self.health.strategy = Some(strategy.to_string());
        self.health.consecutive_failures = 0;
        self.disconnect_notice = false;
        self.fps.restart(now);
    }

    /// Record a forced disconnect and raise the one-shot notice.
    pub fn mark_disconnected(&mut self, now: Instant) {
        self.health.connected = false;
        self.health.strategy = None;
        self.last_annotation = disconnected_detections();
        self.disconnect_notice = true;
        self.fps.restart(now);
    }

    /// Lower quality by `step` without crossing the floor. Returns the new
    /// value when it changed.
    pub fn degrade_quality(&mut self, step: u8) -> Option<u8> {
        let lowered = self.quality_bounds.clamp(self.quality.saturating_sub(step));
        if lowered == self.quality {
            return None;
        }
        self.quality = lowered;
        Some(lowered)
    }

    pub fn set_quality(&mut self, quality: u8) -> u8 {
        self.quality = self.quality_bounds.clamp(quality);
        self.quality
    }
}

/// One logical camera.
#[derive(Debug)]
pub struct Channel {
    id: String,
    active: AtomicBool,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub fn new(id: impl Into<String>, settings: &ChannelSettings) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            active: AtomicBool::new(true),
            state: Mutex::new(ChannelState::new(settings, Instant::now())),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ask both loops to exit.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Lock the shared state. A panic while holding the lock does not
    /// invalidate the state, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` in short slices. Returns false as soon as the
    /// channel is deactivated.
    pub fn sleep_while_active(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !self.is_active() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(LIVENESS_SLICE));
        }
    }

    pub fn status(&self, subscribers: usize) -> ChannelStatus {
        let now = Instant::now();
        let state = self.lock();
        ChannelStatus {
            id: self.id.clone(),
            active: self.is_active(),
            connected: state.health.connected,
            strategy: state.health.strategy.clone(),
            quality: state.quality,
            target_scale: state.target_scale,
            consecutive_failures: state.health.consecutive_failures,
            seconds_since_last_failure: state
                .health
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
            current_fps: state.fps.current_fps,
            frames_captured: state.frames_captured,
            frames_emitted: state.frames_emitted,
            subscribers,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
/// Snapshot served by the status endpoint.
pub struct ChannelStatus {
    pub id: String,
    pub active: bool,
    pub connected: bool,
    pub strategy: Option<String>,
    pub quality: u8,
    pub target_scale: Option<f32>,
    pub consecutive_failures: u32,
    pub seconds_since_last_failure: Option<f64>,
    pub current_fps: f32,
    pub frames_captured: u64,
    pub frames_emitted: u64,
    pub subscribers: usize,
}

/// Channels by id, owned by the relay context and handed to workers.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel`, replacing any previous channel with the same id.
    pub fn insert(&self, channel: Arc<Channel>) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = channels.insert(channel.id().to_string(), channel) {
            previous.deactivate();
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All channels sorted by id.
    pub fn all(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<_> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.id().cmp(b.id()));
        channels
    }

    pub fn deactivate_all(&self) {
        for channel in self.all() {
            channel.deactivate();
        }
    }
}
