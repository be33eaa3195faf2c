//! Configuration for the relay.
//!
//! This module owns translation of CLI arguments (with environment
//! fallbacks) into a `RelayConfig` which downstream stages use without
//! re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use video_ingest::{DEFAULT_OPEN_TIMEOUT, DecodePath};

use crate::channel::{ChannelSettings, QualityBounds};

/// Slowest emit rate either stream accepts.
const MIN_FPS: f32 = 0.1;
/// Shortest reopen delay accepted on the command line. A failed open pauses
/// half of it before the next attempt.
const MIN_REOPEN_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage.
pub struct RelayConfig {
    /// Channel id subscribers join.
    pub channel_id: String,
    /// Upstream stream locator, treated as opaque.
    pub source_uri: String,
    /// Decoded frame width.
    pub width: u32,
    /// Decoded frame height.
    pub height: u32,
    /// Address the HTTP/WebSocket server binds to.
    pub host: String,
    pub port: u16,
    /// Decode strategies, most capable first.
    pub decoders: Vec<DecodePath>,
    pub capture: CaptureTuning,
    pub emit: EmitTuning,
    pub fallback: FallbackTuning,
    pub telemetry: TelemetryOptions,
}

impl RelayConfig {
    /// Default configuration for `source_uri`.
    pub fn for_source(source_uri: impl Into<String>) -> Self {
        Self {
            channel_id: "MainCam".to_string(),
            source_uri: source_uri.into(),
            width: 1280,
            height: 720,
            host: "0.0.0.0".to_string(),
            port: 5000,
            decoders: DecodePath::LADDER.to_vec(),
            capture: CaptureTuning::default(),
            emit: EmitTuning::default(),
            fallback: FallbackTuning::default(),
            telemetry: TelemetryOptions::default(),
        }
    }

    /// Initial tunables for the configured channel.
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            default_quality: self.emit.default_quality,
            quality_bounds: self.emit.quality_bounds,
            target_scale: self.emit.target_scale,
            buffer_capacity: self.capture.buffer_capacity,
        }
    }
}

#[derive(Clone, Debug)]
/// Timing and failure thresholds for the capture loop.
pub struct CaptureTuning {
    /// Minimum time between two acquisition attempts.
    pub reopen_delay: Duration,
    /// Consecutive read failures that force a reconnect.
    pub max_failures: u32,
    /// Longest a single read may block.
    pub read_timeout: Duration,
    /// Longest the test read during acquisition may block.
    pub open_timeout: Duration,
    /// Pause after a successful read.
    pub success_pause: Duration,
    /// Pause after a failed read that was masked or forced a reconnect.
    pub failure_pause: Duration,
    /// Pause after a failed read with nothing to substitute.
    pub retry_pause: Duration,
    /// Poll interval while waiting for the reopen delay to elapse.
    pub reopen_poll: Duration,
    /// Sleep after an unexpected iteration failure.
    pub error_cooldown: Duration,
    /// Gap between successful reads that is worth a warning.
    pub capture_gap_warning: Duration,
    /// Frames the shared buffer holds (1 or 2).
    pub buffer_capacity: usize,
}

impl Default for CaptureTuning {
    fn default() -> Self {
        Self {
            reopen_delay: Duration::from_secs(5),
            max_failures: 5,
            read_timeout: Duration::from_secs(2),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            success_pause: Duration::from_millis(5),
            failure_pause: Duration::from_millis(50),
            retry_pause: Duration::from_millis(100),
            reopen_poll: Duration::from_millis(500),
            error_cooldown: Duration::from_secs(5),
            capture_gap_warning: Duration::from_secs(2),
            buffer_capacity: 1,
        }
    }
}

#[derive(Clone, Debug)]
/// Pacing and quality control for the emitter loop.
pub struct EmitTuning {
    pub target_fps: f32,
    /// Quality a channel starts with and the fallback for unknown levels.
    pub default_quality: u8,
    pub quality_bounds: QualityBounds,
    /// Amount the controller lowers quality per slow window.
    pub quality_step: u8,
    /// Fraction of `target_fps` below which a window counts as slow.
    pub degrade_ratio: f32,
    /// Length of the rolling fps window.
    pub fps_window: Duration,
    /// Resize factor applied before encoding.
    pub target_scale: Option<f32>,
}

impl EmitTuning {
    /// Time between two emits.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps))
    }
}

impl Default for EmitTuning {
    fn default() -> Self {
        Self {
            target_fps: 15.0,
            default_quality: 65,
            quality_bounds: QualityBounds::new(30, 95),
            quality_step: 5,
            degrade_ratio: 0.8,
            fps_window: Duration::from_secs(2),
            target_scale: None,
        }
    }
}

#[derive(Clone, Debug)]
/// Settings for the per-client MJPEG fallback stream.
pub struct FallbackTuning {
    pub target_fps: f32,
    pub quality: u8,
    /// Minimum time between two acquisition attempts.
    pub reopen_delay: Duration,
    /// Consecutive read failures that force a reconnect.
    pub max_failures: u32,
    /// Pause after a failed read before trying again.
    pub read_failure_pause: Duration,
    /// Sleep after an unexpected failure.
    pub error_cooldown: Duration,
}

impl FallbackTuning {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps))
    }
}

impl Default for FallbackTuning {
    fn default() -> Self {
        Self {
            target_fps: 10.0,
            quality: 50,
            reopen_delay: Duration::from_secs(5),
            max_failures: 5,
            read_failure_pause: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing loop spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct RelayCliArgs {
    /// Upstream stream locator.
    #[arg(long = "source", env = "RTSP_URL", value_name = "URI")]
    pub source_uri: String,
    /// Channel id subscribers join.
    #[arg(long = "name", env = "CAMERA_NAME", default_value = "MainCam")]
    pub channel_id: String,
    /// Interface to bind.
    #[arg(long = "host", default_value = "0.0.0.0")]
    pub host: String,
    /// Port for the HTTP and WebSocket endpoints.
    #[arg(long = "port", env = "SOCKET_PORT", default_value_t = 5000)]
    pub port: u16,
    /// Decoded frame width in pixels.
    #[arg(long = "width", default_value_t = 1280)]
    pub width: u32,
    /// Decoded frame height in pixels.
    #[arg(long = "height", default_value_t = 720)]
    pub height: u32,
    /// Decode strategies to try, most capable first.
    #[arg(
        long = "decoders",
        value_delimiter = ',',
        default_value = "nvdec,hwaccel,software"
    )]
    pub decoders: Vec<String>,
    /// Target emit rate.
    #[arg(long = "target-fps", default_value_t = 15.0)]
    pub target_fps: f32,
    /// Starting JPEG quality (1-100).
    #[arg(long = "jpeg-quality", default_value_t = 65)]
    pub jpeg_quality: u8,
    /// Floor for automatic quality reduction.
    #[arg(long = "min-quality", default_value_t = 30)]
    pub min_quality: u8,
    /// Ceiling for any quality request.
    #[arg(long = "max-quality", default_value_t = 95)]
    pub max_quality: u8,
    /// Quality decrement applied per slow fps window.
    #[arg(long = "quality-step", default_value_t = 5)]
    pub quality_step: u8,
    /// Length of the fps measurement window in seconds.
    #[arg(long = "fps-window-secs", default_value_t = 2.0)]
    pub fps_window_secs: f32,
    /// Resize factor applied before encoding, e.g. 0.5.
    #[arg(long = "emit-scale", value_name = "FACTOR")]
    pub emit_scale: Option<f32>,
    /// Seconds between acquisition attempts.
    #[arg(long = "reopen-delay-secs", default_value_t = 5.0)]
    pub reopen_delay_secs: f32,
    /// Consecutive read failures that force a reconnect.
    #[arg(long = "max-failures", default_value_t = 5)]
    pub max_failures: u32,
    /// Longest a single read may block, in milliseconds.
    #[arg(long = "read-timeout-ms", default_value_t = 2000)]
    pub read_timeout_ms: u64,
    /// Longest to wait for the first frame when opening the source, in
    /// milliseconds.
    #[arg(long = "open-timeout-ms", default_value_t = 10_000)]
    pub open_timeout_ms: u64,
    /// Frames held by the shared buffer (1 or 2).
    #[arg(long = "buffer-capacity", default_value_t = 1)]
    pub buffer_capacity: usize,
    /// Emit rate of the MJPEG fallback stream.
    #[arg(long = "fallback-fps", default_value_t = 10.0)]
    pub fallback_fps: f32,
    /// JPEG quality of the MJPEG fallback stream.
    #[arg(long = "fallback-quality", default_value_t = 50)]
    pub fallback_quality: u8,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<RelayCliArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: RelayCliArgs) -> Result<Self> {
        if args.source_uri.trim().is_empty() {
            bail!("Missing source. Provide --source <uri> or set RTSP_URL.");
        }
        if args.channel_id.trim().is_empty() {
            bail!("--name must not be empty");
        }
        if args.width == 0 || args.height == 0 {
            bail!("--width and --height must be positive integers");
        }

        let decoders = parse_decoders(&args.decoders)?;

        for (flag, fps) in [("--target-fps", args.target_fps), ("--fallback-fps", args.fallback_fps)] {
            if !(fps.is_finite() && fps >= MIN_FPS) {
                bail!("{flag} must be a finite rate of at least {MIN_FPS}");
            }
        }
        for (flag, value) in [
            ("--jpeg-quality", args.jpeg_quality),
            ("--min-quality", args.min_quality),
            ("--max-quality", args.max_quality),
            ("--fallback-quality", args.fallback_quality),
        ] {
            if !(1..=100).contains(&value) {
                bail!("{flag} must be an integer between 1 and 100");
            }
        }
        if args.min_quality > args.max_quality {
            bail!("--min-quality must not exceed --max-quality");
        }
        if args.quality_step == 0 {
            bail!("--quality-step must be at least 1");
        }
        let fps_window = Duration::try_from_secs_f32(args.fps_window_secs)
            .map_err(|_| anyhow!("--fps-window-secs must be a finite number of seconds"))?;
        if fps_window.is_zero() {
            bail!("--fps-window-secs must be positive");
        }
        let target_scale = match args.emit_scale {
            Some(scale) if !(scale > 0.1 && scale <= 4.0) => {
                bail!("--emit-scale must be within (0.1, 4.0]")
            }
            Some(scale) if (scale - 1.0).abs() < f32::EPSILON => None,
            other => other,
        };
        let reopen_delay = Duration::try_from_secs_f32(args.reopen_delay_secs)
            .map_err(|_| anyhow!("--reopen-delay-secs must be a finite number of seconds"))?;
        if reopen_delay < MIN_REOPEN_DELAY {
            bail!(
                "--reopen-delay-secs must be at least {}",
                MIN_REOPEN_DELAY.as_secs_f32()
            );
        }
        if args.max_failures == 0 {
            bail!("--max-failures must be at least 1");
        }
        if args.read_timeout_ms == 0 {
            bail!("--read-timeout-ms must be at least 1");
        }
        if args.open_timeout_ms < args.read_timeout_ms {
            bail!("--open-timeout-ms must not be shorter than --read-timeout-ms");
        }
        if !(1..=2).contains(&args.buffer_capacity) {
            bail!("--buffer-capacity must be 1 or 2");
        }

        let quality_bounds = QualityBounds::new(args.min_quality, args.max_quality);

        Ok(Self {
            channel_id: args.channel_id,
            source_uri: args.source_uri,
            width: args.width,
            height: args.height,
            host: args.host,
            port: args.port,
            decoders,
            capture: CaptureTuning {
                reopen_delay,
                max_failures: args.max_failures,
                read_timeout: Duration::from_millis(args.read_timeout_ms),
                open_timeout: Duration::from_millis(args.open_timeout_ms),
                error_cooldown: reopen_delay,
                buffer_capacity: args.buffer_capacity,
                ..CaptureTuning::default()
            },
            emit: EmitTuning {
                target_fps: args.target_fps,
                default_quality: quality_bounds.clamp(args.jpeg_quality),
                quality_bounds,
                quality_step: args.quality_step,
                fps_window,
                target_scale,
                ..EmitTuning::default()
            },
            fallback: FallbackTuning {
                target_fps: args.fallback_fps,
                quality: args.fallback_quality,
                reopen_delay,
                max_failures: args.max_failures,
                ..FallbackTuning::default()
            },
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

fn parse_decoders(values: &[String]) -> Result<Vec<DecodePath>> {
    let mut decoders = Vec::with_capacity(values.len());
    for value in values {
        let path = DecodePath::parse(value)
            .ok_or_else(|| anyhow!("Unrecognised decoder {value:?} (expected nvdec, hwaccel or software)"))?;
        if !decoders.contains(&path) {
            decoders.push(path);
        }
    }
    if decoders.is_empty() {
        bail!("--decoders must name at least one decoder");
    }
    Ok(decoders)
}
