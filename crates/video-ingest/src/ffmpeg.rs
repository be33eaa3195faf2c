//! FFmpeg subprocess decoders.
//!
//! Every strategy spawns `ffmpeg`, asks it for `bgr24` rawvideo scaled to
//! the configured size, and reads fixed-size frames from its stdout on a
//! background thread. Only the decode flags differ between strategies.

use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::debug;

use crate::{
    acquire::{AcquisitionStrategy, VideoSource},
    types::{CaptureError, Frame, FrameFormat},
};

/// Frames queued between the reader thread and the consumer. Older frames
/// are evicted when the consumer falls behind.
const READER_QUEUE: usize = 2;

/// Default wait for the first frame, which includes RTSP negotiation and
/// the first keyframe.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport inferred from the source URI.
pub enum SourceKind {
    Rtsp,
    Device,
    Other,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("/dev/video") {
            SourceKind::Device
        } else {
            SourceKind::Other
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Decode pipeline used by an FFmpeg strategy, most capable first.
pub enum DecodePath {
    /// NVIDIA NVDEC via CUDA.
    Nvdec,
    /// Whatever hardware decoder FFmpeg can find.
    HwAccel,
    /// Plain software decode.
    Software,
}

impl DecodePath {
    pub const LADDER: [DecodePath; 3] = [DecodePath::Nvdec, DecodePath::HwAccel, DecodePath::Software];

    pub fn label(self) -> &'static str {
        match self {
            DecodePath::Nvdec => "nvdec",
            DecodePath::HwAccel => "hwaccel",
            DecodePath::Software => "software",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nvdec" | "cuda" => Some(DecodePath::Nvdec),
            "hwaccel" | "auto" => Some(DecodePath::HwAccel),
            "software" | "cpu" => Some(DecodePath::Software),
            _ => None,
        }
    }
}

/// Opens the source with a dedicated `ffmpeg` child process.
pub struct FfmpegStrategy {
    path: DecodePath,
    target_size: (u32, u32),
    read_timeout: Duration,
    open_timeout: Duration,
    program: String,
}

impl FfmpegStrategy {
    pub fn new(path: DecodePath, target_size: (u32, u32), read_timeout: Duration) -> Self {
        Self {
            path,
            target_size,
            read_timeout,
            open_timeout: DEFAULT_OPEN_TIMEOUT.max(read_timeout),
            program: "ffmpeg".to_string(),
        }
    }

    /// Wait up to `timeout` for the first frame after spawning ffmpeg.
    /// Never shorter than the read timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout.max(self.read_timeout);
        self
    }

    /// Override the ffmpeg executable, e.g. a vendored build.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Command-line arguments handed to ffmpeg for `uri`.
    pub fn args(&self, uri: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        match SourceKind::from_uri(uri) {
            SourceKind::Rtsp => {
                args.extend(
                    [
                        "-rtsp_transport",
                        "tcp",
                        "-fflags",
                        "nobuffer",
                        "-flags",
                        "low_delay",
                        "-max_delay",
                        "0",
                    ]
                    .iter()
                    .map(|s| s.to_string()),
                );
            }
            SourceKind::Device => {
                args.extend(["-f", "video4linux2"].iter().map(|s| s.to_string()));
            }
            SourceKind::Other => {}
        }

        match self.path {
            DecodePath::Nvdec => {
                args.extend(
                    ["-hwaccel", "cuda", "-c:v", "h264_cuvid"]
                        .iter()
                        .map(|s| s.to_string()),
                );
            }
            DecodePath::HwAccel => {
                args.extend(["-hwaccel", "auto"].iter().map(|s| s.to_string()));
            }
            DecodePath::Software => {}
        }

        let (width, height) = self.target_size;
        args.push("-i".into());
        args.push(uri.to_string());
        args.extend(
            [
                "-an".to_string(),
                "-vf".to_string(),
                format!("scale={width}:{height}"),
                "-pix_fmt".to_string(),
                "bgr24".to_string(),
                "-f".to_string(),
                "rawvideo".to_string(),
                "-".to_string(),
            ]
            .into_iter(),
        );
        args
    }
}

impl AcquisitionStrategy for FfmpegStrategy {
    fn name(&self) -> &str {
        self.path.label()
    }

    fn open(&self, uri: &str) -> Result<Box<dyn VideoSource>, CaptureError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(uri))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|err| {
            debug!("failed to spawn {}: {err}", self.program);
            CaptureError::Open {
                uri: uri.to_string(),
                strategy: self.path.label().to_string(),
            }
        })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                reap(&mut child);
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };

        let (tx, rx) = bounded(READER_QUEUE);
        let evict = rx.clone();
        let target_size = self.target_size;
        let spawned = thread::Builder::new()
            .name(format!("ffmpeg-{}", self.path.label()))
            .spawn(move || reader_loop(stdout, target_size, tx, evict));
        if let Err(err) = spawned {
            reap(&mut child);
            return Err(CaptureError::Other(err.into()));
        }

        Ok(Box::new(FfmpegSource {
            child,
            frames: rx,
            read_timeout: self.read_timeout,
            open_timeout: self.open_timeout,
        }))
    }
}

/// Running ffmpeg child plus the receiving end of its reader thread.
struct FfmpegSource {
    child: Child,
    frames: Receiver<Result<Frame, CaptureError>>,
    read_timeout: Duration,
    open_timeout: Duration,
}

impl FfmpegSource {
    fn recv_within(&self, timeout: Duration) -> Result<Frame, CaptureError> {
        match self.frames.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }
}

impl VideoSource for FfmpegSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        self.recv_within(self.read_timeout)
    }

    fn read_first(&mut self) -> Result<Frame, CaptureError> {
        self.recv_within(self.open_timeout)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        reap(&mut self.child);
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn reader_loop(
    mut stdout: ChildStdout,
    target_size: (u32, u32),
    tx: Sender<Result<Frame, CaptureError>>,
    evict: Receiver<Result<Frame, CaptureError>>,
) {
    let frame_bytes = Frame::packed_len(target_size.0, target_size.1, FrameFormat::Bgr8);
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        let item = match stdout.read_exact(&mut buffer) {
            Ok(()) => Ok(Frame::bgr8(buffer.clone(), target_size.0, target_size.1)),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::Closed),
            Err(err) => Err(CaptureError::Other(err.into())),
        };
        let finished = item.is_err();
        if !push_latest(&tx, &evict, item) || finished {
            break;
        }
    }
}

/// Queue `item`, evicting the oldest entry if the queue is full. Returns
/// false if the channel is disconnected.
fn push_latest<T>(tx: &Sender<T>, evict: &Receiver<T>, item: T) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(item)) => {
            let _ = evict.try_recv();
            !matches!(tx.try_send(item), Err(TrySendError::Disconnected(_)))
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}
