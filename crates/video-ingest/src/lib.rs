//! Upstream video acquisition.
//!
//! [`StreamAcquirer`] walks an ordered ladder of [`AcquisitionStrategy`]
//! implementations and hands back the first [`Connection`] that proves it
//! can deliver frames. [`FfmpegStrategy`] provides the production ladder.

mod acquire;
mod ffmpeg;
mod types;

use std::time::Duration;

pub use acquire::{AcquisitionStrategy, Connection, StrategyProbe, StreamAcquirer, VideoSource};
pub use ffmpeg::{DEFAULT_OPEN_TIMEOUT, DecodePath, FfmpegStrategy, SourceKind};
pub use types::{CaptureError, Frame, FrameFormat};

/// Build an acquirer that tries the given FFmpeg decode paths in order.
/// `open_timeout` bounds the wait for each strategy's first frame and
/// `read_timeout` every read after that.
pub fn ffmpeg_acquirer(
    paths: &[DecodePath],
    target_size: (u32, u32),
    read_timeout: Duration,
    open_timeout: Duration,
) -> StreamAcquirer {
    let strategies = paths
        .iter()
        .map(|&path| {
            Box::new(FfmpegStrategy::new(path, target_size, read_timeout).with_open_timeout(open_timeout))
                as Box<dyn AcquisitionStrategy>
        })
        .collect();
    StreamAcquirer::new(strategies)
}
