use chrono::Utc;
use thiserror::Error;

/// Raw BGR frame decoded from an upstream video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Wrap a packed BGR8 buffer, stamping it with the current wall clock.
    pub fn bgr8(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }

    /// A frame without pixels or with a zero dimension never counts as a
    /// successful read.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    /// Number of bytes a packed frame of this size occupies.
    pub fn packed_len(width: u32, height: u32, format: FrameFormat) -> usize {
        (width as usize) * (height as usize) * format.bytes_per_pixel()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{strategy} could not open video source {uri:?}")]
    Open { uri: String, strategy: String },
    #[error("no acquisition strategy could open {uri:?}")]
    Exhausted { uri: String },
    #[error("no frame arrived within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("source returned an empty frame")]
    EmptyFrame,
    #[error("decoder closed the stream")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaptureError {
    /// Whether the error came from a read on an already open source rather
    /// than from opening it.
    pub fn is_read_failure(&self) -> bool {
        matches!(
            self,
            CaptureError::Timeout { .. } | CaptureError::EmptyFrame | CaptureError::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_frames_are_empty() {
        assert!(Frame::bgr8(vec![0; 12], 0, 4).is_empty());
        assert!(Frame::bgr8(Vec::new(), 2, 2).is_empty());
        assert!(!Frame::bgr8(vec![0; 12], 2, 2).is_empty());
    }

    #[test]
    fn packed_len_counts_three_bytes_per_pixel() {
        assert_eq!(Frame::packed_len(4, 2, FrameFormat::Bgr8), 24);
    }

    #[test]
    fn read_failures_are_distinguished_from_open_failures() {
        assert!(CaptureError::Closed.is_read_failure());
        assert!(CaptureError::Timeout { timeout_ms: 10 }.is_read_failure());
        assert!(
            !CaptureError::Open {
                uri: "rtsp://cam".into(),
                strategy: "software".into()
            }
            .is_read_failure()
        );
    }
}
