//! JPEG encoding and optional pre-encode resizing.

use std::time::Instant;

use anyhow::{Result, anyhow, bail};
use image::{ImageBuffer, Rgb, RgbImage, codecs::jpeg::JpegEncoder, imageops};
use video_ingest::Frame;

/// Turns raw frames into the wire image format.
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &Frame, quality: u8) -> Result<Vec<u8>>;
}

/// CPU JPEG encoder backed by the `image` crate.
#[derive(Debug, Default)]
pub struct JpegFrameEncoder;

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&mut self, frame: &Frame, quality: u8) -> Result<Vec<u8>> {
        let start = Instant::now();
        let rgb = bgr_to_rgb(frame)?;
        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
            .encode_image(&rgb)
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
        metrics::histogram!("relay_encode_seconds").record(start.elapsed().as_secs_f64());
        Ok(buffer)
    }
}

fn bgr_to_rgb(frame: &Frame) -> Result<RgbImage> {
    let expected = Frame::packed_len(frame.width, frame.height, frame.format);
    if frame.is_empty() || frame.data.len() != expected {
        bail!(
            "frame buffer holds {} bytes, expected {expected} for {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        );
    }
    let mut data = frame.data.clone();
    for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    ImageBuffer::from_raw(frame.width, frame.height, data)
        .ok_or_else(|| anyhow!("invalid {}x{} frame", frame.width, frame.height))
}

/// Resize `frame` by `scale`, keeping its pixel layout.
pub fn resize_frame(frame: &Frame, scale: f32) -> Result<Frame> {
    if !(scale > 0.1) {
        bail!("resize factor {scale} is too small");
    }
    let width = ((frame.width as f32 * scale).round() as u32).max(1);
    let height = ((frame.height as f32 * scale).round() as u32).max(1);
    if width == frame.width && height == frame.height {
        return Ok(frame.clone());
    }

    // Channel order does not matter to the filter, so BGR is resized as-is.
    let source: ImageBuffer<Rgb<u8>, &[u8]> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.data.as_slice())
            .ok_or_else(|| anyhow!("invalid {}x{} frame", frame.width, frame.height))?;
    let resized = imageops::resize(&source, width, height, imageops::FilterType::Triangle);

    Ok(Frame {
        data: resized.into_raw(),
        width,
        height,
        timestamp_ms: frame.timestamp_ms,
        format: frame.format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 8) as u8, (y * 8) as u8, 128]);
            }
        }
        Frame::bgr8(data, width, height)
    }

    #[test]
    fn produces_a_jpeg_stream() {
        let jpeg = JpegFrameEncoder.encode(&gradient(16, 16), 65).expect("encode");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn lower_quality_yields_smaller_output() {
        let frame = gradient(32, 32);
        let high = JpegFrameEncoder.encode(&frame, 95).expect("encode");
        let low = JpegFrameEncoder.encode(&frame, 30).expect("encode");
        assert!(low.len() < high.len());
    }

    #[test]
    fn truncated_frames_fail_to_encode() {
        let frame = Frame::bgr8(vec![0; 10], 2, 2);
        assert!(JpegFrameEncoder.encode(&frame, 65).is_err());
    }

    #[test]
    fn resize_scales_both_dimensions() {
        let resized = resize_frame(&gradient(16, 8), 0.5).expect("resize");
        assert_eq!((resized.width, resized.height), (8, 4));
        assert_eq!(resized.data.len(), 8 * 4 * 3);
        assert!(resize_frame(&gradient(16, 8), 0.05).is_err());
    }
}
