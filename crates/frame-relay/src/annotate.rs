//! Frame annotation hook.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use serde_json::{Value, json};
use tracing::warn;
use video_ingest::Frame;

/// External detector invoked once per captured frame. The returned value is
/// forwarded verbatim to subscribers.
pub trait Annotator: Send {
    fn annotate(&mut self, frame: Frame) -> anyhow::Result<(Frame, Value)>;
}

impl<F> Annotator for F
where
    F: FnMut(Frame) -> anyhow::Result<(Frame, Value)> + Send,
{
    fn annotate(&mut self, frame: Frame) -> anyhow::Result<(Frame, Value)> {
        self(frame)
    }
}

pub fn empty_detections() -> Value {
    json!({})
}

pub fn disconnected_detections() -> Value {
    json!({ "error": "Stream disconnected" })
}

/// Run `hook` on a private copy of `frame`.
///
/// Errors and panics inside the hook are contained: the original frame is
/// passed through with empty detections.
pub fn annotate_frame(hook: &mut dyn Annotator, frame: &Arc<Frame>) -> (Arc<Frame>, Value) {
    let copy = Frame::clone(frame);
    match panic::catch_unwind(AssertUnwindSafe(|| hook.annotate(copy))) {
        Ok(Ok((annotated, detections))) => (Arc::new(annotated), detections),
        Ok(Err(err)) => {
            warn!("Annotation failed, passing frame through: {err:#}");
            metrics::counter!("relay_annotation_failures_total").increment(1);
            (frame.clone(), empty_detections())
        }
        Err(_) => {
            warn!("Annotation hook panicked, passing frame through");
            metrics::counter!("relay_annotation_failures_total").increment(1);
            (frame.clone(), empty_detections())
        }
    }
}
