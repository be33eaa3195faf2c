use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use video_ingest::{AcquisitionStrategy, CaptureError, Frame, StreamAcquirer, VideoSource};

/// Outcome of one scripted read.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Step {
    /// A 4x2 frame filled with this value.
    Frame(u8),
    Fail,
    Unexpected,
    Panic,
}

/// Shared script driving every source opened by [`Script::acquirer`]. Reads
/// past the end of the script fail.
#[derive(Clone, Default)]
pub(crate) struct Script {
    steps: Arc<Mutex<VecDeque<Step>>>,
    pub(crate) refuse: Arc<AtomicBool>,
    pub(crate) opens: Arc<AtomicUsize>,
    pub(crate) releases: Arc<AtomicUsize>,
}

impl Script {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let script = Self::default();
        script.push(steps);
        script
    }

    pub(crate) fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.steps.lock().expect("script").extend(steps);
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub(crate) fn acquirer(&self) -> StreamAcquirer {
        StreamAcquirer::new(vec![Box::new(ScriptedStrategy {
            script: self.clone(),
        })])
    }

    fn next(&self) -> Step {
        self.steps.lock().expect("script").pop_front().unwrap_or(Step::Fail)
    }
}

pub(crate) fn frame(value: u8) -> Frame {
    Frame::bgr8(vec![value; 4 * 2 * 3], 4, 2)
}

struct ScriptedStrategy {
    script: Script,
}

impl AcquisitionStrategy for ScriptedStrategy {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&self, uri: &str) -> Result<Box<dyn VideoSource>, CaptureError> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        if self.script.refuse.load(Ordering::SeqCst) {
            return Err(CaptureError::Open {
                uri: uri.to_string(),
                strategy: "scripted".to_string(),
            });
        }
        Ok(Box::new(ScriptedSource {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedSource {
    script: Script,
}

impl VideoSource for ScriptedSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        match self.script.next() {
            Step::Frame(value) => Ok(frame(value)),
            Step::Fail => Err(CaptureError::Closed),
            Step::Unexpected => Err(CaptureError::Other(anyhow::anyhow!("decoder crashed"))),
            Step::Panic => panic!("decoder panicked"),
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.script.releases.fetch_add(1, Ordering::SeqCst);
    }
}
