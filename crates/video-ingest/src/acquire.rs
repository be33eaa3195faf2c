//! Ordered acquisition of an upstream source.
//!
//! Each strategy is tried from most to least capable. A strategy is only
//! accepted once it has opened the source and produced one non-empty test
//! frame; anything it opened before failing is dropped, and therefore
//! released, before the next strategy runs.

use tracing::{info, warn};

use crate::types::{CaptureError, Frame};

/// A live, exclusively owned decoder handle. Dropping it releases the
/// underlying resources.
pub trait VideoSource: Send {
    /// Read the next frame. Implementations must return within a bounded
    /// time, reporting a stall as [`CaptureError::Timeout`].
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Read the test frame while the source is being validated. Sources
    /// that take longer to deliver their first frame than a steady-state
    /// read override this with a longer wait.
    fn read_first(&mut self) -> Result<Frame, CaptureError> {
        self.read()
    }
}

/// One concrete way of opening and decoding the upstream source.
pub trait AcquisitionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, uri: &str) -> Result<Box<dyn VideoSource>, CaptureError>;
}

/// Validated connection returned by [`StreamAcquirer::open`].
pub struct Connection {
    source: Box<dyn VideoSource>,
    strategy: String,
    primed: Option<Frame>,
}

impl Connection {
    /// Name of the strategy that produced this connection.
    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// Read the next frame. The first call hands back the test frame read
    /// during acquisition.
    pub fn read(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.primed.take() {
            return Ok(frame);
        }
        let frame = self.source.read()?;
        if frame.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }
        Ok(frame)
    }
}

/// Outcome of probing a single strategy.
#[derive(Debug)]
pub struct StrategyProbe {
    pub strategy: String,
    pub outcome: Result<(u32, u32), String>,
}

/// Opens the upstream source using an ordered list of strategies. It never
/// retries on its own; callers own the retry cadence.
pub struct StreamAcquirer {
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
}

impl StreamAcquirer {
    pub fn new(strategies: Vec<Box<dyn AcquisitionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Return a connection from the first strategy that opens `uri` and
    /// reads a non-empty test frame.
    pub fn open(&self, uri: &str) -> Result<Connection, CaptureError> {
        for strategy in &self.strategies {
            let span = tracing::info_span!("acquire.attempt", strategy = strategy.name());
            let _guard = span.enter();
            match validate(strategy.as_ref(), uri) {
                Ok((source, frame)) => {
                    info!(
                        "Test frame read successful ({}x{}) using {}",
                        frame.width,
                        frame.height,
                        strategy.name()
                    );
                    return Ok(Connection {
                        source,
                        strategy: strategy.name().to_string(),
                        primed: Some(frame),
                    });
                }
                Err(err) => warn!("{} rejected: {err}", strategy.name()),
            }
        }

        Err(CaptureError::Exhausted {
            uri: uri.to_string(),
        })
    }

    /// Try every strategy independently and report how each one fared.
    pub fn probe(&self, uri: &str) -> Vec<StrategyProbe> {
        self.strategies
            .iter()
            .map(|strategy| StrategyProbe {
                strategy: strategy.name().to_string(),
                outcome: validate(strategy.as_ref(), uri)
                    .map(|(_, frame)| (frame.width, frame.height))
                    .map_err(|err| err.to_string()),
            })
            .collect()
    }
}

fn validate(
    strategy: &dyn AcquisitionStrategy,
    uri: &str,
) -> Result<(Box<dyn VideoSource>, Frame), CaptureError> {
    let mut source = strategy.open(uri)?;
    let frame = source.read_first()?;
    if frame.is_empty() {
        return Err(CaptureError::EmptyFrame);
    }
    Ok((source, frame))
}
