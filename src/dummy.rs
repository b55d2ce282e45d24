//! Synthetic sine source for exercising the device interface without hardware.

use crate::config::ConfigSet;
use crate::device::{Driver, Mode};
use crate::error::{AppResult, EegError};
use crate::logging;
use crate::queue::{Sample, SampleQueue};
use tracing::{debug, Span};

/// Default channel count.
pub const DEFAULT_CHANNELS: usize = 4;

const PHASE_START: f32 = 1.0;
const PHASE_STEP: f32 = 0.1;

/// Typed configuration of the dummy driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyConfig {
    /// Number of channels to produce.
    pub channels: usize,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl DummyConfig {
    /// Derive the configuration from the option set.
    pub fn from_config(config: &ConfigSet) -> AppResult<Self> {
        let channels = config.parse_or("channels", DEFAULT_CHANNELS)?;
        if channels == 0 {
            return Err(EegError::invalid_option("channels", "0", "must be positive"));
        }
        Ok(Self { channels })
    }
}

/// Produces `1 + sin(phase)` on every channel, the phase advancing per value.
pub struct DummyDriver {
    labels: Vec<String>,
    phase: f32,
    mode: Mode,
    next_seq: u32,
    span: Span,
}

impl DummyDriver {
    /// Create a driver with `config.channels` channels labelled `sin0..`.
    pub fn new(config: DummyConfig) -> Self {
        Self {
            labels: (0..config.channels).map(|i| format!("sin{i}")).collect(),
            phase: PHASE_START,
            mode: Mode::Idle,
            next_seq: 0,
            span: logging::device_span("dummy", "-"),
        }
    }

    /// Mode last set.
    pub fn mode(&self) -> Mode {
        self.mode
    }
}

impl Driver for DummyDriver {
    fn driver_name(&self) -> &'static str {
        "dummy"
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn acquire(&mut self, queue: &mut SampleQueue) -> AppResult<usize> {
        let values = (0..self.labels.len())
            .map(|_| {
                self.phase += PHASE_STEP;
                1.0 + self.phase.sin()
            })
            .collect();
        queue.enqueue(Sample::new(self.next_seq, values));
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(1)
    }

    fn set_mode(&mut self, mode: Mode, queue: &mut SampleQueue) -> AppResult<()> {
        let _guard = self.span.enter();
        let dropped = queue.clear();
        debug!(?mode, dropped, "Mode was set");
        self.mode = mode;
        Ok(())
    }

    fn impedance(&mut self, _queue: &mut SampleQueue) -> AppResult<Vec<Option<f32>>> {
        Ok((0..self.labels.len()).map(|i| Some(i as f32)).collect())
    }

    fn shutdown(&mut self) -> usize {
        0
    }
}
