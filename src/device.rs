//! Uniform device interface.
//!
//! A [`Device`] wraps one concrete driver ([`Backend`]) together with its
//! [`SampleQueue`]. Drivers only implement a single-packet acquisition step; the
//! rate adaptation between the device's packet cadence and the caller's requested
//! sample count happens here.
//!
//! # Example
//!
//! ```
//! use med_eeg::config::ConfigSet;
//! use med_eeg::device::{Device, Mode};
//!
//! # fn main() -> Result<(), med_eeg::error::EegError> {
//! let mut device = Device::create("dummy", &ConfigSet::from_pairs([("channels", "2")]))?;
//! device.set_mode(Mode::Sampling)?;
//!
//! let mut buf = [0.0f32; 2 * 10];
//! assert_eq!(device.sample(&mut buf, 10)?, 10);
//! device.destroy();
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigSet, VERBOSITY_KEY};
use crate::dummy::{DummyConfig, DummyDriver};
use crate::ebneuro::{EbneuroConfig, EbneuroSession};
use crate::error::{AppResult, EegError};
use crate::logging::{self, TracingConfig};
use crate::openbci::{OpenBciConfig, OpenBciSession};
use crate::queue::SampleQueue;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Operating mode of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Not acquiring.
    #[default]
    Idle,
    /// Streaming signal samples.
    Sampling,
    /// Measuring electrode impedance.
    Impedance,
    /// Streaming an internal test signal.
    Test,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Idle => "idle",
            Mode::Sampling => "sampling",
            Mode::Impedance => "impedance",
            Mode::Test => "test",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = EegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Mode::Idle),
            "sampling" | "sample" => Ok(Mode::Sampling),
            "impedance" => Ok(Mode::Impedance),
            "test" => Ok(Mode::Test),
            _ => Err(EegError::invalid_option(
                "mode",
                s,
                "expected idle, sampling, impedance or test",
            )),
        }
    }
}

/// Type tag selecting a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Synthetic sine source.
    Dummy,
    /// EBNeuro BE Plus LTM over TCP.
    Ebneuro,
    /// OpenBCI Cyton over serial.
    #[serde(rename = "openbci")]
    OpenBci,
}

impl DeviceType {
    /// Tag used by [`Device::create`].
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Dummy => "dummy",
            DeviceType::Ebneuro => "ebneuro",
            DeviceType::OpenBci => "openbci",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = EegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dummy" => Ok(DeviceType::Dummy),
            "ebneuro" => Ok(DeviceType::Ebneuro),
            "openbci" => Ok(DeviceType::OpenBci),
            _ => Err(EegError::UnknownDeviceType(s.to_string())),
        }
    }
}

/// Operations every concrete driver provides.
#[enum_dispatch]
pub trait Driver {
    /// Short driver name used in logs.
    fn driver_name(&self) -> &'static str;

    /// Channel labels; their count is the channel count.
    fn labels(&self) -> &[String];

    /// Receive one unit of data from the device and enqueue the decoded samples.
    ///
    /// Returns the number of samples enqueued, possibly zero.
    fn acquire(&mut self, queue: &mut SampleQueue) -> AppResult<usize>;

    /// Enter `mode`. Drivers clear `queue` at the point where stale data can no
    /// longer arrive.
    fn set_mode(&mut self, mode: Mode, queue: &mut SampleQueue) -> AppResult<()>;

    /// One-shot impedance read, `None` for channels without support.
    ///
    /// Drivers that change the acquisition mode to measure clear `queue`.
    fn impedance(&mut self, queue: &mut SampleQueue) -> AppResult<Vec<Option<f32>>>;

    /// Best-effort teardown. Every step is attempted; returns how many failed.
    fn shutdown(&mut self) -> usize;
}

/// The closed set of drivers.
#[enum_dispatch(Driver)]
pub enum Backend {
    /// Synthetic sine source
    Dummy(DummyDriver),
    /// EBNeuro network amplifier
    Ebneuro(EbneuroSession),
    /// OpenBCI serial board
    OpenBci(OpenBciSession),
}

impl Backend {
    /// Construct the driver selected by `kind` from `config`.
    pub fn open(kind: DeviceType, config: &ConfigSet) -> AppResult<Self> {
        Ok(match kind {
            DeviceType::Dummy => DummyDriver::new(DummyConfig::from_config(config)?).into(),
            DeviceType::Ebneuro => EbneuroSession::open(EbneuroConfig::from_config(config)?)?.into(),
            DeviceType::OpenBci => {
                OpenBciSession::open(OpenBciConfig::from_config(config)?)?.into()
            }
        })
    }

    /// Type tag of the wrapped driver.
    pub fn device_type(&self) -> DeviceType {
        match self {
            Backend::Dummy(_) => DeviceType::Dummy,
            Backend::Ebneuro(_) => DeviceType::Ebneuro,
            Backend::OpenBci(_) => DeviceType::OpenBci,
        }
    }
}

/// A negotiated device with its sample queue.
pub struct Device {
    backend: Backend,
    queue: SampleQueue,
    channels: usize,
    destroyed: bool,
}

impl Device {
    /// Construct a device from a type tag and an ordered option set.
    ///
    /// A `verbosity` option initialises logging at the corresponding level.
    pub fn create(kind: &str, config: &ConfigSet) -> AppResult<Self> {
        let kind = kind.parse::<DeviceType>()?;

        if let Some(verbosity) = config.parse::<u8>(VERBOSITY_KEY)? {
            if let Err(e) = logging::init(TracingConfig::from_verbosity(verbosity)) {
                warn!(error = %e, "Logging initialisation failed");
            }
        }

        debug!(kind = %kind, options = config.len(), "Creating device");
        Self::from_backend(Backend::open(kind, config)?)
    }

    /// Wrap an already constructed driver.
    ///
    /// A driver reporting no channels is shut down and rejected.
    pub fn from_backend(backend: impl Into<Backend>) -> AppResult<Self> {
        let mut backend = backend.into();
        let channels = backend.labels().len();
        if channels == 0 {
            backend.shutdown();
            return Err(EegError::Configuration(format!(
                "{} driver reports no channels",
                backend.driver_name()
            )));
        }

        Ok(Self {
            backend,
            queue: SampleQueue::new(),
            channels,
            destroyed: false,
        })
    }

    /// Type tag of the underlying driver.
    pub fn device_type(&self) -> DeviceType {
        self.backend.device_type()
    }

    /// Channel count and labels.
    pub fn get_channels(&self) -> (usize, &[String]) {
        (self.channels, self.backend.labels())
    }

    /// Number of channels, fixed for the device's lifetime.
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Samples decoded but not yet handed out.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The underlying driver, for driver-specific accessors.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Switch mode. Queued samples are always discarded, even on failure.
    pub fn set_mode(&mut self, mode: Mode) -> AppResult<()> {
        let result = self.backend.set_mode(mode, &mut self.queue);
        self.queue.clear();
        result
    }

    /// Block until `count` samples are available and copy them into `out`.
    ///
    /// Samples are written back to back, `channel_count` values each. A `count`
    /// of zero still performs one acquisition step so the transport keeps draining.
    pub fn sample(&mut self, out: &mut [f32], count: usize) -> AppResult<usize> {
        let needed = count * self.channels;
        if out.len() < needed {
            return Err(EegError::BufferTooSmall {
                needed,
                provided: out.len(),
            });
        }

        if count == 0 {
            self.backend.acquire(&mut self.queue)?;
            return Ok(0);
        }

        while self.queue.len() < count {
            self.backend.acquire(&mut self.queue)?;
        }

        for (sample, slot) in self
            .queue
            .drain(count)?
            .into_iter()
            .zip(out.chunks_exact_mut(self.channels))
        {
            if sample.values.len() != self.channels {
                return Err(EegError::InvalidResponse(format!(
                    "sample {} has {} values, device has {} channels",
                    sample.seq,
                    sample.values.len(),
                    self.channels
                )));
            }
            slot.copy_from_slice(&sample.values);
        }

        Ok(count)
    }

    /// Read impedances into `out`, NaN for unsupported channels.
    pub fn get_impedance(&mut self, out: &mut [f32]) -> AppResult<usize> {
        if out.len() < self.channels {
            return Err(EegError::BufferTooSmall {
                needed: self.channels,
                provided: out.len(),
            });
        }

        let values = self.backend.impedance(&mut self.queue)?;
        for (slot, value) in out.iter_mut().zip(&values) {
            *slot = value.unwrap_or(f32::NAN);
        }
        Ok(values.len().min(self.channels))
    }

    /// Tear the device down, logging but not propagating failures.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let failures = self.backend.shutdown();
        let dropped = self.queue.clear();
        if failures > 0 {
            warn!(
                driver = self.backend.driver_name(),
                failures, "Teardown finished with failures"
            );
        }
        debug!(driver = self.backend.driver_name(), dropped, "Device destroyed");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.teardown();
    }
}
