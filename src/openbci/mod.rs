//! OpenBCI Cyton (and Cyton + Daisy) driver over the native serial protocol.
//!
//! ## Configuration
//!
//! | Key | Default | Meaning |
//! |---|---|---|
//! | `port` | required | serial device path |
//! | `baud_rate` | 115200 | line speed |
//! | `channels` | probed | force 8 or 16 channels |
//! | `gain` | 24 | amplifier gain, clamped to 1, 2, 4, 6, 8, 12, 24 |
//! | `impedance_samples` | 250 | readings per impedance estimate |
//!
//! With 16 channels the board and the daisy module take turns: odd packets carry
//! channels 1-8, even packets channels 9-16. Every emitted sample combines the
//! fresh half with the most recent reading of the other half.

pub mod impedance;
pub mod packet;

use crate::config::ConfigSet;
use crate::device::{Driver, Mode};
use crate::error::{AppResult, EegError};
use crate::logging;
use crate::queue::{Sample, SampleQueue};
use crate::transport::serial::DEFAULT_SERIAL_TIMEOUT;
use crate::transport::{DynLink, SerialLink};
use impedance::ImpedanceEstimator;
use packet::{cmd, FirmwareVersion, CHANNELS_PER_BOARD};
use tracing::{debug, error, info, warn, Span};

/// Default line speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
/// Default readings per impedance estimate.
pub const DEFAULT_IMPEDANCE_SAMPLES: usize = 250;

const RESET_RESPONSE_CAPACITY: usize = 400;
const TEXT_RESPONSE_CAPACITY: usize = 64;

/// Programmable gain of the ADS1299 front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Gain {
    /// 1x gain
    X1,
    /// 2x gain
    X2,
    /// 4x gain
    X4,
    /// 6x gain
    X6,
    /// 8x gain
    X8,
    /// 12x gain
    X12,
    /// 24x gain (default for EEG)
    #[default]
    X24,
}

impl Gain {
    const ALL: [Gain; 7] = [
        Gain::X1,
        Gain::X2,
        Gain::X4,
        Gain::X6,
        Gain::X8,
        Gain::X12,
        Gain::X24,
    ];

    /// Get the gain multiplier
    pub const fn multiplier(self) -> u8 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X6 => 6,
            Self::X8 => 8,
            Self::X12 => 12,
            Self::X24 => 24,
        }
    }

    /// Character used for this gain in the channel-settings command.
    pub const fn code(self) -> u8 {
        b'0' + self as u8
    }

    /// Largest supported gain not above `requested`, and at least 1x.
    pub fn clamp(requested: u32) -> Self {
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|g| u32::from(g.multiplier()) <= requested)
            .unwrap_or(Gain::X1)
    }
}

/// Typed configuration of the OpenBCI driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBciConfig {
    /// Serial device path.
    pub port: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Forced channel count, probed when `None`.
    pub channels: Option<usize>,
    /// Amplifier gain.
    pub gain: Gain,
    /// Readings per impedance estimate.
    pub impedance_samples: usize,
}

impl OpenBciConfig {
    /// Create a configuration with defaults for everything but the port.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            channels: None,
            gain: Gain::default(),
            impedance_samples: DEFAULT_IMPEDANCE_SAMPLES,
        }
    }

    /// Derive the configuration from the option set.
    pub fn from_config(config: &ConfigSet) -> AppResult<Self> {
        let port = config.require("port")?.trim().to_string();
        crate::config::is_valid_path(&port)
            .map_err(|reason| EegError::invalid_option("port", &port, reason))?;

        let channels = config.parse::<usize>("channels")?;
        if let Some(n) = channels {
            if n != 8 && n != 16 {
                return Err(EegError::invalid_option(
                    "channels",
                    &n.to_string(),
                    "must be 8 or 16",
                ));
            }
        }

        let impedance_samples =
            config.parse_or("impedance_samples", DEFAULT_IMPEDANCE_SAMPLES)?;
        if impedance_samples == 0 {
            return Err(EegError::invalid_option(
                "impedance_samples",
                "0",
                "must be positive",
            ));
        }

        Ok(Self {
            port,
            baud_rate: config.parse_or("baud_rate", DEFAULT_BAUD_RATE)?,
            channels,
            gain: config
                .parse::<u32>("gain")?
                .map(Gain::clamp)
                .unwrap_or_default(),
            impedance_samples,
        })
    }
}

fn response_text(response: Option<Vec<u8>>) -> String {
    String::from_utf8_lossy(&response.unwrap_or_default()).into_owned()
}

/// A connected OpenBCI board.
pub struct OpenBciSession {
    config: OpenBciConfig,
    link: DynLink,
    version: FirmwareVersion,
    channels: usize,
    labels: Vec<String>,
    scratch: [f32; CHANNELS_PER_BOARD],
    streaming: bool,
    mode: Mode,
    next_seq: u32,
    torn_down: bool,
    span: Span,
}

impl OpenBciSession {
    /// Open the serial port named in `config` and negotiate with the board.
    pub fn open(config: OpenBciConfig) -> AppResult<Self> {
        let link = SerialLink::open(&config.port, config.baud_rate, DEFAULT_SERIAL_TIMEOUT)?;
        Self::with_link(config, Box::new(link))
    }

    /// Negotiate with a board reachable through `link`.
    pub fn with_link(config: OpenBciConfig, mut link: DynLink) -> AppResult<Self> {
        let span = logging::device_span("openbci", &config.port);
        let _guard = span.enter();
        debug!(link = %link.describe(), "Negotiating");

        let flushed = link.flush_pending()?;
        let banner = packet::text_command(
            link.as_mut(),
            &[cmd::SOFT_RESET],
            Some(RESET_RESPONSE_CAPACITY),
        )?;
        debug!(flushed, banner = %response_text(banner), "Board reset");

        let reply = packet::text_command(
            link.as_mut(),
            &[cmd::GET_VERSION],
            Some(TEXT_RESPONSE_CAPACITY),
        )?;
        let version = match FirmwareVersion::parse(&reply.unwrap_or_default()) {
            Ok(version) => version,
            Err(e) => {
                error!(error = %e, "Failed to read firmware version, is the device firmware up to date?");
                return Err(e);
            }
        };
        info!(%version, "OpenBCI firmware version");

        let channels = match config.channels {
            Some(8) => {
                packet::text_command(
                    link.as_mut(),
                    &[cmd::CHANNELS_8],
                    Some(TEXT_RESPONSE_CAPACITY),
                )?;
                8
            }
            Some(16) => {
                if Self::probe_daisy(link.as_mut())? != 16 {
                    return Err(EegError::InvalidResponse(
                        "board refused 16 channels".to_string(),
                    ));
                }
                16
            }
            Some(other) => {
                return Err(EegError::invalid_option(
                    "channels",
                    &other.to_string(),
                    "must be 8 or 16",
                ))
            }
            None => Self::probe_daisy(link.as_mut())?,
        };
        debug!(channels, gain = config.gain.multiplier(), "Negotiated");

        Ok(Self {
            config,
            link,
            version,
            channels,
            labels: (0..channels).map(|i| format!("eeg{i}")).collect(),
            scratch: [0.0; CHANNELS_PER_BOARD],
            streaming: false,
            mode: Mode::Idle,
            next_seq: 0,
            torn_down: false,
            span: span.clone(),
        })
    }

    fn probe_daisy(link: &mut dyn crate::transport::Link) -> AppResult<usize> {
        let reply = response_text(packet::text_command(
            link,
            &[cmd::CHANNELS_16],
            Some(TEXT_RESPONSE_CAPACITY),
        )?);
        debug!(reply = %reply, "Channel probe");
        Ok(if reply.contains("16$$$") { 16 } else { 8 })
    }

    fn command(&mut self, command: &[u8]) -> AppResult<String> {
        let reply = packet::text_command(self.link.as_mut(), command, Some(TEXT_RESPONSE_CAPACITY))?;
        Ok(response_text(reply))
    }

    fn set_streaming(&mut self, streaming: bool) -> AppResult<()> {
        self.streaming = streaming;
        if streaming {
            packet::text_command(self.link.as_mut(), &[cmd::STREAM_START], None)?;
        } else {
            packet::text_command(self.link.as_mut(), &[cmd::STREAM_STOP], None)?;
            let flushed = self.link.flush_pending()?;
            debug!(flushed, "Flushed serial input");
        }
        Ok(())
    }

    fn configure(&mut self, mode: Mode) -> AppResult<()> {
        let missing = |ch: usize| EegError::Configuration(format!("no command for channel {ch}"));

        match mode {
            Mode::Idle => return Ok(()),
            Mode::Sampling => {
                self.command(&[cmd::CHANNEL_DEFAULTS])?;
                for ch in 0..self.channels {
                    let settings = packet::channel_settings(ch, self.config.gain.code())
                        .ok_or_else(|| missing(ch))?;
                    self.command(&settings)?;
                }
                // Channel 0 doubles as a disconnect detector
                self.command(&packet::lead_off(0, false, true).ok_or_else(|| missing(0))?)?;
            }
            Mode::Impedance => {
                self.command(&packet::lead_off(0, true, true).ok_or_else(|| missing(0))?)?;
            }
            Mode::Test => {
                self.command(&[cmd::TEST_PULSE_SLOW])?;
            }
        }
        self.set_streaming(true)
    }

    fn switch_mode(&mut self, mode: Mode, queue: &mut SampleQueue) -> AppResult<()> {
        self.set_streaming(false)?;
        self.mode = Mode::Idle;
        self.scratch = [0.0; CHANNELS_PER_BOARD];
        let dropped = queue.clear();
        debug!(?mode, dropped, "Setting mode");

        self.configure(mode)?;
        self.mode = mode;
        Ok(())
    }

    /// Read one frame and expand it to a full-width sample.
    fn read_sample(&mut self) -> AppResult<Sample> {
        let (frame, _skipped) = packet::read_frame(self.link.as_mut())?;
        let fresh = frame.microvolts(self.config.gain.multiplier());

        let values = if self.channels == CHANNELS_PER_BOARD {
            fresh.to_vec()
        } else if frame.seq & 1 == 1 {
            // board
            fresh.iter().chain(&self.scratch).copied().collect()
        } else {
            // daisy
            self.scratch.iter().chain(&fresh).copied().collect()
        };
        self.scratch = fresh;

        let sample = Sample::new(self.next_seq, values);
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(sample)
    }

    /// Configuration the session was opened with.
    pub fn config(&self) -> &OpenBciConfig {
        &self.config
    }

    /// Firmware version reported at connect time.
    pub fn firmware_version(&self) -> FirmwareVersion {
        self.version
    }

    /// Negotiated channel count.
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Mode last entered.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// True while the board is streaming binary frames.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }
}

impl Driver for OpenBciSession {
    fn driver_name(&self) -> &'static str {
        "openbci"
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn acquire(&mut self, queue: &mut SampleQueue) -> AppResult<usize> {
        let span = self.span.clone();
        let _guard = span.enter();

        let sample = self.read_sample()?;
        queue.enqueue(sample);
        Ok(1)
    }

    fn set_mode(&mut self, mode: Mode, queue: &mut SampleQueue) -> AppResult<()> {
        let span = self.span.clone();
        let _guard = span.enter();
        self.switch_mode(mode, queue)
    }

    fn impedance(&mut self, queue: &mut SampleQueue) -> AppResult<Vec<Option<f32>>> {
        let span = self.span.clone();
        let _guard = span.enter();

        let previous = self.mode;
        if previous != Mode::Impedance {
            self.switch_mode(Mode::Impedance, queue)?;
        }

        let mut estimator = ImpedanceEstimator::new(self.channels);
        for _ in 0..self.config.impedance_samples {
            let sample = self.read_sample()?;
            let volts: Vec<f32> = sample.values.iter().map(|uv| uv * 1e-6).collect();
            estimator.push(&volts);
        }
        debug!(readings = estimator.len(), "Impedance window collected");

        if previous != Mode::Impedance {
            self.switch_mode(previous, queue)?;
        }

        Ok(estimator.ohms().into_iter().map(Some).collect())
    }

    fn shutdown(&mut self) -> usize {
        if self.torn_down {
            return 0;
        }
        self.torn_down = true;

        let span = self.span.clone();
        let _guard = span.enter();
        let mut failures = 0;

        if let Err(e) = self.set_streaming(false) {
            warn!(error = %e, "Failed to stop streaming");
            failures += 1;
        }
        self.mode = Mode::Idle;

        if let Err(e) = packet::text_command(
            self.link.as_mut(),
            &[cmd::SOFT_RESET],
            Some(RESET_RESPONSE_CAPACITY),
        ) {
            warn!(error = %e, "Failed to reset board");
            failures += 1;
        }

        debug!(failures, "Torn down");
        failures
    }
}
