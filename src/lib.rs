//! # med-eeg
//!
//! Uniform acquisition layer for EEG amplifiers. Every supported amplifier is
//! exposed through the same [`Device`](device::Device) interface: create it from a
//! type tag and an ordered `key=value` option set, switch its mode, and pull
//! fixed-size blocks of samples or a one-shot impedance reading.
//!
//! ## Crate Structure
//!
//! - **`device`**: the `Device` facade, the `Driver` trait and the backend factory.
//! - **`queue`**: FIFO of decoded samples between driver and caller.
//! - **`ebneuro`**: EBNeuro BE Plus LTM driver over three TCP sockets.
//! - **`openbci`**: OpenBCI Cyton (and Daisy) driver over a serial line, including
//!   the lead-off impedance estimator.
//! - **`dummy`**: synthetic sine source for testing without hardware.
//! - **`transport`**: blocking byte links (TCP, serial, scripted mocks).
//! - **`config`**: the ordered option set and its TOML loader.
//! - **`error`**: the crate-wide `EegError`.
//! - **`logging`**: tracing subscriber setup and per-device spans.

#![warn(missing_docs)]

pub mod config;
pub mod device;
pub mod dummy;
pub mod ebneuro;
pub mod error;
pub mod logging;
pub mod openbci;
pub mod queue;
pub mod transport;

pub use config::ConfigSet;
pub use device::{Device, DeviceType, Driver, Mode};
pub use error::{AppResult, EegError};
pub use queue::{Sample, SampleQueue};
