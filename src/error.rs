//! Custom error types for the library.
//!
//! This module defines the primary error type, `EegError`, shared by every driver and
//! by the [`Device`](crate::device::Device) facade. Using the `thiserror` crate, it gives
//! a single, consistent way to report what went wrong, from configuration mistakes to
//! broken wire framing.
//!
//! ## Error Hierarchy
//!
//! - **Configuration errors** (`Configuration`, `UnknownDeviceType`, `SerialFeatureDisabled`)
//!   are raised while a device is being constructed and are never retried.
//! - **Transport errors** (`Io`, `Serial`) wrap failures of the underlying socket or serial
//!   line. They are fatal to the current call and leave the session in an indeterminate
//!   state.
//! - **Protocol errors** (`Framing`, `InvalidResponse`, `DeviceError`) are raised when the
//!   device answers with something the codec cannot accept. `DeviceError` carries the
//!   device-reported code.
//! - **Caller errors** (`InsufficientSamples`, `BufferTooSmall`) signal misuse of the
//!   sample queue or an undersized output buffer.
//!
//! By using `#[from]`, `EegError` is created directly from `std::io::Error` and
//! `serialport::Error`, so transport calls propagate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, EegError>;

/// Primary error type for device acquisition.
#[derive(Error, Debug)]
pub enum EegError {
    /// A configuration option is missing or has an unusable value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The factory was asked for a driver it does not know.
    #[error("Unknown device type '{0}'")]
    UnknownDeviceType(String),

    /// Socket or stream I/O failed (connection refused, short read or write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial line could not be opened or configured.
    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The crate was built without serial support.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// A packet failed its magic/stop byte check and could not be recovered.
    #[error("Framing error: {0}")]
    Framing(String),

    /// A text response did not have the expected shape.
    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    /// The device acknowledged a request with a non-zero error code.
    #[error("Device rejected packet {packet_id} with error code {code}")]
    DeviceError {
        /// Identifier of the request packet.
        packet_id: u8,
        /// Code reported by the device.
        code: u16,
    },

    /// More samples were drained than the queue holds.
    #[error("Sample queue holds {available} samples, {requested} requested")]
    InsufficientSamples {
        /// Number of samples asked for.
        requested: usize,
        /// Number of samples queued.
        available: usize,
    },

    /// The caller-provided buffer cannot hold the result.
    #[error("Output buffer too small: need {needed} values, got {provided}")]
    BufferTooSmall {
        /// Number of values that would be written.
        needed: usize,
        /// Length of the provided buffer.
        provided: usize,
    },

    /// A receive buffer could not be allocated.
    #[error("Out of memory allocating {0} bytes")]
    OutOfMemory(usize),
}

impl EegError {
    /// Build an [`EegError::Configuration`] for a key whose value failed to parse.
    pub fn invalid_option(key: &str, value: &str, reason: impl std::fmt::Display) -> Self {
        EegError::Configuration(format!("invalid value '{value}' for '{key}': {reason}"))
    }
}

/// Allocate a zeroed byte buffer without aborting on allocation failure.
pub(crate) fn try_alloc(len: usize) -> AppResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| EegError::OutOfMemory(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_with_context() {
        use std::io::ErrorKind;

        let err: EegError = std::io::Error::from(ErrorKind::ConnectionRefused).into();
        assert!(matches!(&err, EegError::Io(e) if e.kind() == ErrorKind::ConnectionRefused));
        assert!(err.to_string().starts_with("I/O error"));
    }

    #[test]
    fn device_error_reports_code() {
        let err = EegError::DeviceError {
            packet_id: 20,
            code: 3,
        };
        let text = err.to_string();
        assert!(text.contains("20"));
        assert!(text.contains('3'));
    }

    #[test]
    fn invalid_option_names_key_and_value() {
        let err = EegError::invalid_option("gain", "abc", "not a number");
        assert!(matches!(err, EegError::Configuration(ref msg) if msg.contains("gain") && msg.contains("abc")));
    }

    #[test]
    fn try_alloc_returns_zeroed_buffer() {
        let buf = try_alloc(16).unwrap();
        assert_eq!(buf, vec![0u8; 16]);
    }
}
