//! Serial-line link (8N1, no flow control).
//!
//! Only functional with the `instrument_serial` feature; without it
//! [`SerialLink::open`] fails with [`EegError::SerialFeatureDisabled`].

use super::Link;
use crate::error::{AppResult, EegError};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use std::io::{ErrorKind, Read, Write};
#[cfg(feature = "instrument_serial")]
use std::time::Instant;
#[cfg(feature = "instrument_serial")]
use tracing::{debug, trace};

/// Default time `recv_exact` waits for a full buffer.
pub const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// An open serial port.
pub struct SerialLink {
    #[cfg(feature = "instrument_serial")]
    port: Box<dyn serialport::SerialPort>,
    port_name: String,
    timeout: Duration,
}

impl SerialLink {
    /// Open `port_name` at `baud_rate`.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> AppResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            // Internal read timeout; the overall deadline is `timeout`
            .timeout(Duration::from_millis(100))
            .open()?;

        debug!(port = port_name, baud_rate, "Serial port opened");

        Ok(Self {
            port,
            port_name: port_name.to_string(),
            timeout,
        })
    }

    /// Open `port_name` at `baud_rate`.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> AppResult<Self> {
        let _ = (port_name, baud_rate, timeout);
        Err(EegError::SerialFeatureDisabled)
    }
}

#[cfg(feature = "instrument_serial")]
impl Link for SerialLink {
    fn send_all(&mut self, buf: &[u8]) -> AppResult<()> {
        trace!(port = %self.port_name, len = buf.len(), "send");
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        let start = Instant::now();
        let mut filled = 0;

        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {}
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }

            if filled < buf.len() && start.elapsed() > self.timeout {
                return Err(EegError::Io(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!(
                        "{}: serial read timeout after {:?} ({filled} of {} bytes)",
                        self.port_name,
                        self.timeout,
                        buf.len()
                    ),
                )));
            }
        }

        Ok(())
    }

    fn flush_pending(&mut self) -> AppResult<usize> {
        let pending = self.port.bytes_to_read()? as usize;
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(pending)
    }

    fn describe(&self) -> String {
        format!("serial://{}", self.port_name)
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Link for SerialLink {
    fn send_all(&mut self, _buf: &[u8]) -> AppResult<()> {
        Err(EegError::SerialFeatureDisabled)
    }

    fn recv_exact(&mut self, _buf: &mut [u8]) -> AppResult<()> {
        Err(EegError::SerialFeatureDisabled)
    }

    fn flush_pending(&mut self) -> AppResult<usize> {
        Err(EegError::SerialFeatureDisabled)
    }

    fn describe(&self) -> String {
        format!("serial://{}", self.port_name)
    }
}
