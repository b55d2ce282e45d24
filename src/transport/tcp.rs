//! TCP links for network amplifiers.

use super::{Connector, DynLink, Link};
use crate::error::{AppResult, EegError};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, trace};

/// Default per-read timeout on data sockets.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of consecutive timed-out reads tolerated by `recv_exact`.
pub const DEFAULT_RECV_ATTEMPTS: u32 = 5;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected TCP stream.
pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
    recv_attempts: u32,
}

impl TcpLink {
    /// Connect to `addr`, applying the given timeouts.
    pub fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        read_timeout: Duration,
        recv_attempts: u32,
    ) -> AppResult<Self> {
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(read_timeout))?;
        debug!(peer = %addr, "TCP link connected");

        Ok(Self {
            stream,
            peer: addr,
            recv_attempts: recv_attempts.max(1),
        })
    }
}

impl Link for TcpLink {
    fn send_all(&mut self, buf: &[u8]) -> AppResult<()> {
        trace!(peer = %self.peer, len = buf.len(), "send");
        self.stream.write_all(buf)?;
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        let mut filled = 0;
        let mut idle_reads = 0;

        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(EegError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("{} closed after {filled} of {} bytes", self.peer, buf.len()),
                    )))
                }
                Ok(n) => {
                    filled += n;
                    idle_reads = 0;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    idle_reads += 1;
                    if idle_reads >= self.recv_attempts {
                        return Err(EegError::Io(std::io::Error::new(
                            ErrorKind::TimedOut,
                            format!(
                                "{}: no data after {} attempts ({filled} of {} bytes)",
                                self.peer,
                                self.recv_attempts,
                                buf.len()
                            ),
                        )));
                    }
                    trace!(peer = %self.peer, attempt = idle_reads, "receive retry");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn flush_pending(&mut self) -> AppResult<usize> {
        let mut discard = [0u8; 4096];
        let mut total = 0;

        self.stream.set_nonblocking(true)?;
        let result = loop {
            match self.stream.read(&mut discard) {
                Ok(0) => break Ok(total),
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(total),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;

        Ok(result?)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

/// Opens [`TcpLink`]s to one device address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: IpAddr,
    connect_timeout: Duration,
    read_timeout: Duration,
    recv_attempts: u32,
}

impl TcpConnector {
    /// Create a connector for the device at `address` (an IP literal).
    pub fn new(address: &str) -> AppResult<Self> {
        let address = address.parse::<IpAddr>().map_err(|e| {
            EegError::invalid_option("address", address, e)
        })?;

        Ok(Self {
            address,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            recv_attempts: DEFAULT_RECV_ATTEMPTS,
        })
    }

    /// Set the per-read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set how many consecutive timed-out reads `recv_exact` tolerates.
    pub fn with_recv_attempts(mut self, attempts: u32) -> Self {
        self.recv_attempts = attempts;
        self
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, port: u16) -> AppResult<DynLink> {
        let link = TcpLink::connect(
            SocketAddr::new(self.address, port),
            self.connect_timeout,
            self.read_timeout,
            self.recv_attempts,
        )?;
        Ok(Box::new(link))
    }
}
