//! Blocking byte transports used by the protocol sessions.
//!
//! Every session talks to its device through a [`Link`]: a synchronous byte pipe
//! offering send-all, receive-exactly-N and flush-pending. Each call blocks the
//! calling thread until it completes or fails; there is no internal threading.
//!
//! - [`tcp`]: `TcpLink` / `TcpConnector` over `std::net::TcpStream` (Ebneuro).
//! - [`serial`]: `SerialLink` over the `serialport` crate (OpenBCI).
//! - [`mock`]: scripted links for exercising sessions without hardware.

pub mod mock;
pub mod serial;
pub mod tcp;

pub use mock::{MockConnector, MockLink};
pub use serial::SerialLink;
pub use tcp::{TcpConnector, TcpLink};

use crate::error::AppResult;

/// A connected, blocking byte stream.
pub trait Link: Send {
    /// Write the whole buffer.
    fn send_all(&mut self, buf: &[u8]) -> AppResult<()>;

    /// Fill the whole buffer, blocking until enough bytes arrived.
    fn recv_exact(&mut self, buf: &mut [u8]) -> AppResult<()>;

    /// Discard every byte that is already pending, returning how many were dropped.
    fn flush_pending(&mut self) -> AppResult<usize>;

    /// Short human-readable description used in logs.
    fn describe(&self) -> String {
        "link".to_string()
    }
}

/// Type-erased boxed link.
pub type DynLink = Box<dyn Link>;

/// Opens links to one device endpoint, addressed by port number.
pub trait Connector: Send {
    /// Open a new link to `port`.
    fn connect(&mut self, port: u16) -> AppResult<DynLink>;
}

/// Type-erased boxed connector.
pub type DynConnector = Box<dyn Connector>;

impl<L: Link + ?Sized> Link for Box<L> {
    fn send_all(&mut self, buf: &[u8]) -> AppResult<()> {
        (**self).send_all(buf)
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        (**self).recv_exact(buf)
    }

    fn flush_pending(&mut self) -> AppResult<usize> {
        (**self).flush_pending()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
