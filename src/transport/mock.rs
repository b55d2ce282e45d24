//! Scripted links for testing sessions without hardware.
//!
//! A [`MockLink`] is a cheaply clonable handle onto shared state: the test keeps one
//! clone to script inbound bytes and inspect what was written, while the session owns
//! another (usually obtained through [`MockLink::endpoint`] or a [`MockConnector`]).
//!
//! Inbound bytes are queued as segments. Segments added with
//! [`MockLink::push_pending`] model bytes the device has already put on the wire
//! and that a subsequent `flush_pending` discards; segments added with
//! [`MockLink::push`] are only consumed by `recv_exact`.
//!
//! # Example
//!
//! ```
//! use med_eeg::transport::{Link, MockLink};
//!
//! let link = MockLink::new();
//! link.push(b"v3.1.2$$$");
//!
//! let mut session_side = link.clone();
//! session_side.send_all(b"v").unwrap();
//! let mut reply = [0u8; 9];
//! session_side.recv_exact(&mut reply).unwrap();
//!
//! assert_eq!(link.written(), b"v");
//! assert_eq!(&reply, b"v3.1.2$$$");
//! ```

use super::{Connector, DynLink, Link};
use crate::error::{AppResult, EegError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::Arc;

#[derive(Debug)]
struct Segment {
    bytes: VecDeque<u8>,
    pending: bool,
}

#[derive(Debug, Default)]
struct MockState {
    inbound: VecDeque<Segment>,
    written: Vec<u8>,
    flushed: usize,
    fail_next: bool,
    closed: bool,
}

/// Scripted in-memory link.
#[derive(Debug, Clone)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    label: Arc<str>,
}

impl MockLink {
    /// Create an empty link.
    pub fn new() -> Self {
        Self::named("mock")
    }

    /// Create an empty link with a name used by `describe`.
    pub fn named(label: &str) -> Self {
        Self {
            state: Arc::default(),
            label: Arc::from(label),
        }
    }

    /// Queue bytes for `recv_exact`.
    pub fn push(&self, bytes: &[u8]) {
        self.push_segment(bytes, false);
    }

    /// Queue bytes that are already in flight and dropped by `flush_pending`.
    pub fn push_pending(&self, bytes: &[u8]) {
        self.push_segment(bytes, true);
    }

    fn push_segment(&self, bytes: &[u8], pending: bool) {
        if bytes.is_empty() {
            return;
        }
        self.state.lock().inbound.push_back(Segment {
            bytes: bytes.iter().copied().collect(),
            pending,
        });
    }

    /// Fail the next `send_all` or `recv_exact` with a broken-pipe error.
    pub fn trigger_failure(&self) {
        self.state.lock().fail_next = true;
    }

    /// Everything the session wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Forget recorded outbound bytes.
    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    /// Number of scripted bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.state
            .lock()
            .inbound
            .iter()
            .map(|s| s.bytes.len())
            .sum()
    }

    /// Total bytes discarded by `flush_pending`.
    pub fn flushed(&self) -> usize {
        self.state.lock().flushed
    }

    /// True once an endpoint returned by [`MockLink::endpoint`] has been dropped.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Box a session-side endpoint that marks the link closed when dropped.
    pub fn endpoint(&self) -> DynLink {
        Box::new(MockEndpoint(self.clone()))
    }

    fn take_failure(state: &mut MockState, op: &str) -> AppResult<()> {
        if std::mem::take(&mut state.fail_next) {
            return Err(EegError::Io(std::io::Error::new(
                ErrorKind::BrokenPipe,
                format!("mock {op} failure"),
            )));
        }
        Ok(())
    }
}

impl Link for MockLink {
    fn send_all(&mut self, buf: &[u8]) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, "send")?;
        state.written.extend_from_slice(buf);
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::take_failure(&mut state, "recv")?;

        let available: usize = state.inbound.iter().map(|s| s.bytes.len()).sum();
        if available < buf.len() {
            return Err(EegError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "{}: script exhausted, {available} of {} bytes left",
                    self.label,
                    buf.len()
                ),
            )));
        }

        let mut filled = 0;
        while filled < buf.len() {
            let Some(front) = state.inbound.front_mut() else {
                break;
            };
            while filled < buf.len() {
                match front.bytes.pop_front() {
                    Some(byte) => {
                        buf[filled] = byte;
                        filled += 1;
                    }
                    None => break,
                }
            }
            if front.bytes.is_empty() {
                state.inbound.pop_front();
            }
        }

        Ok(())
    }

    fn flush_pending(&mut self) -> AppResult<usize> {
        let mut state = self.state.lock();

        let mut dropped = 0;
        while state.inbound.front().is_some_and(|s| s.pending) {
            if let Some(segment) = state.inbound.pop_front() {
                dropped += segment.bytes.len();
            }
        }
        state.flushed += dropped;
        Ok(dropped)
    }

    fn describe(&self) -> String {
        format!("mock://{}", self.label)
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

struct MockEndpoint(MockLink);

impl Link for MockEndpoint {
    fn send_all(&mut self, buf: &[u8]) -> AppResult<()> {
        self.0.send_all(buf)
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        self.0.recv_exact(buf)
    }

    fn flush_pending(&mut self) -> AppResult<usize> {
        self.0.flush_pending()
    }

    fn describe(&self) -> String {
        self.0.describe()
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.0.state.lock().closed = true;
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    links: HashMap<u16, VecDeque<MockLink>>,
    connects: Vec<u16>,
}

/// Hands out scripted links per port, in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    /// Create a connector with no scripted links.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next connection to `port`.
    pub fn add(&self, port: u16, link: &MockLink) {
        self.state
            .lock()
            .links
            .entry(port)
            .or_default()
            .push_back(link.clone());
    }

    /// Ports connected to so far, in order.
    pub fn connects(&self) -> Vec<u16> {
        self.state.lock().connects.clone()
    }
}

impl Connector for MockConnector {
    fn connect(&mut self, port: u16) -> AppResult<DynLink> {
        let mut state = self.state.lock();
        state.connects.push(port);
        match state.links.get_mut(&port).and_then(VecDeque::pop_front) {
            Some(link) => Ok(link.endpoint()),
            None => Err(EegError::Io(std::io::Error::new(
                ErrorKind::ConnectionRefused,
                format!("no scripted link for port {port}"),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_spans_segments() {
        let link = MockLink::new();
        link.push(&[1, 2]);
        link.push(&[3, 4, 5]);

        let mut side = link.clone();
        let mut buf = [0u8; 4];
        side.recv_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(link.remaining(), 1);
    }

    #[test]
    fn short_script_fails_without_consuming() {
        let link = MockLink::new();
        link.push(&[1, 2]);

        let mut side = link.clone();
        let mut buf = [0u8; 3];
        assert!(matches!(side.recv_exact(&mut buf), Err(EegError::Io(_))));
        assert_eq!(link.remaining(), 2);
    }

    #[test]
    fn flush_drops_only_leading_pending_segments() {
        let link = MockLink::new();
        link.push_pending(&[0xEE; 10]);
        link.push(&[7]);

        let mut side = link.clone();
        assert_eq!(side.flush_pending().unwrap(), 10);
        assert_eq!(side.flush_pending().unwrap(), 0);

        let mut buf = [0u8; 1];
        side.recv_exact(&mut buf).unwrap();
        assert_eq!(buf, [7]);
        assert_eq!(link.flushed(), 10);
    }

    #[test]
    fn failure_is_one_shot() {
        let link = MockLink::new();
        let mut side = link.clone();

        link.trigger_failure();
        assert!(side.send_all(b"x").is_err());
        assert!(side.send_all(b"y").is_ok());
        assert_eq!(link.written(), b"y");
    }

    #[test]
    fn endpoint_marks_closed_on_drop() {
        let link = MockLink::new();
        let endpoint = link.endpoint();
        assert!(!link.is_closed());
        drop(endpoint);
        assert!(link.is_closed());
    }

    #[test]
    fn connector_hands_out_links_in_order() {
        let first = MockLink::named("first");
        let second = MockLink::named("second");
        let mut connector = MockConnector::new();
        connector.add(7023, &first);
        connector.add(7023, &second);

        let a = connector.connect(7023).unwrap();
        let b = connector.connect(7023).unwrap();
        assert_eq!(a.describe(), "mock://first");
        assert_eq!(b.describe(), "mock://second");
        assert!(connector.connect(7023).is_err());
        assert_eq!(connector.connects(), vec![7023, 7023, 7023]);
    }
}
