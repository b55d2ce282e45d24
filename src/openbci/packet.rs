//! OpenBCI serial codec.
//!
//! The board speaks two dialects on the same line: single-character (or short
//! macro) text commands answered with `$$$`-terminated text, and a 33-byte
//! binary sample frame while streaming:
//!
//! ```text
//! [0xA0][seq][8 x i24 big-endian][6 aux bytes][0xCx]
//! ```

use crate::error::{AppResult, EegError};
use crate::transport::Link;
use bytes::{Buf, BufMut, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, trace};

/// Size of one binary sample frame.
pub const PACKET_SIZE: usize = 33;
/// First byte of every frame.
pub const START_BYTE: u8 = 0xA0;
/// High nibble of the last byte of every frame.
pub const STOP_NIBBLE: u8 = 0xC0;
/// ADC channels carried by one frame.
pub const CHANNELS_PER_BOARD: usize = 8;
/// Auxiliary bytes per frame.
pub const AUX_BYTES: usize = 6;
/// Maximum bytes skipped while realigning on the frame boundary.
pub const RESYNC_LIMIT: usize = 10 * PACKET_SIZE;
/// Terminator of text responses.
pub const TERMINATOR: &[u8] = b"$$$";

/// ADS1299 reference full-scale span (2 x 4.5 V).
pub const FULL_SCALE_VOLTS: f32 = 9.0;
/// Largest positive 24-bit code.
pub const MAX_CODE: f32 = 8_388_607.0;

/// Single-character commands.
pub mod cmd {
    /// Soft reset, answered with the board banner.
    pub const SOFT_RESET: u8 = b'v';
    /// Firmware version query.
    pub const GET_VERSION: u8 = b'V';
    /// Use only the 8 board channels.
    pub const CHANNELS_8: u8 = b'c';
    /// Use 16 channels if a daisy module is attached.
    pub const CHANNELS_16: u8 = b'C';
    /// Start binary streaming.
    pub const STREAM_START: u8 = b'b';
    /// Stop binary streaming.
    pub const STREAM_STOP: u8 = b's';
    /// Reset every channel to its default settings.
    pub const CHANNEL_DEFAULTS: u8 = b'd';
    /// Slow square-wave test signal on all channels.
    pub const TEST_PULSE_SLOW: u8 = b'-';
}

/// Command character addressing channel `index` (0-based, up to 16 channels).
pub fn channel_char(index: usize) -> Option<u8> {
    const CHARS: &[u8; 16] = b"12345678QWERTYUI";
    CHARS.get(index).copied()
}

/// `x` channel-settings macro: power on, normal input, bias and SRB2 connected.
pub fn channel_settings(index: usize, gain_code: u8) -> Option<Vec<u8>> {
    let ch = channel_char(index)?;
    Some(vec![b'x', ch, b'0', gain_code, b'0', b'1', b'1', b'0', b'X'])
}

/// `z` lead-off macro for channel `index` with the given P/N drive.
pub fn lead_off(index: usize, p: bool, n: bool) -> Option<Vec<u8>> {
    let ch = channel_char(index)?;
    Some(vec![b'z', ch, u8::from(p) + b'0', u8::from(n) + b'0', b'Z'])
}

/// Sign-extend a big-endian 24-bit two's-complement value.
pub fn i24_to_i32(bytes: [u8; 3]) -> i32 {
    let raw = (i32::from(bytes[0]) << 16) | (i32::from(bytes[1]) << 8) | i32::from(bytes[2]);
    if raw & 0x0080_0000 != 0 {
        raw | !0x00FF_FFFF
    } else {
        raw
    }
}

/// Volts per count at the given amplifier gain.
pub fn scale_volts(gain: u8) -> f32 {
    FULL_SCALE_VOLTS / MAX_CODE / f32::from(gain.max(1)) / 2.0
}

/// True if `window` starts and ends like a sample frame.
pub fn is_framed(window: &[u8]) -> bool {
    window.len() == PACKET_SIZE
        && window[0] == START_BYTE
        && window[PACKET_SIZE - 1] & 0xF0 == STOP_NIBBLE
}

/// A decoded sample frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Packet counter as sent by the board.
    pub seq: u8,
    /// Raw ADC codes.
    pub channels: [i32; CHANNELS_PER_BOARD],
    /// Accelerometer or other auxiliary bytes.
    pub aux: [u8; AUX_BYTES],
    /// Stop byte; its low nibble selects the aux format.
    pub stop: u8,
}

impl DataFrame {
    /// Decode a frame that already passed [`is_framed`].
    pub fn decode(window: &[u8]) -> AppResult<Self> {
        if !is_framed(window) {
            return Err(EegError::Framing(format!(
                "bad frame markers 0x{:02x}..0x{:02x}",
                window.first().copied().unwrap_or_default(),
                window.last().copied().unwrap_or_default()
            )));
        }

        let mut buf = &window[1..];
        let seq = buf.get_u8();
        let mut channels = [0i32; CHANNELS_PER_BOARD];
        for value in channels.iter_mut() {
            let mut raw = [0u8; 3];
            buf.copy_to_slice(&mut raw);
            *value = i24_to_i32(raw);
        }
        let mut aux = [0u8; AUX_BYTES];
        buf.copy_to_slice(&mut aux);
        let stop = buf.get_u8();

        Ok(Self {
            seq,
            channels,
            aux,
            stop,
        })
    }

    /// Encode the frame as sent by the board.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(PACKET_SIZE);
        out.put_u8(START_BYTE);
        out.put_u8(self.seq);
        for &value in &self.channels {
            out.put_slice(&value.to_be_bytes()[1..]);
        }
        out.put_slice(&self.aux);
        out.put_u8(self.stop);
        out.to_vec()
    }

    /// Channel values in microvolts at the given gain.
    pub fn microvolts(&self, gain: u8) -> [f32; CHANNELS_PER_BOARD] {
        let scale = scale_volts(gain) * 1e6;
        self.channels.map(|code| code as f32 * scale)
    }
}

/// Read one frame, realigning on the stream if the first window is misframed.
///
/// Returns the frame and the number of bytes skipped to find it.
pub fn read_frame(link: &mut dyn Link) -> AppResult<(DataFrame, usize)> {
    let mut window = [0u8; PACKET_SIZE];
    link.recv_exact(&mut window)?;

    if is_framed(&window) {
        return Ok((DataFrame::decode(&window)?, 0));
    }

    debug!(
        start = window[0],
        stop = window[PACKET_SIZE - 1] & 0xF0,
        "Got packet with incorrect magic"
    );

    let mut skipped = 0;
    while !is_framed(&window) {
        if skipped >= RESYNC_LIMIT {
            return Err(EegError::Framing(format!(
                "no frame boundary found after skipping {skipped} bytes"
            )));
        }
        window.copy_within(1.., 0);
        link.recv_exact(&mut window[PACKET_SIZE - 1..])?;
        skipped += 1;
    }

    info!(skipped, "Realigned after skipping bytes");
    Ok((DataFrame::decode(&window)?, skipped))
}

/// Write `command` and, if `capacity` is given, read its text response.
///
/// The response ends when `capacity` bytes were read or the last three bytes are
/// `$$$`, whichever comes first.
pub fn text_command(
    link: &mut dyn Link,
    command: &[u8],
    capacity: Option<usize>,
) -> AppResult<Option<Vec<u8>>> {
    trace!(command = %String::from_utf8_lossy(command), "text command");
    link.send_all(command)?;

    let Some(capacity) = capacity else {
        return Ok(None);
    };

    let mut response = Vec::with_capacity(capacity);
    let mut byte = [0u8; 1];
    while response.len() < capacity && !response.ends_with(TERMINATOR) {
        link.recv_exact(&mut byte)?;
        response.push(byte[0]);
    }

    trace!(response = %String::from_utf8_lossy(&response), "text response");
    Ok(Some(response))
}

#[allow(clippy::expect_used)]
static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^v(\d+)\.(\d+)\.(\d+)").expect("valid version regex")
});

/// Firmware version reported by the `V` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    /// Major release
    pub major: u32,
    /// Minor release
    pub minor: u32,
    /// Patch level
    pub patch: u32,
}

impl FirmwareVersion {
    /// Parse a `v<major>.<minor>.<patch>` banner.
    pub fn parse(response: &[u8]) -> AppResult<Self> {
        let text = String::from_utf8_lossy(response);
        let invalid = || EegError::InvalidResponse(format!("unexpected version banner {text:?}"));

        let caps = VERSION_RE.captures(&text).ok_or_else(invalid)?;
        let field = |i: usize| -> AppResult<u32> {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .ok_or_else(invalid)
        };

        Ok(Self {
            major: field(1)?,
            minor: field(2)?,
            patch: field(3)?,
        })
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockLink;
    use tracing_test::traced_test;

    fn frame(seq: u8, first: i32) -> DataFrame {
        let mut channels = [0; CHANNELS_PER_BOARD];
        channels[0] = first;
        DataFrame {
            seq,
            channels,
            aux: [0; AUX_BYTES],
            stop: 0xC0,
        }
    }

    #[test]
    fn sign_extension() {
        assert_eq!(i24_to_i32([0x7F, 0xFF, 0xFF]), 8_388_607);
        assert_eq!(i24_to_i32([0x80, 0x00, 0x00]), -8_388_608);
        assert_eq!(i24_to_i32([0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(i24_to_i32([0x00, 0x01, 0x00]), 256);
    }

    #[test]
    fn channel_macros() {
        assert_eq!(channel_char(0), Some(b'1'));
        assert_eq!(channel_char(8), Some(b'Q'));
        assert_eq!(channel_char(15), Some(b'I'));
        assert_eq!(channel_char(16), None);
        assert_eq!(channel_settings(2, b'6').unwrap(), b"x3060110X");
        assert_eq!(lead_off(0, true, true).unwrap(), b"z111Z");
        assert_eq!(lead_off(0, false, true).unwrap(), b"z101Z");
    }

    #[test]
    fn full_scale_at_unity_gain() {
        let f = frame(1, 8_388_607);
        let uv = f.microvolts(1);
        assert!((uv[0] - 4.5e6).abs() < 10.0);
        assert_eq!(uv[1], 0.0);
    }

    #[test]
    fn aligned_frame_needs_no_resync() {
        let link = MockLink::new();
        link.push(&frame(7, -5).encode());
        let (decoded, skipped) = read_frame(&mut link.clone()).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.channels[0], -5);
    }

    #[test]
    #[traced_test]
    fn resync_reports_skipped_bytes() {
        let link = MockLink::new();
        link.push(&[0x11; 5]);
        link.push(&frame(3, 42).encode());

        let (decoded, skipped) = read_frame(&mut link.clone()).unwrap();
        assert_eq!(skipped, 5);
        assert_eq!(decoded.channels[0], 42);
        assert!(logs_contain("Realigned after skipping bytes"));
    }

    #[test]
    fn resync_accepts_exact_bound() {
        let link = MockLink::new();
        link.push(&vec![0x11; RESYNC_LIMIT]);
        link.push(&frame(3, 1).encode());
        let (_, skipped) = read_frame(&mut link.clone()).unwrap();
        assert_eq!(skipped, RESYNC_LIMIT);
    }

    #[test]
    fn resync_gives_up_past_bound() {
        let link = MockLink::new();
        link.push(&vec![0x11; RESYNC_LIMIT + 1]);
        link.push(&frame(3, 1).encode());
        assert!(matches!(
            read_frame(&mut link.clone()),
            Err(EegError::Framing(_))
        ));
    }

    #[test]
    fn text_command_stops_at_terminator() {
        let link = MockLink::new();
        link.push(b"OK$$$trailing");
        let response = text_command(&mut link.clone(), b"d", Some(64)).unwrap().unwrap();
        assert_eq!(response, b"OK$$$");
        assert_eq!(link.written(), b"d");
        assert_eq!(link.remaining(), 8);
    }

    #[test]
    fn text_command_stops_at_capacity() {
        let link = MockLink::new();
        link.push(b"abcdef");
        let response = text_command(&mut link.clone(), b"v", Some(4)).unwrap().unwrap();
        assert_eq!(response, b"abcd");
    }

    #[test]
    fn text_command_without_buffer_reads_nothing() {
        let link = MockLink::new();
        link.push(b"x$$$");
        assert!(text_command(&mut link.clone(), b"b", None).unwrap().is_none());
        assert_eq!(link.remaining(), 4);
    }

    #[test]
    fn firmware_version_parse() {
        let version = FirmwareVersion::parse(b"v3.1.2$$$").unwrap();
        assert_eq!(
            version,
            FirmwareVersion {
                major: 3,
                minor: 1,
                patch: 2
            }
        );
        assert_eq!(version.to_string(), "v3.1.2");
        assert!(matches!(
            FirmwareVersion::parse(b"OpenBCI V3 8-16 channel$$$"),
            Err(EegError::InvalidResponse(_))
        ));
    }
}
