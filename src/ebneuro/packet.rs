//! Ebneuro wire codec.
//!
//! Every packet on the three sockets is framed as
//!
//! ```text
//! [0x02][id][len: be16][payload ...][0x03]
//! ```
//!
//! Responses append a little-endian `u16` error code after the payload, and the
//! length field counts it. The fixed-layout blocks carried in payloads are
//! little-endian; they are encoded and decoded field by field here, never by
//! overlaying a byte buffer.

#![allow(missing_docs)] // block fields are named after the device header

use crate::error::{AppResult, EegError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// Port of the init socket (handshake, socket control, impedance).
pub const PORT_INIT: u16 = 7023;
/// Port of the control socket (mode and preset).
pub const PORT_CTRL: u16 = 7024;
/// Port of the data socket (sample stream).
pub const PORT_DATA: u16 = 7025;

/// Number of EEG channels on the BE Plus LTM.
pub const EEG_CHANNELS: usize = 64;
/// Number of DC channels on the BE Plus LTM.
pub const DC_CHANNELS: usize = 4;

/// Start-of-packet marker.
pub const START_MAGIC: u8 = 0x02;
/// End-of-packet marker.
pub const END_MAGIC: u8 = 0x03;

/// Bytes before the payload.
pub const HEADER_LEN: usize = 4;
/// Bytes after the payload of a response (error code + end marker).
pub const RESPONSE_TRAILER_LEN: usize = 3;

/// EEG counts to microvolts.
pub const EEG_SCALE: f32 = 0.125;
/// DC counts to microvolts.
pub const DC_SCALE: f32 = 15.25;

/// Packet identifiers used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketId {
    Hardware = 1,
    Device = 8,
    SetSocket = 9,
    Client = 10,
    ClientSet = 11,
    PresetUpload = 16,
    ModeSet = 20,
    Impedance = 47,
    Firmware = 53,
}

/// Logical sockets addressed by SET_SOCK requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SocketIndex {
    Control = 0,
    Data = 1,
}

/// Requested state of a logical socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SocketCommand {
    Enable = 0,
    Disable = 1,
    Stop = 2,
    Start = 3,
}

/// Device operating modes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WireMode {
    Idle = 0,
    Sample = 1,
    Wave = 2,
    Impedance = 3,
}

/// Preset flag: ohm (impedance) signal available.
pub const FLAG_OHM_SIGNAL: u16 = 1 << 1;
/// Preset flag: stimulation monitor.
pub const FLAG_STIM_MONITOR: u16 = 1 << 3;

/// Payload sizes of the fixed blocks.
pub mod size {
    pub const SOCKET: usize = 24;
    pub const CLIENT: usize = 128;
    pub const CLIENT_SET: usize = 64;
    pub const DEVICE: usize = 34;
    pub const FIRMWARE: usize = 128;
    pub const HARDWARE: usize = 116;
    pub const SOCKET_STATE: usize = 4;
    pub const PRESET: usize = 304;
    pub const MODE: usize = 4;
    pub const IMPEDANCE: usize = 280;
}

/// Encode a request frame.
pub fn encode_request(id: PacketId, payload: &[u8]) -> AppResult<Bytes> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        EegError::Framing(format!("payload of {} bytes does not fit a packet", payload.len()))
    })?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len() + 1);
    frame.put_u8(START_MAGIC);
    frame.put_u8(id as u8);
    frame.put_u16(len);
    frame.put_slice(payload);
    frame.put_u8(END_MAGIC);
    Ok(frame.freeze())
}

/// Encode a response frame as the device sends it.
pub fn encode_response(id: u8, payload: &[u8], code: u16) -> AppResult<Bytes> {
    // the length field counts the trailing code
    let len = u16::try_from(payload.len() + 2).map_err(|_| {
        EegError::Framing(format!("payload of {} bytes does not fit a packet", payload.len()))
    })?;

    let mut frame = BytesMut::with_capacity(response_frame_len(payload.len()));
    frame.put_u8(START_MAGIC);
    frame.put_u8(id);
    frame.put_u16(len);
    frame.put_slice(payload);
    frame.put_u16_le(code);
    frame.put_u8(END_MAGIC);
    Ok(frame.freeze())
}

/// Size on the wire of a response carrying `payload_len` payload bytes.
pub const fn response_frame_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len + RESPONSE_TRAILER_LEN
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Packet identifier echoed by the device.
    pub id: u8,
    /// Payload without the trailing code.
    pub payload: Bytes,
    /// Trailing little-endian code. For data packets this is a plain trailing field.
    pub code: u16,
}

impl Response {
    /// Fail with [`EegError::DeviceError`] if the device reported a non-zero code.
    pub fn check(self, request: PacketId) -> AppResult<Self> {
        if self.code != 0 {
            return Err(EegError::DeviceError {
                packet_id: request as u8,
                code: self.code,
            });
        }
        Ok(self)
    }
}

/// Decode a response frame whose payload is expected to be `payload_len` bytes.
///
/// `frame` must be exactly [`response_frame_len`]`(payload_len)` bytes. A declared
/// length that disagrees with the expectation is logged, not rejected.
pub fn decode_response(frame: &[u8], payload_len: usize) -> AppResult<Response> {
    let expected = response_frame_len(payload_len);
    if frame.len() != expected {
        return Err(EegError::Framing(format!(
            "response frame is {} bytes, expected {expected}",
            frame.len()
        )));
    }

    let mut buf = frame;
    let magic = buf.get_u8();
    if magic != START_MAGIC {
        return Err(EegError::Framing(format!(
            "wrong start magic 0x{magic:02x}"
        )));
    }
    let id = buf.get_u8();
    let declared = buf.get_u16() as usize;
    if declared != payload_len + 2 {
        warn!(
            packet_id = id,
            declared,
            expected = payload_len + 2,
            "Response length field disagrees with expected size"
        );
    }

    let payload = Bytes::copy_from_slice(&buf[..payload_len]);
    buf.advance(payload_len);
    let code = buf.get_u16_le();
    let end = buf.get_u8();
    if end != END_MAGIC {
        return Err(EegError::Framing(format!("wrong end magic 0x{end:02x}")));
    }

    Ok(Response { id, payload, code })
}

fn ensure_len(payload: &[u8], needed: usize, what: &str) -> AppResult<()> {
    if payload.len() < needed {
        return Err(EegError::InvalidResponse(format!(
            "{what} block is {} bytes, expected {needed}",
            payload.len()
        )));
    }
    Ok(())
}

/// Read a NUL-padded fixed-width string.
fn fixed_str(buf: &mut &[u8], width: usize) -> String {
    let raw = &buf[..width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    let text = String::from_utf8_lossy(&raw[..end]).into_owned();
    buf.advance(width);
    text
}

fn put_fixed_str(out: &mut BytesMut, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(width);
    out.put_slice(&bytes[..n]);
    out.put_bytes(0, width - n);
}

/// Remote view of one logical socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    pub enabled: u16,
    pub connected: u16,
    pub address: String,
    pub port: u16,
}

impl SocketInfo {
    fn read(buf: &mut &[u8]) -> Self {
        let enabled = buf.get_u16_le();
        let connected = buf.get_u16_le();
        let address = fixed_str(buf, 16);
        let port = buf.get_u16_le();
        buf.advance(2);
        Self {
            enabled,
            connected,
            address,
            port,
        }
    }
}

/// CLIENT info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub init_socket: SocketInfo,
    pub control_socket: SocketInfo,
    pub data_socket: SocketInfo,
    pub status: u32,
    pub name: String,
}

impl ClientInfo {
    pub fn decode(payload: &[u8]) -> AppResult<Self> {
        ensure_len(payload, size::CLIENT, "client")?;
        let mut buf = payload;
        Ok(Self {
            init_socket: SocketInfo::read(&mut buf),
            control_socket: SocketInfo::read(&mut buf),
            data_socket: SocketInfo::read(&mut buf),
            status: buf.get_u32_le(),
            name: fixed_str(&mut buf, 32),
        })
    }
}

/// CLIENT_SET acknowledgment sent back to the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSet {
    pub timestamp: u32,
    pub name: String,
}

impl ClientSet {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(size::CLIENT_SET);
        out.put_u32_le(self.timestamp);
        put_fixed_str(&mut out, &self.name, 32);
        out.put_bytes(0, 28);
        out.freeze()
    }
}

/// DEVICE info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub index: u16,
}

impl DeviceInfo {
    pub fn decode(payload: &[u8]) -> AppResult<Self> {
        ensure_len(payload, size::DEVICE, "device")?;
        let mut buf = payload;
        let name = fixed_str(&mut buf, 32);
        Ok(Self {
            name,
            index: buf.get_u16_le(),
        })
    }
}

/// FIRMWARE info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub release: u16,
    pub build: u16,
    pub dsp_release: u16,
    pub dsp_build: u16,
    pub epld_release: u16,
}

impl FirmwareInfo {
    pub fn decode(payload: &[u8]) -> AppResult<Self> {
        ensure_len(payload, size::FIRMWARE, "firmware")?;
        let mut buf = payload;
        Ok(Self {
            release: buf.get_u16_le(),
            build: buf.get_u16_le(),
            dsp_release: buf.get_u16_le(),
            dsp_build: buf.get_u16_le(),
            epld_release: buf.get_u16_le(),
        })
    }
}

/// Hardware capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const EEG: u32 = 1 << 0;
    pub const WIFI: u32 = 1 << 1;
    pub const USB: u32 = 1 << 2;
    pub const SUPPORT_ADVANCED: u32 = 1 << 4;
    pub const SUPPORT_FULL: u32 = 1 << 5;
    pub const SUPPORT_STANDARD: u32 = 1 << 6;
    pub const SUPPORT_LIGHT: u32 = 1 << 7;

    const NAMES: [(u32, &'static str); 7] = [
        (Self::EEG, "eeg"),
        (Self::WIFI, "wifi"),
        (Self::USB, "usb"),
        (Self::SUPPORT_ADVANCED, "support-advanced"),
        (Self::SUPPORT_FULL, "support-full"),
        (Self::SUPPORT_STANDARD, "support-standard"),
        (Self::SUPPORT_LIGHT, "support-light"),
    ];

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    /// Names of the known bits that are set.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// HARDWARE info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    pub production_time: u32,
    pub sku: u32,
    pub production_number: u32,
    pub serial: u32,
    pub digital_board_serial: String,
    pub analog_board_serial: String,
    pub wireless_serial: String,
    pub oem: u32,
    pub revision: u32,
    pub battery_sku: u32,
    pub button_shutdown_delay_s: u16,
    pub shutdown_timeout_s: u16,
    pub capabilities: Capabilities,
}

impl HardwareInfo {
    pub fn decode(payload: &[u8]) -> AppResult<Self> {
        ensure_len(payload, size::HARDWARE, "hardware")?;
        let mut buf = payload;
        let production_time = buf.get_u32_le();
        let sku = buf.get_u32_le();
        let production_number = buf.get_u32_le();
        let serial = buf.get_u32_le();
        let digital_board_serial = fixed_str(&mut buf, 16);
        let analog_board_serial = fixed_str(&mut buf, 16);
        let wireless_serial = fixed_str(&mut buf, 16);
        let oem = buf.get_u32_le();
        let revision = buf.get_u32_le();
        let battery_sku = buf.get_u32_le();
        buf.advance(32);
        let button_shutdown_delay_s = buf.get_u16_le();
        let shutdown_timeout_s = buf.get_u16_le();
        let capabilities = Capabilities(buf.get_u32_le());

        Ok(Self {
            production_time,
            sku,
            production_number,
            serial,
            digital_board_serial,
            analog_board_serial,
            wireless_serial,
            oem,
            revision,
            battery_sku,
            button_shutdown_delay_s,
            shutdown_timeout_s,
            capabilities,
        })
    }
}

/// SET_SOCK request body.
pub fn encode_socket_state(index: SocketIndex, command: SocketCommand) -> Bytes {
    let mut out = BytesMut::with_capacity(size::SOCKET_STATE);
    out.put_u16_le(index as u16);
    out.put_u16_le(command as u16);
    out.freeze()
}

/// MODE_SET request body.
pub fn encode_mode(mode: WireMode) -> Bytes {
    let mut out = BytesMut::with_capacity(size::MODE);
    out.put_u16_le(mode as u16);
    out.put_bytes(0, 2);
    out.freeze()
}

/// Acquisition preset uploaded after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub name: String,
    pub eeg_rate: u16,
    pub dc_rate: u16,
    pub flags: u16,
    pub flags2: u16,
    pub mains_rate: u16,
    pub packet_rate: u16,
}

impl Preset {
    /// The preset used by the driver: every channel at `data_rate`.
    pub fn uniform(packet_rate: u16, data_rate: u16) -> Self {
        Self {
            name: "default".to_string(),
            eeg_rate: data_rate,
            dc_rate: data_rate,
            flags: FLAG_OHM_SIGNAL | FLAG_STIM_MONITOR,
            flags2: 0,
            mains_rate: 50,
            packet_rate,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(size::PRESET);
        put_fixed_str(&mut out, &self.name, 32);
        for _ in 0..EEG_CHANNELS {
            out.put_u16_le(self.eeg_rate);
        }
        for _ in 0..DC_CHANNELS {
            out.put_u16_le(self.dc_rate);
        }
        out.put_u16_le(self.flags);
        out.put_u16_le(self.flags2);
        out.put_u16_le(self.mains_rate);
        out.put_u16_le(self.packet_rate);
        out.put_bytes(0, 128);
        out.freeze()
    }
}

/// Raw positive/negative impedance components of one electrode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImpedancePair {
    pub p: i16,
    pub n: i16,
}

impl ImpedancePair {
    /// Combined impedance reading.
    pub fn total(self) -> f32 {
        f32::from(self.p) + f32::from(self.n)
    }
}

fn read_pair(buf: &mut &[u8]) -> ImpedancePair {
    ImpedancePair {
        p: buf.get_i16_le(),
        n: buf.get_i16_le(),
    }
}

/// IMPEDANCE info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpedanceInfo {
    pub eeg: Vec<ImpedancePair>,
    pub dc: Vec<ImpedancePair>,
    pub reference: ImpedancePair,
    pub ground: ImpedancePair,
}

impl ImpedanceInfo {
    pub fn decode(payload: &[u8]) -> AppResult<Self> {
        ensure_len(payload, size::IMPEDANCE, "impedance")?;
        let mut buf = payload;
        let eeg = (0..EEG_CHANNELS).map(|_| read_pair(&mut buf)).collect();
        let dc = (0..DC_CHANNELS).map(|_| read_pair(&mut buf)).collect();
        let reference = read_pair(&mut buf);
        let ground = read_pair(&mut buf);

        Ok(Self {
            eeg,
            dc,
            reference,
            ground,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(size::IMPEDANCE);
        for pair in self
            .eeg
            .iter()
            .chain(&self.dc)
            .chain([&self.reference, &self.ground])
        {
            out.put_i16_le(pair.p);
            out.put_i16_le(pair.n);
        }
        out.freeze()
    }
}

/// Payload length of a data packet carrying `records` records, as framed by
/// the response codec.
///
/// The data frame ends with two big-endian pulse fields instead of an error
/// code; the second one lands in [`Response::code`].
pub const fn data_payload_len(records: usize) -> usize {
    4 + records * (EEG_CHANNELS + DC_CHANNELS + 1) * 2 + 2
}

/// One data packet: a sequence number and `records` raw readings.
///
/// EEG values are stored record-major (`eeg[r * 64 + ch]`), as are DC values
/// (`dc[r * 4 + ch]`). On the wire all EEG records precede all DC records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub seq: u32,
    pub records: usize,
    pub eeg: Vec<u16>,
    pub dc: Vec<u16>,
}

impl DataPacket {
    /// Decode the payload of a data frame.
    pub fn decode(payload: &[u8], records: usize) -> AppResult<Self> {
        ensure_len(payload, data_payload_len(records), "data")?;
        let mut buf = payload;
        let seq = buf.get_u32_le();
        let eeg = (0..records * EEG_CHANNELS).map(|_| buf.get_u16_le()).collect();
        let dc = (0..records * DC_CHANNELS).map(|_| buf.get_u16_le()).collect();

        Ok(Self {
            seq,
            records,
            eeg,
            dc,
        })
    }

    /// Encode a complete frame as the device would send it.
    pub fn encode_frame(&self) -> AppResult<Bytes> {
        let mut payload = BytesMut::with_capacity(data_payload_len(self.records));
        payload.put_u32_le(self.seq);
        for &v in self.eeg.iter().chain(&self.dc) {
            payload.put_u16_le(v);
        }
        // service channel and pulse rate
        payload.put_bytes(0, self.records * 2 + 2);
        encode_response(1, &payload, 0)
    }

    /// Calibrated values of record `r`: 64 EEG channels followed by 4 DC channels.
    pub fn record(&self, r: usize) -> Vec<f32> {
        let eeg = &self.eeg[r * EEG_CHANNELS..(r + 1) * EEG_CHANNELS];
        let dc = &self.dc[r * DC_CHANNELS..(r + 1) * DC_CHANNELS];
        eeg.iter()
            .map(|&v| EEG_SCALE * f32::from(v))
            .chain(dc.iter().map(|&v| DC_SCALE * f32::from(v)))
            .collect()
    }
}
