//! EBNeuro BE Plus LTM driver.
//!
//! The amplifier exposes three TCP ports. The init socket is used for the
//! handshake: client/device/firmware/hardware info blocks are read, then the
//! control and data logical sockets are enabled and started, and the init socket
//! is closed. From then on mode changes and presets go over the control socket
//! and samples stream on the data socket. The init socket is briefly reopened
//! for impedance reads and teardown.
//!
//! ## Configuration
//!
//! | Key | Default | Meaning |
//! |---|---|---|
//! | `address` | required | device IP address |
//! | `packet_rate` | 64 | data packets per second |
//! | `data_rate` | 512 | records per second, a multiple of `packet_rate` |
//! | `read_timeout_ms` | 1000 | per-read socket timeout |
//! | `recv_attempts` | 5 | timed-out reads tolerated before a receive fails |

pub mod packet;

use crate::config::ConfigSet;
use crate::device::{Driver, Mode};
use crate::error::{try_alloc, AppResult, EegError};
use crate::logging;
use crate::queue::{Sample, SampleQueue};
use crate::transport::{DynConnector, DynLink, Link, TcpConnector};
use packet::{
    ClientInfo, ClientSet, DataPacket, DeviceInfo, FirmwareInfo, HardwareInfo, ImpedanceInfo,
    PacketId, Preset, Response, SocketCommand, SocketIndex, WireMode, DC_CHANNELS, EEG_CHANNELS,
};
use crate::transport::tcp::DEFAULT_RECV_ATTEMPTS;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, info, trace, warn, Span};

/// Default network packet cadence.
pub const DEFAULT_PACKET_RATE: u16 = 64;
/// Default sample cadence.
pub const DEFAULT_DATA_RATE: u16 = 512;
/// Default per-read socket timeout.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Typed configuration of the Ebneuro driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EbneuroConfig {
    /// Device IP address.
    pub address: String,
    /// Packets per second.
    pub packet_rate: u16,
    /// Records per second.
    pub data_rate: u16,
    /// Per-read socket timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// Consecutive timed-out reads tolerated before a receive fails.
    pub recv_attempts: u32,
}

impl EbneuroConfig {
    /// Create a configuration with default rates.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            packet_rate: DEFAULT_PACKET_RATE,
            data_rate: DEFAULT_DATA_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            recv_attempts: DEFAULT_RECV_ATTEMPTS,
        }
    }

    /// Derive the configuration from `address`, `packet_rate`, `data_rate`,
    /// `read_timeout_ms` and `recv_attempts`.
    pub fn from_config(config: &ConfigSet) -> AppResult<Self> {
        let address = config.require("address")?.trim().to_string();
        crate::config::is_valid_ip(&address)
            .map_err(|reason| EegError::invalid_option("address", &address, reason))?;

        let parsed = Self {
            address,
            packet_rate: config.parse_or("packet_rate", DEFAULT_PACKET_RATE)?,
            data_rate: config.parse_or("data_rate", DEFAULT_DATA_RATE)?,
            read_timeout_ms: config.parse_or("read_timeout_ms", DEFAULT_READ_TIMEOUT_MS)?,
            recv_attempts: config.parse_or("recv_attempts", DEFAULT_RECV_ATTEMPTS)?,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check that the rates describe a whole number of records per packet
    /// and that the socket timeouts are usable.
    pub fn validate(&self) -> AppResult<()> {
        if self.read_timeout_ms == 0 {
            return Err(EegError::invalid_option("read_timeout_ms", "0", "must be positive"));
        }
        if self.recv_attempts == 0 {
            return Err(EegError::invalid_option("recv_attempts", "0", "must be positive"));
        }
        if self.packet_rate == 0 {
            return Err(EegError::invalid_option(
                "packet_rate",
                &self.packet_rate.to_string(),
                "must be positive",
            ));
        }
        if self.data_rate == 0 || self.data_rate % self.packet_rate != 0 {
            return Err(EegError::invalid_option(
                "data_rate",
                &self.data_rate.to_string(),
                format!("must be a positive multiple of packet_rate ({})", self.packet_rate),
            ));
        }
        Ok(())
    }

    /// Records carried by one data packet.
    pub fn records_per_packet(&self) -> usize {
        usize::from(self.data_rate / self.packet_rate)
    }

    /// A TCP connector for the configured address and socket timeouts.
    pub fn tcp_connector(&self) -> AppResult<TcpConnector> {
        Ok(TcpConnector::new(&self.address)?
            .with_read_timeout(Duration::from_millis(self.read_timeout_ms))
            .with_recv_attempts(self.recv_attempts))
    }
}

/// Channel labels: `eeg0..eeg63` followed by `dc0..dc3`.
pub fn channel_labels() -> Vec<String> {
    (0..EEG_CHANNELS)
        .map(|i| format!("eeg{i}"))
        .chain((0..DC_CHANNELS).map(|i| format!("dc{i}")))
        .collect()
}

fn not_connected(which: &str) -> EegError {
    EegError::Io(std::io::Error::new(
        ErrorKind::NotConnected,
        format!("{which} socket is not connected"),
    ))
}

/// Send a request and read a response carrying `payload_len` bytes.
fn request(
    link: &mut dyn Link,
    id: PacketId,
    payload: &[u8],
    payload_len: usize,
) -> AppResult<Response> {
    trace!(packet = ?id, len = payload.len(), "request");
    link.send_all(&packet::encode_request(id, payload)?)?;

    let mut frame = try_alloc(packet::response_frame_len(payload_len))?;
    link.recv_exact(&mut frame)?;
    packet::decode_response(&frame, payload_len)?.check(id)
}

fn set_socket_state(
    link: &mut dyn Link,
    index: SocketIndex,
    command: SocketCommand,
) -> AppResult<()> {
    request(
        link,
        PacketId::SetSocket,
        &packet::encode_socket_state(index, command),
        0,
    )
    .map(|_| ())
}

fn wire_mode(mode: Mode) -> WireMode {
    match mode {
        Mode::Idle => WireMode::Idle,
        Mode::Sampling => WireMode::Sample,
        Mode::Impedance => WireMode::Impedance,
        Mode::Test => WireMode::Wave,
    }
}

/// A connected Ebneuro amplifier.
pub struct EbneuroSession {
    config: EbneuroConfig,
    connector: DynConnector,
    ctrl: Option<DynLink>,
    data: Option<DynLink>,
    client: ClientInfo,
    device: DeviceInfo,
    firmware: FirmwareInfo,
    hardware: HardwareInfo,
    labels: Vec<String>,
    mode: Mode,
    next_seq: u32,
    torn_down: bool,
    span: Span,
}

impl EbneuroSession {
    /// Connect over TCP to the address in `config`.
    pub fn open(config: EbneuroConfig) -> AppResult<Self> {
        config.validate()?;
        let connector = config.tcp_connector()?;
        Self::connect(config, Box::new(connector))
    }

    /// Run the handshake through `connector`, upload the preset and leave the
    /// device idle.
    pub fn connect(config: EbneuroConfig, mut connector: DynConnector) -> AppResult<Self> {
        config.validate()?;
        let span = logging::device_span("ebneuro", &config.address);
        let _guard = span.enter();

        debug!("Preparing the connection");
        let mut init = connector.connect(packet::PORT_INIT)?;
        debug!(link = %init.describe(), "Init socket open");

        let client = ClientInfo::decode(
            &request(init.as_mut(), PacketId::Client, &[], packet::size::CLIENT)?.payload,
        )?;
        debug!(name = %client.name, status = client.status, "Client info");

        // Timestamp and name are not used by the device
        request(
            init.as_mut(),
            PacketId::ClientSet,
            &ClientSet::default().encode(),
            0,
        )?;

        let device = DeviceInfo::decode(
            &request(init.as_mut(), PacketId::Device, &[], packet::size::DEVICE)?.payload,
        )?;
        info!(name = %device.name, index = device.index, "Connected to device");

        let firmware = FirmwareInfo::decode(
            &request(init.as_mut(), PacketId::Firmware, &[], packet::size::FIRMWARE)?.payload,
        )?;
        debug!(
            release = firmware.release,
            build = firmware.build,
            dsp_release = firmware.dsp_release,
            "Firmware info"
        );

        let hardware = HardwareInfo::decode(
            &request(init.as_mut(), PacketId::Hardware, &[], packet::size::HARDWARE)?.payload,
        )?;
        debug!(
            serial = hardware.serial,
            revision = hardware.revision,
            capabilities = ?hardware.capabilities.names(),
            "Hardware info"
        );

        for index in [SocketIndex::Control, SocketIndex::Data] {
            set_socket_state(init.as_mut(), index, SocketCommand::Enable)?;
            set_socket_state(init.as_mut(), index, SocketCommand::Start)?;
        }
        drop(init);

        let ctrl = connector.connect(packet::PORT_CTRL)?;
        let data = connector.connect(packet::PORT_DATA)?;
        debug!(ctrl = %ctrl.describe(), data = %data.describe(), "Streaming sockets open");

        let mut session = Self {
            config,
            connector,
            ctrl: Some(ctrl),
            data: Some(data),
            client,
            device,
            firmware,
            hardware,
            labels: channel_labels(),
            mode: Mode::Idle,
            next_seq: 0,
            torn_down: false,
            span: span.clone(),
        };

        session.switch_mode(Mode::Idle, &mut SampleQueue::new())?;
        session.upload_preset()?;
        Ok(session)
    }

    fn upload_preset(&mut self) -> AppResult<()> {
        let preset = Preset::uniform(self.config.packet_rate, self.config.data_rate);
        let ctrl = self.ctrl.as_mut().ok_or_else(|| not_connected("control"))?;
        request(ctrl.as_mut(), PacketId::PresetUpload, &preset.encode(), 0)?;
        debug!(
            packet_rate = self.config.packet_rate,
            data_rate = self.config.data_rate,
            "Preset uploaded"
        );
        Ok(())
    }

    /// Route through idle, drop in-flight bytes and queued samples, then enter `mode`.
    fn switch_mode(&mut self, mode: Mode, queue: &mut SampleQueue) -> AppResult<()> {
        let ctrl = self.ctrl.as_mut().ok_or_else(|| not_connected("control"))?;
        let data = self.data.as_mut().ok_or_else(|| not_connected("data"))?;

        request(
            ctrl.as_mut(),
            PacketId::ModeSet,
            &packet::encode_mode(WireMode::Idle),
            0,
        )?;
        self.mode = Mode::Idle;

        let flushed = data.flush_pending()?;
        let dropped = queue.clear();
        debug!(flushed, dropped, "Flushed pending data");

        request(
            ctrl.as_mut(),
            PacketId::ModeSet,
            &packet::encode_mode(wire_mode(mode)),
            0,
        )?;
        self.mode = mode;
        Ok(())
    }

    /// Configuration the session was opened with.
    pub fn config(&self) -> &EbneuroConfig {
        &self.config
    }

    /// Client block read at connect time.
    pub fn client_info(&self) -> &ClientInfo {
        &self.client
    }

    /// Device block read at connect time.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    /// Firmware block read at connect time.
    pub fn firmware_info(&self) -> &FirmwareInfo {
        &self.firmware
    }

    /// Hardware block read at connect time.
    pub fn hardware_info(&self) -> &HardwareInfo {
        &self.hardware
    }

    /// Mode last acknowledged by the device.
    pub fn mode(&self) -> Mode {
        self.mode
    }
}

impl Driver for EbneuroSession {
    fn driver_name(&self) -> &'static str {
        "ebneuro"
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn acquire(&mut self, queue: &mut SampleQueue) -> AppResult<usize> {
        let span = self.span.clone();
        let _guard = span.enter();

        let records = self.config.records_per_packet();
        let payload_len = packet::data_payload_len(records);
        let data = self.data.as_mut().ok_or_else(|| not_connected("data"))?;

        let mut frame = try_alloc(packet::response_frame_len(payload_len))?;
        data.recv_exact(&mut frame)?;
        let response = packet::decode_response(&frame, payload_len)?;
        let decoded = DataPacket::decode(&response.payload, records)?;
        trace!(seq = decoded.seq, records, "Data packet");

        for r in 0..records {
            queue.enqueue(Sample::new(self.next_seq, decoded.record(r)));
            self.next_seq = self.next_seq.wrapping_add(1);
        }
        Ok(records)
    }

    fn set_mode(&mut self, mode: Mode, queue: &mut SampleQueue) -> AppResult<()> {
        let span = self.span.clone();
        let _guard = span.enter();
        debug!(?mode, "Setting mode");
        self.switch_mode(mode, queue)
    }

    fn impedance(&mut self, _queue: &mut SampleQueue) -> AppResult<Vec<Option<f32>>> {
        let span = self.span.clone();
        let _guard = span.enter();

        let mut init = self.connector.connect(packet::PORT_INIT)?;
        let response = request(
            init.as_mut(),
            PacketId::Impedance,
            &[],
            packet::size::IMPEDANCE,
        );
        drop(init);
        let info = ImpedanceInfo::decode(&response?.payload)?;

        // The device emits stray packets on the data socket while answering
        let data = self.data.as_mut().ok_or_else(|| not_connected("data"))?;
        let flushed = data.flush_pending()?;
        debug!(flushed, "Flushed pending data");

        // DC readings are unreliable on this hardware
        Ok(info
            .eeg
            .iter()
            .map(|pair| Some(pair.total()))
            .chain(std::iter::repeat(None).take(DC_CHANNELS))
            .collect())
    }

    fn shutdown(&mut self) -> usize {
        if self.torn_down {
            return 0;
        }
        self.torn_down = true;

        let span = self.span.clone();
        let _guard = span.enter();
        let mut failures = 0;

        if let Err(e) = self.switch_mode(Mode::Idle, &mut SampleQueue::new()) {
            warn!(error = %e, "Failed to set idle mode");
            failures += 1;
        }

        self.ctrl = None;
        self.data = None;

        match self.connector.connect(packet::PORT_INIT) {
            Ok(mut init) => {
                for index in [SocketIndex::Control, SocketIndex::Data] {
                    if let Err(e) = set_socket_state(init.as_mut(), index, SocketCommand::Disable)
                    {
                        warn!(error = %e, socket = ?index, "Failed to disable socket");
                        failures += 1;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to init socket");
                failures += 1;
            }
        }

        debug!(failures, "Torn down");
        failures
    }
}
