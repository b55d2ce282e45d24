//! End-to-end tests of the Ebneuro driver against scripted sockets.
//!
//! Each test scripts the three device ports through a `MockConnector` and
//! drives the session through the public `Device` interface.

use med_eeg::device::{Device, Mode};
use med_eeg::ebneuro::packet::{
    self, encode_response, size, DataPacket, ImpedanceInfo, ImpedancePair, PacketId,
    WireMode, DC_CHANNELS, EEG_CHANNELS,
};
use med_eeg::ebneuro::{EbneuroConfig, EbneuroSession};
use med_eeg::error::EegError;
use med_eeg::transport::{MockConnector, MockLink};

const CHANNELS: usize = EEG_CHANNELS + DC_CHANNELS;

struct Rig {
    connector: MockConnector,
    init: MockLink,
    ctrl: MockLink,
    data: MockLink,
}

fn ack(id: PacketId) -> bytes::Bytes {
    encode_response(id as u8, &[], 0).unwrap()
}

fn rig() -> Rig {
    let rig = Rig {
        connector: MockConnector::new(),
        init: MockLink::named("init"),
        ctrl: MockLink::named("ctrl"),
        data: MockLink::named("data"),
    };

    rig.init
        .push(&encode_response(PacketId::Client as u8, &[0; size::CLIENT], 0).unwrap());
    rig.init.push(&ack(PacketId::ClientSet));
    rig.init
        .push(&encode_response(PacketId::Device as u8, &[0; size::DEVICE], 0).unwrap());
    rig.init
        .push(&encode_response(PacketId::Firmware as u8, &[0; size::FIRMWARE], 0).unwrap());
    rig.init
        .push(&encode_response(PacketId::Hardware as u8, &[0; size::HARDWARE], 0).unwrap());
    for _ in 0..4 {
        rig.init.push(&ack(PacketId::SetSocket));
    }
    rig.ctrl.push(&ack(PacketId::ModeSet));
    rig.ctrl.push(&ack(PacketId::ModeSet));
    rig.ctrl.push(&ack(PacketId::PresetUpload));

    rig.connector.add(packet::PORT_INIT, &rig.init);
    rig.connector.add(packet::PORT_CTRL, &rig.ctrl);
    rig.connector.add(packet::PORT_DATA, &rig.data);
    rig
}

fn connect(rig: &Rig) -> Device {
    let session = EbneuroSession::connect(
        EbneuroConfig::new("192.168.171.81"),
        Box::new(rig.connector.clone()),
    )
    .unwrap();
    Device::from_backend(session).unwrap()
}

fn enter(rig: &Rig, device: &mut Device, mode: Mode) {
    rig.ctrl.push(&ack(PacketId::ModeSet));
    rig.ctrl.push(&ack(PacketId::ModeSet));
    device.set_mode(mode).unwrap();
}

/// A packet of 8 records whose EEG code equals its position in the packet.
fn ramp_packet(seq: u32, offset: u16) -> DataPacket {
    let records = 8;
    DataPacket {
        seq,
        records,
        eeg: (0..records * EEG_CHANNELS)
            .map(|i| offset + i as u16)
            .collect(),
        dc: vec![2; records * DC_CHANNELS],
    }
}

#[test]
fn one_packet_yields_eight_scaled_samples() {
    let rig = rig();
    let mut device = connect(&rig);
    assert_eq!(device.channel_count(), CHANNELS);

    enter(&rig, &mut device, Mode::Sampling);
    rig.data.push(&ramp_packet(1, 0).encode_frame().unwrap());

    let mut buf = vec![0.0f32; 8 * CHANNELS];
    assert_eq!(device.sample(&mut buf, 8).unwrap(), 8);

    assert_eq!(buf[0], 0.0);
    assert_eq!(buf[1], 0.125);
    assert_eq!(buf[63], 63.0 * 0.125);
    assert_eq!(buf[64], 2.0 * 15.25);
    // second record starts after 64 EEG codes
    assert_eq!(buf[CHANNELS], 64.0 * 0.125);
    assert_eq!(rig.data.remaining(), 0);
}

#[test]
fn small_reads_are_served_from_the_queue_in_order() {
    let rig = rig();
    let mut device = connect(&rig);
    enter(&rig, &mut device, Mode::Sampling);
    rig.data.push(&ramp_packet(1, 0).encode_frame().unwrap());
    rig.data.push(&ramp_packet(2, 1000).encode_frame().unwrap());

    let mut first = vec![0.0f32; 3 * CHANNELS];
    device.sample(&mut first, 3).unwrap();
    assert_eq!(device.queued(), 5);
    assert_eq!(
        rig.data.remaining(),
        packet::response_frame_len(packet::data_payload_len(8))
    );

    let mut second = vec![0.0f32; 6 * CHANNELS];
    device.sample(&mut second, 6).unwrap();
    assert_eq!(second[0], (3 * EEG_CHANNELS) as f32 * 0.125);
    // sixth value comes from the second packet
    assert_eq!(second[5 * CHANNELS], 1000.0 * 0.125);
    assert_eq!(device.queued(), 7);
}

#[test]
fn mode_change_flushes_stale_bytes_and_queue() {
    let rig = rig();
    let mut device = connect(&rig);
    enter(&rig, &mut device, Mode::Sampling);

    rig.data.push(&ramp_packet(1, 0).encode_frame().unwrap());
    let mut buf = vec![0.0f32; CHANNELS];
    device.sample(&mut buf, 1).unwrap();
    assert_eq!(device.queued(), 7);

    let stale = ramp_packet(2, 0).encode_frame().unwrap();
    rig.data.push_pending(&stale);
    rig.ctrl.clear_written();
    enter(&rig, &mut device, Mode::Test);

    assert_eq!(device.queued(), 0);
    assert_eq!(rig.data.flushed(), stale.len());

    // idle first, then the wave test signal
    let written = rig.ctrl.written();
    let mode_set =
        |mode| packet::encode_request(PacketId::ModeSet, &packet::encode_mode(mode)).unwrap();
    let idle = mode_set(WireMode::Idle);
    let wave = mode_set(WireMode::Wave);
    assert_eq!(written, [&idle[..], &wave[..]].concat());
}

#[test]
fn impedance_reports_nan_for_dc_channels() {
    let rig = rig();
    let mut device = connect(&rig);

    let info = ImpedanceInfo {
        eeg: (0..EEG_CHANNELS as i16)
            .map(|i| ImpedancePair { p: i, n: 1 })
            .collect(),
        dc: vec![ImpedancePair::default(); DC_CHANNELS],
        reference: ImpedancePair::default(),
        ground: ImpedancePair::default(),
    };
    let init = MockLink::named("init-impedance");
    init.push(&encode_response(PacketId::Impedance as u8, &info.encode(), 0).unwrap());
    rig.connector.add(packet::PORT_INIT, &init);
    rig.data.push_pending(&[0xAA; 17]);

    let mut out = vec![0.0f32; CHANNELS];
    assert_eq!(device.get_impedance(&mut out).unwrap(), CHANNELS);
    assert_eq!(out[0], 1.0);
    assert_eq!(out[10], 11.0);
    assert!(out[EEG_CHANNELS..].iter().all(|v| v.is_nan()));
    assert!(init.is_closed());
    assert_eq!(rig.data.flushed(), 17);
}

#[test]
fn truncated_data_frame_is_an_error() {
    let rig = rig();
    let mut device = connect(&rig);
    enter(&rig, &mut device, Mode::Sampling);

    let frame = ramp_packet(1, 0).encode_frame().unwrap();
    rig.data.push(&frame[..frame.len() - 10]);

    let mut buf = vec![0.0f32; CHANNELS];
    assert!(matches!(device.sample(&mut buf, 1), Err(EegError::Io(_))));
}

#[test]
fn bad_end_magic_is_a_framing_error() {
    let rig = rig();
    let mut device = connect(&rig);
    enter(&rig, &mut device, Mode::Sampling);

    let mut frame = ramp_packet(1, 0).encode_frame().unwrap().to_vec();
    if let Some(last) = frame.last_mut() {
        *last = 0x7F;
    }
    rig.data.push(&frame);

    let mut buf = vec![0.0f32; CHANNELS];
    assert!(matches!(device.sample(&mut buf, 1), Err(EegError::Framing(_))));
}

#[test]
fn destroy_disables_both_sockets() {
    let rig = rig();
    let device = connect(&rig);

    rig.ctrl.push(&ack(PacketId::ModeSet));
    rig.ctrl.push(&ack(PacketId::ModeSet));
    let init = MockLink::named("init-teardown");
    init.push(&ack(PacketId::SetSocket));
    init.push(&ack(PacketId::SetSocket));
    rig.connector.add(packet::PORT_INIT, &init);

    device.destroy();

    assert!(rig.ctrl.is_closed());
    assert!(rig.data.is_closed());
    assert!(init.is_closed());
    assert_eq!(init.remaining(), 0);
    assert_eq!(rig.connector.connects().last(), Some(&packet::PORT_INIT));
}

#[test]
fn destroy_survives_a_dead_device() {
    let rig = rig();
    let device = connect(&rig);

    // nothing scripted: idle fails, init reconnect is refused
    rig.ctrl.trigger_failure();
    device.destroy();

    assert!(rig.ctrl.is_closed());
    assert!(rig.data.is_closed());
}
