//! OpenBCI sessions driven through a scripted serial line.

use med_eeg::device::{Device, Mode};
use med_eeg::error::EegError;
use med_eeg::openbci::impedance::rms_current;
use med_eeg::openbci::packet::{self, DataFrame};
use med_eeg::openbci::{OpenBciConfig, OpenBciSession};
use med_eeg::transport::MockLink;

const RESET_BANNER: &[u8] = b"OpenBCI V3 8-16 channel\nOn Board ADS1299 Device ID: 0x3E\n$$$";

/// Script the negotiation: reset banner, version, channel probe reply.
fn negotiating_link(probe_reply: &[u8]) -> MockLink {
    let link = MockLink::named("ttyUSB0");
    link.push_pending(b"leftover bytes from a previous run");
    link.push(RESET_BANNER);
    link.push(b"v3.1.2$$$");
    link.push(probe_reply);
    link
}

fn frame(seq: u8, code: i32) -> Vec<u8> {
    DataFrame {
        seq,
        channels: [code; 8],
        aux: [0; 6],
        stop: 0xC0,
    }
    .encode()
}

fn microvolts(code: i32) -> f32 {
    let scale = packet::scale_volts(24) * 1e6;
    code as f32 * scale
}

fn open(link: &MockLink, config: OpenBciConfig) -> Device {
    let session = OpenBciSession::with_link(config, link.endpoint()).unwrap();
    Device::from_backend(session).unwrap()
}

/// Acknowledge the `d`, per-channel `x` and lead-off commands of a sampling setup.
fn ack_sampling_setup(link: &MockLink, channels: usize) {
    for _ in 0..channels + 2 {
        link.push(b"Success$$$");
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn negotiation_probes_the_daisy() {
    let link = negotiating_link(b"daisy attached16$$$");
    let device = open(&link, OpenBciConfig::new("/dev/ttyUSB0"));

    let (channels, labels) = device.get_channels();
    assert_eq!(channels, 16);
    assert_eq!(labels[15], "eeg15");
    assert_eq!(link.written(), b"vVC");
    assert!(link.flushed() > 0);

    let med_eeg::device::Backend::OpenBci(session) = device.backend() else {
        panic!("expected an OpenBCI backend");
    };
    assert_eq!(session.firmware_version().to_string(), "v3.1.2");
}

#[test]
fn single_board_without_daisy() {
    let link = negotiating_link(b"no daisy to attach!8$$$");
    let device = open(&link, OpenBciConfig::new("/dev/ttyUSB0"));
    assert_eq!(device.channel_count(), 8);
}

#[test]
fn forced_sixteen_channels_refused() {
    let link = negotiating_link(b"no daisy to attach!$$$");
    let config = OpenBciConfig {
        channels: Some(16),
        ..OpenBciConfig::new("/dev/ttyUSB0")
    };
    assert!(matches!(
        OpenBciSession::with_link(config, link.endpoint()),
        Err(EegError::InvalidResponse(_))
    ));
}

#[test]
fn unreadable_version_fails_negotiation() {
    let link = MockLink::new();
    link.push(RESET_BANNER);
    link.push(b"Firmware: unknown$$$");
    assert!(matches!(
        OpenBciSession::with_link(OpenBciConfig::new("/dev/ttyUSB0"), link.endpoint()),
        Err(EegError::InvalidResponse(_))
    ));
}

#[test]
fn sampling_configures_every_channel_then_streams() {
    let link = negotiating_link(b"c$$$");
    let config = OpenBciConfig {
        channels: Some(8),
        ..OpenBciConfig::new("/dev/ttyUSB0")
    };
    let mut device = open(&link, config);
    link.clear_written();

    ack_sampling_setup(&link, 8);
    device.set_mode(Mode::Sampling).unwrap();

    let written = link.written();
    assert!(written.starts_with(b"sd"));
    assert!(contains(&written, b"x1060110X"));
    assert!(contains(&written, b"x8060110X"));
    assert!(contains(&written, b"z101Z"));
    assert!(written.ends_with(b"b"));

    link.push(&frame(1, 1000));
    link.push(&frame(2, -1000));
    let mut buf = [0.0f32; 16];
    assert_eq!(device.sample(&mut buf, 2).unwrap(), 2);
    assert_eq!(buf[0], microvolts(1000));
    assert_eq!(buf[8], microvolts(-1000));
}

#[test]
fn daisy_interleave_combines_halves() {
    let link = negotiating_link(b"16$$$");
    let mut device = open(&link, OpenBciConfig::new("/dev/ttyUSB0"));
    ack_sampling_setup(&link, 16);
    device.set_mode(Mode::Sampling).unwrap();

    link.push(&frame(1, 100));
    link.push(&frame(2, 200));
    link.push(&frame(3, 300));

    let mut buf = [0.0f32; 3 * 16];
    device.sample(&mut buf, 3).unwrap();
    let (first, rest) = buf.split_at(16);
    let (second, third) = rest.split_at(16);

    // board half fresh, daisy half still zero
    assert!(first[..8].iter().all(|&v| v == microvolts(100)));
    assert!(first[8..].iter().all(|&v| v == 0.0));
    // daisy frame fills the upper half, board half from the previous frame
    assert!(second[..8].iter().all(|&v| v == microvolts(100)));
    assert!(second[8..].iter().all(|&v| v == microvolts(200)));
    assert!(third[..8].iter().all(|&v| v == microvolts(300)));
    assert!(third[8..].iter().all(|&v| v == microvolts(200)));
}

#[test]
fn stream_realigns_after_garbage() {
    let link = negotiating_link(b"8$$$");
    let mut device = open(&link, OpenBciConfig::new("/dev/ttyUSB0"));
    ack_sampling_setup(&link, 8);
    device.set_mode(Mode::Sampling).unwrap();

    link.push(&[0x11; 5]);
    link.push(&frame(7, 42));

    let mut buf = [0.0f32; 8];
    device.sample(&mut buf, 1).unwrap();
    assert_eq!(buf[0], microvolts(42));
    assert_eq!(link.remaining(), 0);
}

#[test]
fn stream_without_frame_boundary_fails() {
    let link = negotiating_link(b"8$$$");
    let mut device = open(&link, OpenBciConfig::new("/dev/ttyUSB0"));
    ack_sampling_setup(&link, 8);
    device.set_mode(Mode::Sampling).unwrap();

    link.push(&[0x11; packet::PACKET_SIZE + packet::RESYNC_LIMIT + 1]);

    let mut buf = [0.0f32; 8];
    assert!(matches!(
        device.sample(&mut buf, 1),
        Err(EegError::Framing(_))
    ));
}

#[test]
fn impedance_estimate_restores_previous_mode() {
    let link = negotiating_link(b"8$$$");
    let config = OpenBciConfig {
        impedance_samples: 4,
        ..OpenBciConfig::new("/dev/ttyUSB0")
    };
    let mut device = open(&link, config);
    link.clear_written();

    // lead-off acknowledgment, then the measurement window
    link.push(b"Success$$$");
    for seq in 1..=4 {
        link.push(&frame(seq, 5000));
    }

    let mut out = [0.0f32; 8];
    assert_eq!(device.get_impedance(&mut out).unwrap(), 8);

    let written = link.written();
    assert!(written.starts_with(b"sz111Zb"));
    assert!(written.ends_with(b"s"));

    let expected = (f64::from(microvolts(5000)) * 1e-6 / rms_current()) as f32;
    for ohms in out {
        assert!((ohms - expected).abs() / expected < 1e-3, "{ohms} vs {expected}");
    }

    let med_eeg::device::Backend::OpenBci(session) = device.backend() else {
        panic!("expected an OpenBCI backend");
    };
    assert_eq!(session.mode(), Mode::Idle);
    assert!(!session.is_streaming());
}

#[test]
fn destroy_stops_and_resets_the_board() {
    let link = negotiating_link(b"8$$$");
    let device = open(&link, OpenBciConfig::new("/dev/ttyUSB0"));
    link.clear_written();
    link.push(RESET_BANNER);

    device.destroy();
    assert_eq!(link.written(), b"sv");
    assert!(link.is_closed());
}

#[test]
fn test_signal_mode_drops_queued_samples() {
    let link = negotiating_link(b"8$$$");
    let mut device = open(&link, OpenBciConfig::new("/dev/ttyUSB0"));
    ack_sampling_setup(&link, 8);
    device.set_mode(Mode::Sampling).unwrap();

    link.push(&frame(1, 10));
    link.push(&frame(2, 20));
    device.sample(&mut [], 0).unwrap();
    device.sample(&mut [], 0).unwrap();
    assert_eq!(device.queued(), 2);

    link.clear_written();
    link.push(b"Success$$$");
    device.set_mode(Mode::Test).unwrap();

    assert_eq!(device.queued(), 0);
    assert_eq!(link.written(), b"s-b");

    link.push(&frame(3, 30));
    let mut buf = [0.0f32; 8];
    device.sample(&mut buf, 1).unwrap();
    assert_eq!(buf[0], microvolts(30));
}

#[test]
fn impedance_window_discards_earlier_samples() {
    let link = negotiating_link(b"16$$$");
    let config = OpenBciConfig {
        impedance_samples: 2,
        ..OpenBciConfig::new("/dev/ttyUSB0")
    };
    let mut device = open(&link, config);
    ack_sampling_setup(&link, 16);
    device.set_mode(Mode::Sampling).unwrap();

    link.push(&frame(1, 100));
    link.push(&frame(2, 200));
    device.sample(&mut [], 0).unwrap();
    device.sample(&mut [], 0).unwrap();
    assert_eq!(device.queued(), 2);

    // lead-off acknowledgment, window, then the sampling setup again
    link.push(b"Success$$$");
    link.push(&frame(1, 5000));
    link.push(&frame(2, 5000));
    ack_sampling_setup(&link, 16);

    let mut ohms = [0.0f32; 16];
    device.get_impedance(&mut ohms).unwrap();
    assert_eq!(device.queued(), 0);

    link.push(&frame(3, 300));
    let mut buf = [0.0f32; 16];
    device.sample(&mut buf, 1).unwrap();

    // fresh board half, daisy half not carried over from the window
    assert!(buf[..8].iter().all(|&v| v == microvolts(300)));
    assert!(buf[8..].iter().all(|&v| v == 0.0));
}
