//! End-to-end scenarios against the simulated driver.
//! Run with: cargo test -p trackmix-audio --test scenarios

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use trackmix_audio::codec::linear_to_ulaw;
use trackmix_audio::{
    Converter, Device, DeviceConfig, Direction, Error, Format, HwCodec, OpenMode, Readiness,
    SimulatedDriver, StageKind,
};

const HW: Format = Format::internal(2, 48000);
/// Bytes in one 10 ms block of `HW`.
const HW_BLOCK: usize = 480 * 4;

fn playback_device() -> (Device, SimulatedDriver) {
    let driver = SimulatedDriver::new(Some(HW), None);
    let device = Device::new(driver.clone(), DeviceConfig::default()).unwrap();
    (device, driver)
}

fn capture_device() -> (Device, SimulatedDriver) {
    let driver = SimulatedDriver::new(None, Some(HW));
    let device = Device::new(driver.clone(), DeviceConfig::default()).unwrap();
    (device, driver)
}

fn samples_to_bytes(samples: impl IntoIterator<Item = i16>) -> Vec<u8> {
    samples.into_iter().flat_map(|s| s.to_ne_bytes()).collect()
}

fn hw_block(value: i16) -> Vec<u8> {
    samples_to_bytes(std::iter::repeat_n(value, 960))
}

/// Polls `cond` for up to two seconds.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_ulaw_8k_mono_one_second_to_48k_stereo() {
    let (device, driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    assert_eq!(device.format(file, Direction::Playback).unwrap(), Format::ulaw_8k_mono());
    assert_eq!(
        device.stages(file, Direction::Playback).unwrap(),
        vec![StageKind::Codec, StageKind::ChannelMix, StageKind::Rate]
    );

    assert_eq!(device.write(file, &[0xFF; 8000]).unwrap(), 8000);
    let _clock = driver.start_clock(Duration::ZERO);
    device.drain(file).unwrap();

    let stats = device.stats(file, Direction::Playback).unwrap();
    assert_eq!(stats.output_frames, 48000);
    assert_eq!(stats.user_bytes, 8000);
    assert!(driver.take_played().iter().all(|&b| b == 0));
}

#[test]
fn test_11025_mono_one_second_fills_48000_frames() {
    let (device, driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_format(file, Format::internal(1, 11025)).unwrap();
    assert_eq!(
        device.stages(file, Direction::Playback).unwrap(),
        vec![StageKind::ChannelMix, StageKind::Rate]
    );

    let second = samples_to_bytes(std::iter::repeat_n(0, 11025));
    assert_eq!(device.write(file, &second).unwrap(), second.len());
    let _clock = driver.start_clock(Duration::ZERO);
    device.drain(file).unwrap();

    let stats = device.stats(file, Direction::Playback).unwrap();
    assert_eq!(stats.output_frames, 48000);
    assert_eq!(stats.user_bytes, 22050);
}

#[test]
fn test_two_full_scale_tones_engage_agc() {
    let (device, driver) = playback_device();
    let tone = samples_to_bytes((0..960 * 20).map(|i| if i % 96 < 48 { 30000 } else { -30000 }));

    let a = device.open(OpenMode::Playback).unwrap();
    let b = device.open(OpenMode::Playback).unwrap();
    for file in [a, b] {
        device.set_format(file, HW).unwrap();
        assert!(device.stages(file, Direction::Playback).unwrap().is_empty());
    }
    device.write(a, &tone).unwrap();
    device.write(b, &tone).unwrap();

    let clock = driver.start_clock(Duration::ZERO);
    device.drain(a).unwrap();
    device.drain(b).unwrap();
    drop(clock);

    let stats = device.mixer_stats(Direction::Playback).unwrap();
    assert!(stats.agc_events >= 1);
    assert!(stats.volume < 256);
    assert_eq!(stats.tracks, 2);
}

#[test]
fn test_drain_without_data_returns_at_once() {
    let (device, _driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    let start = Instant::now();
    device.drain(file).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_drain_one_block_waits_for_one_advance() {
    let (device, driver) = playback_device();
    let device = Arc::new(device);
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_format(file, HW).unwrap();
    device.write(file, &hw_block(100)).unwrap();
    assert!(driver.is_output_running());

    let (tx, rx) = mpsc::channel();
    let drainer = {
        let device = device.clone();
        thread::spawn(move || tx.send(device.drain(file)).unwrap())
    };
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    assert!(driver.complete_output());
    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, Ok(()));
    drainer.join().unwrap();
    assert_eq!(device.mixer_stats(Direction::Playback).unwrap().hw_blocks, 1);
}

#[test]
fn test_identical_format_plays_bit_exact() {
    let (device, driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_format(file, HW).unwrap();

    let input = samples_to_bytes((0..960 * 3).map(|i| (i * 37 % 65536 - 32768) as i16));
    device.write(file, &input).unwrap();
    for _ in 0..3 {
        assert!(driver.complete_output());
    }
    assert_eq!(driver.take_played(), input);
    assert_eq!(device.mixer_stats(Direction::Playback).unwrap().volume, 256);
}

#[test]
fn test_trigger_mode_plays_ring() {
    let driver = SimulatedDriver::new(Some(HW), None).trigger_mode();
    let device = Device::new(driver.clone(), DeviceConfig::default()).unwrap();
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_format(file, HW).unwrap();

    let input: Vec<u8> = [hw_block(1), hw_block(2), hw_block(3)].concat();
    device.write(file, &input).unwrap();
    for _ in 0..3 {
        assert!(driver.complete_output());
    }
    assert_eq!(driver.take_played(), input);
}

#[test]
fn test_capture_overflow_drops_oldest() {
    let (device, driver) = capture_device();
    let file = device.open(OpenMode::Capture).unwrap();
    device.set_format(file, HW).unwrap();
    assert!(driver.is_input_running());

    for i in 0..6 {
        assert!(driver.complete_input(&hw_block(i)));
    }
    let stats = device.stats(file, Direction::Capture).unwrap();
    assert_eq!(stats.drop_frames, 2 * 480);
    assert_eq!(stats.output_frames, 6 * 480);

    assert_eq!(device.readable_bytes(file).unwrap(), 4 * HW_BLOCK);
    let mut buf = vec![0u8; 4 * HW_BLOCK];
    assert_eq!(device.read(file, &mut buf).unwrap(), 4 * HW_BLOCK);
    let expected: Vec<u8> = (2..6).flat_map(hw_block).collect();
    assert_eq!(buf, expected);
}

#[test]
fn test_capture_converts_to_user_format() {
    let (device, driver) = capture_device();
    let file = device.open(OpenMode::Capture).unwrap();
    assert_eq!(
        device.stages(file, Direction::Capture).unwrap(),
        vec![StageKind::Rate, StageKind::ChannelMix, StageKind::Codec]
    );
    driver.complete_input(&hw_block(1000));
    driver.complete_input(&hw_block(1000));

    let mut buf = [0u8; 400];
    let n = device.read(file, &mut buf).unwrap();
    assert_eq!(n, 160);
    assert!(buf[..n].iter().all(|&b| b == linear_to_ulaw(1000)));
}

#[test]
fn test_capture_22050_one_block_per_hw_block() {
    let (device, driver) = capture_device();
    let file = device.open(OpenMode::Capture).unwrap();
    device.set_format(file, Format::internal(1, 22050)).unwrap();
    assert_eq!(
        device.stages(file, Direction::Capture).unwrap(),
        vec![StageKind::Rate, StageKind::ChannelMix]
    );

    let mut buf = vec![0u8; 1024];
    for block in 0..10 {
        assert!(driver.complete_input(&hw_block(1000)));
        assert_eq!(device.readable_bytes(file).unwrap(), 221 * 2, "block {block}");
        assert_eq!(device.read(file, &mut buf).unwrap(), 221 * 2);
        let samples: Vec<i16> = buf[..221 * 2]
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert!(samples.iter().all(|&s| s == 1000));
    }
}

#[test]
fn test_nonblocking_write_would_block() {
    let (device, _driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_nonblocking(file, true).unwrap();

    let data = vec![0xFFu8; 100_000];
    let n = device.write(file, &data).unwrap();
    assert!(n > 0 && n < data.len());
    assert_eq!(device.write(file, &data), Err(Error::WouldBlock));

    let capture = SimulatedDriver::new(None, Some(HW));
    let device = Device::new(capture, DeviceConfig::default()).unwrap();
    let file = device.open(OpenMode::Capture).unwrap();
    device.set_nonblocking(file, true).unwrap();
    assert_eq!(device.read(file, &mut [0u8; 16]), Err(Error::WouldBlock));
}

#[test]
fn test_shutdown_cancels_blocked_writer() {
    let (device, _driver) = playback_device();
    let device = Arc::new(device);
    let file = device.open(OpenMode::Playback).unwrap();

    let (tx, rx) = mpsc::channel();
    let writer = {
        let device = device.clone();
        thread::spawn(move || tx.send(device.write(file, &vec![0xFFu8; 100_000])).unwrap())
    };
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    device.shutdown();
    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result, Err(Error::Cancelled));
    writer.join().unwrap();
    assert_eq!(device.write(file, &[0xFF]), Err(Error::Cancelled));
}

#[test]
fn test_device_gone_fails_calls() {
    let (device, driver) = playback_device();
    let device = Arc::new(device);
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_format(file, HW).unwrap();
    device.write(file, &hw_block(5)).unwrap();

    let (tx, rx) = mpsc::channel();
    let drainer = {
        let device = device.clone();
        thread::spawn(move || tx.send(device.drain(file)).unwrap())
    };
    driver.unplug();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Err(Error::DeviceGone));
    drainer.join().unwrap();

    assert_eq!(device.write(file, &hw_block(5)), Err(Error::DeviceGone));
    assert!(eventually(|| !driver.is_output_running()));
    device.close(file).unwrap();
}

#[test]
fn test_drain_times_out_without_hardware_progress() {
    let config = DeviceConfig {
        io_timeout_ms: 100,
        ..DeviceConfig::default()
    };
    let driver = SimulatedDriver::new(Some(HW), None);
    let device = Device::new(driver, config).unwrap();
    let file = device.open(OpenMode::Playback).unwrap();
    device.write(file, &[0xFF; 800]).unwrap();

    assert_eq!(device.drain(file), Err(Error::Timeout));
    // The forced clear leaves nothing pending.
    device.drain(file).unwrap();
}

#[test]
fn test_paused_drain_discards() {
    let (device, _driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    device.pause(file, true).unwrap();
    device.write(file, &[0xFF; 800]).unwrap();
    device.drain(file).unwrap();
    device.pause(file, false).unwrap();
    device.drain(file).unwrap();
}

#[test]
fn test_failed_format_keeps_previous() {
    let (device, _driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    let bad = Format::new(trackmix_audio::Encoding::Ulaw, 16, 1, 8000);
    assert!(matches!(device.set_format(file, bad), Err(Error::InvalidFormat(_))));
    assert_eq!(device.format(file, Direction::Playback).unwrap(), Format::ulaw_8k_mono());

    let fmt: Format = "slinear_be:44100:1:8".parse().unwrap();
    device.set_format(file, fmt).unwrap();
    // 8-bit linear has no byte order.
    assert_eq!(
        device.format(file, Direction::Playback).unwrap().to_string(),
        "slinear_le:44100:1:8"
    );
}

#[test]
fn test_channel_volumes_add_stage() {
    let (device, _driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_format(file, HW).unwrap();
    device.set_channel_volumes(file, &[256, 128]).unwrap();
    assert_eq!(
        device.stages(file, Direction::Playback).unwrap(),
        vec![StageKind::ChannelVolume]
    );
    device.set_channel_volumes(file, &[256, 256]).unwrap();
    assert!(device.stages(file, Direction::Playback).unwrap().is_empty());
}

#[test]
fn test_gain_scales_output() {
    let (device, driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_format(file, HW).unwrap();
    device.set_gain(file, 128).unwrap();
    device.write(file, &hw_block(1000)).unwrap();
    driver.complete_output();
    assert_eq!(driver.take_played(), hw_block(500));
}

#[test]
fn test_file_errors() {
    let (device, _driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    assert!(matches!(device.read(file, &mut [0u8; 4]), Err(Error::BadFile(_))));
    assert!(matches!(device.open(OpenMode::Capture), Err(Error::Unsupported(_))));

    assert_eq!(device.write(file, &[]), Ok(0));
    assert_eq!(device.stats(file, Direction::Playback).unwrap().eof_count, 1);

    device.close(file).unwrap();
    assert!(matches!(device.write(file, &[0xFF]), Err(Error::BadFile(_))));
}

#[test]
fn test_close_last_track_halts_playback() {
    let (device, driver) = playback_device();
    let a = device.open(OpenMode::Playback).unwrap();
    let b = device.open(OpenMode::Playback).unwrap();
    device.write(a, &[0xFF; 80]).unwrap();
    assert!(driver.is_output_running());

    let _clock = driver.start_clock(Duration::ZERO);
    device.close(a).unwrap();
    assert!(driver.is_output_running());
    device.close(b).unwrap();
    assert!(!driver.is_output_running());
}

#[test]
fn test_readiness_callback_reports_readable() {
    let (device, driver) = capture_device();
    let file = device.open(OpenMode::Capture).unwrap();
    let seen: Arc<Mutex<Vec<Readiness>>> = Arc::default();
    {
        let seen = seen.clone();
        device
            .register_for_readiness(file, move |_, r| seen.lock().unwrap().push(r))
            .unwrap();
    }
    driver.complete_input(&hw_block(0));
    assert!(eventually(|| seen.lock().unwrap().iter().any(|r| r.readable)));
}

struct FailingCodec;

impl HwCodec for FailingCodec {
    fn encode(&mut self, _src: &[i16], _dst: &mut [u8]) -> trackmix_audio::Result<()> {
        Err(Error::Hardware("encoder jammed".into()))
    }

    fn decode(&mut self, _src: &[u8], _dst: &mut [i16]) -> trackmix_audio::Result<()> {
        Err(Error::Hardware("decoder jammed".into()))
    }
}

#[test]
fn test_driver_codec() {
    let hw: Format = "slinear_le:48000:2:24:32".parse().unwrap();
    let driver = SimulatedDriver::new(Some(hw), None)
        .with_codecs(move |_| Some(Box::new(Converter::new(&hw)) as Box<dyn HwCodec>));
    let device = Device::new(driver.clone(), DeviceConfig::default()).unwrap();
    let file = device.open(OpenMode::Playback).unwrap();
    device.set_format(file, HW).unwrap();
    device.write(file, &hw_block(1000)).unwrap();
    driver.complete_output();

    let played = driver.take_played();
    assert_eq!(played.len(), 480 * 8);
    assert_eq!(&played[..4], &(1000i32 << 8).to_le_bytes());
}

#[test]
fn test_driver_codec_failure_emits_silence() {
    let hw: Format = "slinear_le:48000:2:24:32".parse().unwrap();
    let driver = SimulatedDriver::new(Some(hw), None)
        .with_codecs(|_| Some(Box::new(FailingCodec) as Box<dyn HwCodec>));
    let device = Device::new(driver.clone(), DeviceConfig::default()).unwrap();
    let file = device.open(OpenMode::Playback).unwrap();
    device.write(file, &[0x80; 160]).unwrap();
    driver.complete_output();

    assert!(driver.take_played().iter().all(|&b| b == 0));
    assert!(device.mixer_stats(Direction::Playback).unwrap().hw_errors >= 2);
}

#[test]
fn test_unconvertible_hardware_format_rejected() {
    let hw: Format = "ulaw:8000:1".parse().unwrap();
    let driver = SimulatedDriver::new(Some(hw), None);
    assert!(matches!(
        Device::new(driver, DeviceConfig::default()),
        Err(Error::InvalidFormat(_))
    ));
}

#[test]
fn test_driver_without_directions_rejected() {
    let driver = SimulatedDriver::new(None, None);
    assert!(matches!(
        Device::new(driver, DeviceConfig::default()),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn test_set_hardware_format_rebuilds_tracks() {
    let (device, driver) = playback_device();
    let file = device.open(OpenMode::Playback).unwrap();
    device.write(file, &[0xFF; 800]).unwrap();
    device.set_hardware_format(Some(HW), None).unwrap();
    assert!(!driver.is_output_running());
    assert_eq!(device.hardware_format(Direction::Playback).unwrap(), HW);
    // Pending data was discarded with the old layout.
    device.drain(file).unwrap();
    assert_eq!(device.stats(file, Direction::Playback).unwrap().user_bytes, 800);
}
