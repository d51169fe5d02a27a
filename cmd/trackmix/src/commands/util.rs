//! Utility functions for CLI commands.

use std::time::Duration;

use anyhow::Context;
use trackmix_audio::{Converter, Device, DeviceConfig, Direction, FileId, Format, SimulatedDriver};

use crate::Cli;

/// Loads the device config named by `--config`, or the defaults.
pub fn get_config(cli: &Cli) -> anyhow::Result<DeviceConfig> {
    match cli.config.as_deref() {
        Some(path) => DeviceConfig::load(path).with_context(|| format!("loading config {path}")),
        None => Ok(DeviceConfig::default()),
    }
}

/// Grows the user buffer so `bytes` of `format` fit without blocking.
pub fn size_for(config: &mut DeviceConfig, format: &Format, bytes: usize) {
    let frames = (format.sample_rate as usize * config.block_ms as usize).div_ceil(1000);
    let block = frames * format.frame_bytes();
    config.user_buffer_bytes = config.user_buffer_bytes.max(bytes + block);
}

/// Opens a device on a simulated driver with playback at `hw`, or at the
/// configured playback format.
pub fn open_device(mut config: DeviceConfig, hw: Option<Format>) -> anyhow::Result<(Device, SimulatedDriver)> {
    if let Some(hw) = hw {
        config.playback = hw;
        config.capture = hw;
    }
    let driver = SimulatedDriver::new(Some(config.playback), Some(config.capture));
    let device = Device::new(driver.clone(), config).context("opening simulated device")?;
    Ok((device, driver))
}

pub fn read_input(path: &str) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {path}"))
}

/// Queues every input on its file, then lets the simulated hardware run
/// until each file has drained. Returns the raw hardware stream.
pub fn render(device: &Device, driver: &SimulatedDriver, inputs: &[(FileId, Vec<u8>)]) -> anyhow::Result<Vec<u8>> {
    for (file, data) in inputs {
        device.write(*file, data).with_context(|| format!("writing to {file}"))?;
    }
    let clock = driver.start_clock(Duration::ZERO);
    for (file, _) in inputs {
        device.drain(*file).with_context(|| format!("draining {file}"))?;
    }
    drop(clock);
    Ok(driver.take_played())
}

/// Drops whole trailing blocks of hardware silence.
pub fn trim_silence(device: &Device, mut played: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let hw = device.hardware_format(Direction::Playback)?;
    let frames = (hw.sample_rate as usize * device.config().block_ms as usize).div_ceil(1000);
    let mut silence = vec![0u8; frames * hw.frame_bytes()];
    Converter::new(&hw).encode(&vec![0i16; frames * hw.channels as usize], &mut silence);
    while played.len() >= silence.len() && played.ends_with(&silence) {
        played.truncate(played.len() - silence.len());
    }
    Ok(played)
}

/// Writes binary data to a file.
pub fn output_bytes(data: &[u8], output_path: &str) -> anyhow::Result<()> {
    std::fs::write(output_path, data).with_context(|| format!("writing {output_path}"))?;
    Ok(())
}
