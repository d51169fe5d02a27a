//! `trackmix play`: one file through one playback track.

use clap::Args;
use trackmix_audio::{Direction, Format, OpenMode};

use super::{get_config, open_device, output_bytes, read_input, render, size_for};
use crate::Cli;

/// Render one raw file through a playback track.
#[derive(Args)]
pub struct PlayCommand {
    /// Raw input file
    #[arg(short, long)]
    input: String,
    /// Format of the input file
    #[arg(long, default_value = "ulaw:8000:1")]
    format: Format,
    /// Hardware format (overrides the config file)
    #[arg(long)]
    hw: Option<Format>,
    /// Raw output file for the hardware stream
    #[arg(short, long)]
    output: String,
    /// Track gain, 0 to 256
    #[arg(long, default_value_t = 256)]
    gain: u16,
}

impl PlayCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let data = read_input(&self.input)?;
        let mut config = get_config(cli)?;
        size_for(&mut config, &self.format, data.len());
        let (device, driver) = open_device(config, self.hw)?;

        let file = device.open(OpenMode::Playback)?;
        device.set_format(file, self.format)?;
        device.set_gain(file, self.gain)?;
        tracing::debug!(stages = ?device.stages(file, Direction::Playback)?, "track ready");

        let played = render(&device, &driver, &[(file, data)])?;
        let hw = device.hardware_format(Direction::Playback)?;
        let stats = device.stats(file, Direction::Playback)?;
        let len = (stats.output_frames as usize * hw.frame_bytes()).min(played.len());
        output_bytes(&played[..len], &self.output)?;
        device.close(file)?;

        println!(
            "{} -> {}: {} bytes in, {} frames out at {hw}",
            self.input, self.output, stats.user_bytes, stats.output_frames
        );
        Ok(())
    }
}
