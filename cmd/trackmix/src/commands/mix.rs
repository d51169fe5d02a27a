//! `trackmix mix`: several files through concurrent playback tracks.

use clap::Args;
use trackmix_audio::{Direction, Format, OpenMode};

use super::{get_config, open_device, output_bytes, read_input, render, size_for, trim_silence};
use crate::Cli;

/// Render several raw files, all in one format, through separate playback
/// tracks and report gain control activity. Trailing silent blocks are
/// trimmed from the output.
#[derive(Args)]
pub struct MixCommand {
    /// Raw input files
    #[arg(short, long, num_args = 1.., required = true)]
    input: Vec<String>,
    /// Format of every input file
    #[arg(long, default_value = "ulaw:8000:1")]
    format: Format,
    /// Raw output file for the hardware stream
    #[arg(short, long)]
    output: String,
}

impl MixCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let data = self
            .input
            .iter()
            .map(|path| read_input(path))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut config = get_config(cli)?;
        let largest = data.iter().map(Vec::len).max().unwrap_or(0);
        size_for(&mut config, &self.format, largest);
        let (device, driver) = open_device(config, None)?;

        let mut inputs = Vec::with_capacity(data.len());
        for bytes in data {
            let file = device.open(OpenMode::Playback)?;
            device.set_format(file, self.format)?;
            inputs.push((file, bytes));
        }

        let played = trim_silence(&device, render(&device, &driver, &inputs)?)?;
        output_bytes(&played, &self.output)?;

        for ((file, _), path) in inputs.iter().zip(&self.input) {
            let stats = device.stats(*file, Direction::Playback)?;
            println!("{path}: {} frames, {} underruns", stats.output_frames, stats.underruns);
        }
        let mixer = device.mixer_stats(Direction::Playback)?;
        println!(
            "mixed {} tracks into {} blocks: {} AGC events, volume {}/256",
            mixer.tracks, mixer.hw_blocks, mixer.agc_events, mixer.volume
        );
        for (file, _) in &inputs {
            device.close(*file)?;
        }
        Ok(())
    }
}
