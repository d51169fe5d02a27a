//! `trackmix pipeline`: stage listing.

use clap::Args;
use trackmix_audio::{Direction, Format, OpenMode};

use super::{get_config, open_device};
use crate::Cli;

/// Print the conversion stages a track in this format needs, in both
/// directions.
#[derive(Args)]
pub struct PipelineCommand {
    /// Track format
    #[arg(long)]
    format: Format,
    /// Hardware format (overrides the config file)
    #[arg(long)]
    hw: Option<Format>,
}

impl PipelineCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let (device, _driver) = open_device(get_config(cli)?, self.hw)?;
        let file = device.open(OpenMode::Duplex)?;
        device.set_format(file, self.format)?;
        let format = device.format(file, Direction::Playback)?;

        for direction in [Direction::Playback, Direction::Capture] {
            let hw = device.hardware_format(direction)?;
            let stages = device.stages(file, direction)?;
            let stages = if stages.is_empty() {
                "(none)".to_string()
            } else {
                stages.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>().join(" -> ")
            };
            println!("{:<8} {format} <-> {hw}: {stages}", direction.to_string());
        }
        device.close(file)?;
        Ok(())
    }
}
